//! An embeddable, interactive command interpreter in the style of the Plan 9
//! rc shell.
//!
//! The embedder supplies a line [`Scanner`] and a [`CmdMap`] of commands; the
//! [`Interpreter`] tokenizes each line with [`rcstring`], expands variables
//! against its environment stack, and dispatches. Builtins provide sourcing
//! (`.`), user-defined functions (`fn`), conditionals (`if` / `if not`),
//! negation (`!`), loops (`repeat`), pattern matching (`~`), output
//! redirection (`>` / `>>`) and more; an [`Interrupter`] handle delivers
//! asynchronous interrupts that unwind the input stack back to the prompt.
//!
//! ```no_run
//! use rcinterp::{CmdMap, Interpreter, LinesScanner};
//! use std::io::BufReader;
//!
//! let stdin = LinesScanner::new(BufReader::new(std::io::stdin()));
//! let mut interp = Interpreter::new(stdin, CmdMap::new()).with_prompt("% ");
//! interp.process().unwrap();
//! ```

mod builtin;
mod command;
mod env;
mod interpreter;
mod interrupt;
mod scan;
mod template;
mod writer;

pub use command::{flag_parser, BuiltinFn, Cmd, CmdFn, CmdMap, Context, InitFlagsFn, UserFn};
pub use env::Env;
pub use interpreter::{FnError, InterpError, Interpreter, RedirMode};
pub use interrupt::Interrupter;
pub use scan::{LinesScanner, Scanner, SpawnedScanner, StringScanner};
pub use writer::{RedirFile, Writer};
