//! Command descriptors and the context commands run with.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use anyhow::Result;

use crate::env::Env;
use crate::interpreter::Interpreter;
use crate::interrupt::Interrupter;
use crate::writer::Writer;

/// Registry of commands by name. Names containing `.` are resolved by
/// descending through [`Cmd::map`] sub-registries.
pub type CmdMap = HashMap<String, Cmd>;

/// A command registered by the embedder.
pub type UserFn = Rc<dyn Fn(&mut Context, &[String]) -> Result<()>>;

/// A builtin; takes the interpreter itself so it can push input frames,
/// manipulate the environment stack, or set interpreter flags.
pub type BuiltinFn = fn(&mut Interpreter, &mut Context, &[String]) -> Result<()>;

/// An option-parsing hook run before arity checking on every invocation; it
/// receives the raw arguments and returns the remaining positional ones.
/// Implementations typically drive a fresh [`lexopt`] parser (see
/// [`flag_parser`]); no state may be carried across invocations.
pub type InitFlagsFn = Rc<dyn Fn(&[String]) -> Result<Vec<String>>>;

#[derive(Clone)]
pub enum CmdFn {
    User(UserFn),
    Builtin(BuiltinFn),
}

impl CmdFn {
    /// Wrap a closure as a user command body.
    pub fn user<F>(f: F) -> Self
    where
        F: Fn(&mut Context, &[String]) -> Result<()> + 'static,
    {
        CmdFn::User(Rc::new(f))
    }
}

impl fmt::Debug for CmdFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmdFn::User(_) => f.write_str("CmdFn::User"),
            CmdFn::Builtin(_) => f.write_str("CmdFn::Builtin"),
        }
    }
}

/// Describes one command: how to run it, how to validate its arguments, and
/// how to present it in `help` output.
#[derive(Clone, Default)]
pub struct Cmd {
    /// Sub-commands reachable as `name.sub`. A map-carrying command is only
    /// directly callable if the map has an entry under the empty name.
    pub map: Option<CmdMap>,
    pub run: Option<CmdFn>,
    /// Required argument names; a trailing `"..."` makes the list open-ended.
    pub arg: Vec<String>,
    /// Optional argument names; a trailing `"..."` makes the list open-ended.
    pub opt: Vec<String>,
    pub help: String,
    /// Hide from directory-style `help` listings.
    pub hidden: bool,
    /// Heading under which `help` lists the command.
    pub group: String,
    /// Extra text shown between the name and the arguments in `help`.
    pub flags: String,
    pub init_flags: Option<InitFlagsFn>,
    /// Skip the inline-assignment environment push for this command.
    pub ignore_env: bool,
    /// Report success to the session even when the body fails; the failure
    /// still lands in `last_ok`.
    pub hide_failure: bool,
    /// Leave `last_ok` untouched by this command's outcome.
    pub weak_status: bool,
    /// Marks a command that orchestrates sub-commands: exempt from `flag e`
    /// termination and from `flag x` echoing.
    pub is_compound: bool,
}

/// Whether `n` arguments satisfy the descriptor's arity declaration.
pub(crate) fn arity_ok(cmd: &Cmd, n: usize) -> bool {
    let narg = cmd.arg.len();
    let nopt = cmd.opt.len();
    if narg > 0 && cmd.arg[narg - 1] == "..." {
        return n + 1 >= narg;
    }
    if nopt > 1 && cmd.opt[nopt - 1] == "..." {
        return n >= narg;
    }
    n >= narg && n <= narg + nopt
}

/// Build a fresh option parser over `args` for an [`InitFlagsFn`] hook.
pub fn flag_parser(args: &[String]) -> lexopt::Parser {
    lexopt::Parser::from_args(args.iter().cloned())
}

/// What a running command sees: the (possibly redirected) writer, the
/// interrupt token, and read access to the environment.
pub struct Context {
    w: Writer,
    intr: Interrupter,
    env: Rc<RefCell<Env>>,
}

impl Context {
    pub(crate) fn new(w: Writer, intr: Interrupter, env: Rc<RefCell<Env>>) -> Self {
        Self { w, intr, env }
    }

    /// First value of a variable, or the empty string.
    pub fn getenv(&self, name: &str) -> String {
        self.env.borrow().getenv(name)
    }

    /// Whether an interrupt is pending for this command.
    pub fn interrupted(&self) -> bool {
        self.intr.is_pending()
    }

    /// The interrupt token, for commands that block.
    pub fn interrupter(&self) -> &Interrupter {
        &self.intr
    }

    pub fn writer(&mut self) -> &mut Writer {
        &mut self.w
    }

    pub fn printf(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.w.printf(args)
    }

    pub fn println(&mut self, line: &str) -> io::Result<()> {
        self.w.println(line)
    }

    pub fn print_slice(&mut self, fields: &[String]) -> io::Result<()> {
        self.w.print_slice(fields)
    }
}

impl Write for Context {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.w.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

pub(crate) fn svec(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
