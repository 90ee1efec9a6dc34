//! String handling that mimics the style of the Plan 9 rc shell.
//!
//! This crate provides the pieces a line-oriented command interpreter needs
//! before it can dispatch anything: splitting a line into fields with rc's
//! single-quote rules ([`tokenize`]), full command-line analysis with variable
//! expansion, assignment prefixes and redirections
//! ([`Tokenizer::parse_cmd_line`]), quoting values back into a form the
//! tokenizer will round-trip ([`quote`], [`join`]), and the stack of
//! environment frames that variable expansion reads from ([`EnvStack`]).

mod env;
mod quote;
mod tokenize;

pub use env::{EnvMap, EnvStack};
pub use quote::{join, join_cmd, needs_quote, quote, quote_cmd};
pub use tokenize::{raw_fields, tokenize, CmdLine, RawField, Redirection, TokenError, Tokenizer};
