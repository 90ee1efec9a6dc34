//! `rcsh`: an interactive session around [`rcinterp::Interpreter`].
//!
//! Reads lines through rustyline (history, Ctrl-C cancels the current line,
//! Ctrl-D ends the session), or runs a script / `-c` command line
//! non-interactively.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::{self, BufReader};
use std::process::ExitCode;
use std::rc::Rc;

use argh::FromArgs;
use lexopt::prelude::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use rcinterp::{
    flag_parser, Cmd, CmdFn, CmdMap, Interpreter, LinesScanner, Scanner, StringScanner,
};

#[derive(FromArgs)]
/// Interactive rc-style command interpreter.
struct Args {
    /// run a single command line and exit
    #[argh(option, short = 'c')]
    command: Option<String>,

    /// prompt shown before each interactive line
    #[argh(option, default = "String::from(\"% \")")]
    prompt: String,

    /// script to execute instead of reading interactively
    #[argh(positional)]
    script: Option<String>,
}

/// Feeds rustyline-edited lines to the interpreter. The interpreter decides
/// what the prompt is (it blanks it while sourcing); the shared cell carries
/// the current value over to the line editor.
struct EditorScanner {
    rl: DefaultEditor,
    prompt: Rc<RefCell<String>>,
}

impl Scanner for EditorScanner {
    fn next_line(&mut self) -> Option<io::Result<String>> {
        let prompt = self.prompt.borrow().clone();
        match self.rl.readline(&prompt) {
            Ok(line) => {
                let _ = self.rl.add_history_entry(line.as_str());
                Some(Ok(line))
            }
            // Ctrl-C drops the line being edited and shows a new prompt.
            Err(ReadlineError::Interrupted) => Some(Ok(String::new())),
            Err(ReadlineError::Eof) => None,
            Err(err) => Some(Err(io::Error::other(err))),
        }
    }
}

/// A sample user command demonstrating the option-parsing hook: the hook
/// gets a fresh parser per invocation and leaves the positional arguments
/// for the arity check.
fn demo_commands() -> CmdMap {
    let shout = Rc::new(Cell::new(false));
    let shout_seen = Rc::clone(&shout);
    let mut m = CmdMap::new();
    m.insert(
        "greet".to_string(),
        Cmd {
            arg: vec!["NAME".to_string()],
            flags: "[-s]".to_string(),
            init_flags: Some(Rc::new(move |args: &[String]| {
                shout_seen.set(false);
                let mut rest = Vec::new();
                let mut parser = flag_parser(args);
                while let Some(arg) = parser.next()? {
                    match arg {
                        Short('s') | Long("shout") => shout_seen.set(true),
                        Value(v) => rest.push(v.string()?),
                        arg => return Err(arg.unexpected().into()),
                    }
                }
                Ok(rest)
            })),
            run: Some(CmdFn::user(move |ctx, args| {
                let mut greeting = format!("hello, {}", args[1]);
                if shout.get() {
                    greeting = greeting.to_uppercase();
                }
                ctx.println(&greeting)?;
                Ok(())
            })),
            help: "Greet somebody; -s shouts.".to_string(),
            group: "Demo".to_string(),
            ..Cmd::default()
        },
    );
    m
}

fn run() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    let cmd_map = demo_commands();

    if let Some(command) = &args.command {
        let mut interp = Interpreter::new(StringScanner::new(command), cmd_map);
        return interp.process();
    }
    if let Some(script) = &args.script {
        let file = File::open(script)?;
        let mut interp = Interpreter::new(LinesScanner::new(BufReader::new(file)), cmd_map);
        return interp.process();
    }

    let prompt = Rc::new(RefCell::new(String::new()));
    let scanner = EditorScanner {
        rl: DefaultEditor::new()?,
        prompt: Rc::clone(&prompt),
    };
    let mut interp = Interpreter::new(scanner, cmd_map)
        .with_prompt(args.prompt)
        .with_write_prompt(move |p: &str| {
            *prompt.borrow_mut() = p.to_string();
            Ok(())
        });
    interp.process()
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("rcsh: {}", err);
            ExitCode::FAILURE
        }
    }
}
