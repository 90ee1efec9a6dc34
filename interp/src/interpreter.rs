//! The interpreter: a dispatch loop over a nested input stack.
//!
//! One [`Interpreter`] reads lines from the scanner it was constructed with,
//! parses each through [`rcstring`], and dispatches the first field against
//! its registries: user functions, then the embedder's command map, then the
//! builtins. Builtins like `.`, `fn`, `if` and `repeat` push further input
//! frames (files, function bodies, condition chains, rewindable loops) onto
//! the input stack; the loop keeps reading from whatever frame is on top
//! until the stack runs dry or `exit` is called.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use thiserror::Error;

use rcstring::{CmdLine, RawField, Redirection, Tokenizer};

use crate::builtin::builtin_map;
use crate::command::{arity_ok, Cmd, CmdFn, CmdMap, Context};
use crate::env::Env;
use crate::interrupt::Interrupter;
use crate::scan::{Scanner, StringScanner};
use crate::template::TemplateMap;
use crate::writer::{RedirFile, Sink, Writer};

const DEFAULT_GROUP: &str = "ZZY__Other commands";

/// Failures with specific meaning to the dispatch loop.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpError {
    #[error("interrupted")]
    Interrupted,
    #[error("last command failed")]
    LastCmdFailed,
    #[error("no such command")]
    NotFound,
    #[error("wrong number of arguments")]
    WrongNArg,
}

/// A command failure carrying the name of the command that produced it.
#[derive(Debug)]
pub struct FnError {
    pub name: String,
    pub source: anyhow::Error,
}

impl fmt::Display for FnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.source)
    }
}

impl std::error::Error for FnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// How a redirection target is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirMode {
    Truncate,
    Append,
}

/// Loop bookkeeping for `repeat`: a remaining count and/or a deadline.
pub(crate) struct Repetition {
    n: u64,
    deadline: Option<Instant>,
}

impl Repetition {
    pub(crate) fn new(n: u64, deadline: Option<Instant>) -> Self {
        Self { n, deadline }
    }

    /// Account for one finished iteration; true when the loop is exhausted.
    fn done(&mut self) -> bool {
        if self.n > 1 {
            self.n -= 1;
            return false;
        }
        if self.n == 0 {
            if let Some(end) = self.deadline {
                return Instant::now() > end;
            }
        }
        true
    }
}

fn repetition_done(r: &mut Option<Repetition>) -> bool {
    match r {
        None => true,
        Some(r) => r.done(),
    }
}

/// One layer of the input stack: a line source plus its bookkeeping.
pub(crate) struct Frame {
    pub(crate) reader: Box<dyn Scanner>,
    pub(crate) repetition: Option<Repetition>,
    pub(crate) rewind: Option<Box<dyn Fn() -> Box<dyn Scanner>>>,
    pub(crate) w: Writer,
    /// Pop an environment frame when this input frame pops.
    pub(crate) pop_env: bool,
    /// Restore this `*` list when this input frame pops.
    pub(crate) saved_args: Option<Vec<String>>,
    pub(crate) is_func: bool,
    pub(crate) is_compound: bool,
    /// The pending body of an `if` whose condition is running in this frame.
    pub(crate) cond_cmd: String,
    /// The recorded outcome of the last `if` condition, read by `if not`.
    pub(crate) cond_result: Option<bool>,
}

impl Frame {
    fn new(reader: Box<dyn Scanner>, w: Writer) -> Self {
        Self {
            reader,
            repetition: None,
            rewind: None,
            w,
            pop_env: false,
            saved_args: None,
            is_func: false,
            is_compound: false,
            cond_cmd: String::new(),
            cond_result: None,
        }
    }

    pub(crate) fn is_loop(&self) -> bool {
        self.repetition.is_some()
    }
}

enum LineRead {
    Line(String),
    Eof,
    Intr,
    Failed(io::Error),
}

/// The interactive command interpreter.
pub struct Interpreter {
    cur: Frame,
    input_stack: Vec<Frame>,
    pub(crate) last_ok: bool,
    saved_prompt: String,
    pub(crate) env: Rc<RefCell<Env>>,
    templates: Rc<RefCell<TemplateMap>>,

    cmd_map: CmdMap,
    builtin: CmdMap,
    pub(crate) func_map: BTreeMap<String, String>,
    init_rc: Option<Box<dyn Scanner>>,
    pub(crate) flag_e: bool,
    pub(crate) flag_x: bool,
    extra_help: Option<Box<dyn FnMut()>>,
    default_group: String,
    prompt: String,
    write_prompt: Option<Box<dyn FnMut(&str) -> io::Result<()>>>,

    stdout: Rc<RefCell<Box<dyn Write>>>,
    err_out: Rc<RefCell<Box<dyn Write>>>,
    forward: Option<Box<dyn Write>>,
    handle_error: Option<Box<dyn FnMut(&anyhow::Error)>>,
    open: Box<dyn Fn(&str) -> io::Result<Box<dyn Read>>>,
    cmd_hook: Option<Box<dyn FnMut(&mut Context)>>,

    intr: Interrupter,
    pub(crate) exit_flag: bool,
    open_redir: Box<dyn Fn(&str, RedirMode) -> io::Result<Box<dyn RedirFile>>>,
    redir_files: HashMap<String, Rc<RefCell<Box<dyn RedirFile>>>>,

    /// The raw text of the line currently being dispatched; block-bodied
    /// builtins carve their bodies out of it.
    pub(crate) cur_line: String,
}

impl Interpreter {
    /// Build an interpreter reading from `scanner` and dispatching against
    /// `cmd_map` (with the builtins as fallback at the root).
    pub fn new(scanner: impl Scanner + 'static, mut cmd_map: CmdMap) -> Self {
        let builtin = builtin_map();
        if !cmd_map.contains_key("builtin") {
            cmd_map.insert(
                "builtin".to_string(),
                Cmd {
                    map: Some(builtin.clone()),
                    help: "Built-in commands.\nMay be called without the `builtin.' prefix."
                        .to_string(),
                    ..Cmd::default()
                },
            );
        }
        let stdout: Rc<RefCell<Box<dyn Write>>> = Rc::new(RefCell::new(Box::new(io::stdout())));
        let err_out: Rc<RefCell<Box<dyn Write>>> = Rc::new(RefCell::new(Box::new(io::stderr())));
        let env = Rc::new(RefCell::new(Env::new()));
        let templates = Rc::new(RefCell::new(TemplateMap::new(16)));
        let w = Writer::new(
            Sink::Stream(Rc::clone(&stdout)),
            Rc::clone(&env),
            Rc::clone(&templates),
        );
        Self {
            cur: Frame::new(Box::new(scanner), w),
            input_stack: Vec::new(),
            last_ok: true,
            saved_prompt: String::new(),
            env,
            templates,
            cmd_map,
            builtin,
            func_map: BTreeMap::new(),
            init_rc: None,
            flag_e: false,
            flag_x: false,
            extra_help: None,
            default_group: String::new(),
            prompt: String::new(),
            write_prompt: None,
            stdout,
            err_out,
            forward: None,
            handle_error: None,
            open: Box::new(|name| {
                std::fs::File::open(name).map(|f| Box::new(f) as Box<dyn Read>)
            }),
            cmd_hook: None,
            intr: Interrupter::new(),
            exit_flag: false,
            open_redir: Box::new(default_open_redir),
            redir_files: HashMap::new(),
            cur_line: String::new(),
        }
    }

    pub fn with_stdout(mut self, w: Box<dyn Write>) -> Self {
        self.stdout = Rc::new(RefCell::new(w));
        self
    }

    pub fn with_stderr(mut self, w: Box<dyn Write>) -> Self {
        self.err_out = Rc::new(RefCell::new(w));
        self
    }

    /// Share an environment with the embedder (or between sessions).
    pub fn with_env(mut self, env: Rc<RefCell<Env>>) -> Self {
        self.env = env;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Re-emit lines whose command is not found (and a bare `help`) to `w`
    /// instead of reporting an error.
    pub fn with_forward(mut self, w: Box<dyn Write>) -> Self {
        self.forward = Some(w);
        self
    }

    /// Commands sourced before the first line is read.
    pub fn with_init_script(mut self, scanner: impl Scanner + 'static) -> Self {
        self.init_rc = Some(Box::new(scanner));
        self
    }

    /// Replace the file opener used by `.` and `cat`.
    pub fn with_open(
        mut self,
        open: impl Fn(&str) -> io::Result<Box<dyn Read>> + 'static,
    ) -> Self {
        self.open = Box::new(open);
        self
    }

    /// Replace the opener for redirection targets.
    pub fn with_open_redir(
        mut self,
        open: impl Fn(&str, RedirMode) -> io::Result<Box<dyn RedirFile>> + 'static,
    ) -> Self {
        self.open_redir = Box::new(open);
        self
    }

    /// Route reported errors through `handler` instead of standard error.
    pub fn with_error_handler(mut self, handler: impl FnMut(&anyhow::Error) + 'static) -> Self {
        self.handle_error = Some(Box::new(handler));
        self
    }

    /// Called with the context each time before a command runs.
    pub fn with_cmd_hook(mut self, hook: impl FnMut(&mut Context) + 'static) -> Self {
        self.cmd_hook = Some(Box::new(hook));
        self
    }

    /// Replace how the prompt is presented (a line editor, say).
    pub fn with_write_prompt(
        mut self,
        hook: impl FnMut(&str) -> io::Result<()> + 'static,
    ) -> Self {
        self.write_prompt = Some(Box::new(hook));
        self
    }

    pub fn with_default_group(mut self, group: impl Into<String>) -> Self {
        self.default_group = group.into();
        self
    }

    /// Appended to every `help` listing.
    pub fn with_extra_help(mut self, hook: impl FnMut() + 'static) -> Self {
        self.extra_help = Some(Box::new(hook));
        self
    }

    /// A handle for delivering asynchronous interrupts from other threads.
    pub fn interrupter(&self) -> Interrupter {
        self.intr.clone()
    }

    /// Whether the most recent status-bearing command succeeded.
    pub fn last_ok(&self) -> bool {
        self.last_ok
    }

    /// The shared environment handle.
    pub fn env(&self) -> Rc<RefCell<Env>> {
        Rc::clone(&self.env)
    }

    /// Run the dispatch loop until the input is exhausted, `exit` is called,
    /// or a top-level interrupt arrives.
    pub fn process(&mut self) -> Result<()> {
        *self.templates.borrow_mut() = TemplateMap::new(16);
        self.cur.w = self.new_writer(Sink::Stream(Rc::clone(&self.stdout)));
        let result = self.process_loop();
        // Session end releases every cached redirection target.
        self.redir_files.clear();
        result
    }

    fn process_loop(&mut self) -> Result<()> {
        if let Some(rc) = self.init_rc.take() {
            let w = self.cur.w.clone();
            self.push_frame(rc, None, None, w);
        }
        loop {
            if self.exit_flag {
                break;
            }
            self.put_prompt();
            match self.read_line() {
                LineRead::Intr => {
                    self.intr.take();
                    if self.input_stack.is_empty() {
                        return Err(InterpError::Interrupted.into());
                    }
                    self.report_error(&InterpError::Interrupted.into());
                    self.pop_all_frames();
                }
                LineRead::Failed(err) => return Err(err.into()),
                LineRead::Eof => {
                    if !self.input_stack.is_empty() {
                        if !repetition_done(&mut self.cur.repetition) {
                            let fresh = self.cur.rewind.as_ref().map(|rewind| rewind());
                            if let Some(reader) = fresh {
                                self.cur.reader = reader;
                                continue;
                            }
                        }
                        self.pop_frame();
                        continue;
                    }
                    if self.flag_e && !self.last_ok {
                        return Err(InterpError::LastCmdFailed.into());
                    }
                    return Ok(());
                }
                LineRead::Line(line) => self.dispatch_line(line),
            }
        }
        if self.flag_e && !self.last_ok {
            return Err(InterpError::LastCmdFailed.into());
        }
        Ok(())
    }

    /// Read the next line from the current frame, observing interrupts
    /// before and after the read.
    fn read_line(&mut self) -> LineRead {
        if self.intr.is_pending() {
            return LineRead::Intr;
        }
        match self.cur.reader.next_line() {
            Some(Ok(line)) => LineRead::Line(line),
            Some(Err(err)) => LineRead::Failed(err),
            // An interrupt-aware scanner abandons its read with `None`;
            // check the flag before calling it end of input.
            None => {
                if self.intr.is_pending() {
                    LineRead::Intr
                } else {
                    LineRead::Eof
                }
            }
        }
    }

    fn dispatch_line(&mut self, mut line: String) {
        if !self.prompt.is_empty() {
            // Lines pasted from a transcript may carry the prompt (several
            // times, even).
            while let Some(rest) = line.strip_prefix(&self.prompt) {
                line = rest.to_string();
            }
        }
        self.cur_line = line.clone();

        let parsed = {
            let env = self.env.borrow();
            let getenv = |name: &str| env.stack().get(name);
            let tok = Tokenizer {
                getenv: Some(&getenv),
            };
            tok.parse_cmd_line(&line)
        };
        let c = match parsed {
            Ok(c) => c,
            Err(err) => {
                self.fail("", err.into());
                return;
            }
        };

        let mut w = self.cur.w.clone();
        if !c.redir.kind.is_empty() {
            match self.redirect(&c.redir) {
                Ok(rw) => w = rw,
                Err(err) => {
                    self.fail("", err);
                    return;
                }
            }
        }

        let mut args = c.fields.clone();
        if args.is_empty() {
            if !c.assignments.is_empty() {
                if self.flag_x {
                    self.print_cmd(&c);
                }
                self.env.borrow_mut().stack_mut().insert(c.assignments);
                return;
            }
            if self.forward.is_some() {
                self.forward_line("\n");
            }
            return;
        }
        let priv_env = !c.assignments.is_empty();
        let name = args[0].clone();

        if let Some(body) = self.func_map.get(&name).cloned() {
            if priv_env {
                self.env
                    .borrow_mut()
                    .stack_mut()
                    .push(c.assignments.clone());
            }
            self.push_string_frame(&body, w);
            if priv_env {
                self.cur.pop_env = true;
            } else {
                self.cur.saved_args = Some(self.env.borrow().stack().get("*"));
            }
            self.env
                .borrow_mut()
                .stack_mut()
                .set("*", args[1..].to_vec());
            self.cur.is_func = true;
            if self.flag_x {
                self.print_cmd(&c);
            }
            return;
        }

        if name == "help" {
            self.help(&args[1..]);
            if self.forward.is_some() {
                self.forward_line("help\n");
            }
            return;
        }

        let cmd = match self.lookup(&name) {
            Ok(cmd) => cmd,
            Err(err) => {
                if self.forward.is_some() {
                    let fl = format!("{}\n", self.cur_line);
                    self.forward_line(&fl);
                } else {
                    self.fail(&name, err);
                }
                return;
            }
        };

        if let Some(hook) = cmd.init_flags.clone() {
            match hook(&args[1..]) {
                Ok(rest) => {
                    args.truncate(1);
                    args.extend(rest);
                }
                Err(err) => {
                    self.fail(&name, err);
                    return;
                }
            }
        }
        if !arity_ok(&cmd, args.len() - 1) {
            self.fail(&name, InterpError::WrongNArg.into());
            return;
        }
        let run = match cmd.run.clone() {
            Some(run) => run,
            None => {
                self.fail(&name, InterpError::NotFound.into());
                return;
            }
        };

        let pushed_env = priv_env && !cmd.ignore_env;
        if pushed_env {
            self.env
                .borrow_mut()
                .stack_mut()
                .push(c.assignments.clone());
        }
        let mut ctx = Context::new(w, self.intr.clone(), Rc::clone(&self.env));
        if let Some(hook) = &mut self.cmd_hook {
            hook(&mut ctx);
        }
        if self.flag_x && !cmd.hidden && !cmd.is_compound {
            self.print_cmd(&c);
        }

        let mut err = match run {
            CmdFn::Builtin(f) => f(self, &mut ctx, &args).err(),
            CmdFn::User(f) => f(&mut ctx, &args).err(),
        };
        if self.intr.take() && err.is_none() {
            err = Some(InterpError::Interrupted.into());
        }
        if !cmd.weak_status {
            self.last_ok = err.is_none();
        }
        self.cur.cond_result = None;
        if cmd.hide_failure {
            err = None;
        }
        if pushed_env {
            self.env.borrow_mut().stack_mut().pop();
        }
        if let Some(err) = err {
            if matches!(
                err.downcast_ref::<InterpError>(),
                Some(InterpError::Interrupted)
            ) {
                self.pop_all_frames();
            }
            self.fail(&name, err);
        }
    }

    /// Resolve `name` against the user map (builtins at the root only),
    /// descending through dotted sub-maps.
    fn lookup(&self, name: &str) -> Result<Cmd> {
        let mut m = &self.cmd_map;
        let mut is_root = true;
        let mut cmd_name = name;
        let cmd = loop {
            let mut found = m.get(cmd_name);
            if found.is_none() && is_root {
                found = self.builtin.get(cmd_name);
            }
            if let Some(cmd) = found {
                break cmd;
            }
            let descend = cmd_name.find('.').and_then(|i| {
                m.get(&cmd_name[..i])
                    .and_then(|dir| dir.map.as_ref())
                    .map(|sub| (sub, i))
            });
            match descend {
                Some((sub, i)) => {
                    m = sub;
                    cmd_name = &cmd_name[i + 1..];
                    is_root = false;
                }
                None => return Err(InterpError::NotFound.into()),
            }
        };
        if let Some(sub) = &cmd.map {
            return sub
                .get("")
                .cloned()
                .ok_or_else(|| InterpError::NotFound.into());
        }
        Ok(cmd.clone())
    }

    pub(crate) fn push_frame(
        &mut self,
        reader: Box<dyn Scanner>,
        repetition: Option<Repetition>,
        rewind: Option<Box<dyn Fn() -> Box<dyn Scanner>>>,
        w: Writer,
    ) {
        let mut frame = Frame::new(reader, w);
        frame.repetition = repetition;
        frame.rewind = rewind;
        let prev = std::mem::replace(&mut self.cur, frame);
        self.input_stack.push(prev);
        if !self.prompt.is_empty() {
            self.saved_prompt = std::mem::take(&mut self.prompt);
        }
    }

    pub(crate) fn push_string_frame(&mut self, cmds: &str, w: Writer) {
        self.push_frame(Box::new(StringScanner::new(cmds)), None, None, w);
    }

    pub(crate) fn pop_frame(&mut self) {
        if self.cur.pop_env {
            self.env.borrow_mut().stack_mut().pop();
        }
        if let Some(args) = self.cur.saved_args.take() {
            self.env.borrow_mut().stack_mut().set("*", args);
        }
        if let Some(prev) = self.input_stack.pop() {
            self.cur = prev;
            if self.input_stack.is_empty() {
                self.prompt = std::mem::take(&mut self.saved_prompt);
            }
        }
    }

    pub(crate) fn pop_all_frames(&mut self) {
        while !self.input_stack.is_empty() {
            self.pop_frame();
        }
    }

    /// Pop frames until the innermost loop frame has been popped.
    pub(crate) fn break_loop(&mut self) -> Result<()> {
        let mut is_loop = self.cur.is_loop();
        loop {
            if self.input_stack.is_empty() || self.cur.is_func {
                if !is_loop {
                    if self.cur.is_func {
                        // The function terminates, but nothing past it
                        // unwinds.
                        self.pop_frame();
                    }
                    return Err(anyhow!("not within a loop"));
                }
                return Ok(());
            }
            self.pop_frame();
            if is_loop {
                return Ok(());
            }
            is_loop = self.cur.is_loop();
        }
    }

    /// Pop frames until a function frame has been popped.
    pub(crate) fn return_from_func(&mut self) -> Result<()> {
        loop {
            if self.cur.is_func {
                self.pop_frame();
                return Ok(());
            }
            if self.input_stack.is_empty() {
                return Err(anyhow!("not within a function"));
            }
            self.pop_frame();
        }
    }

    pub(crate) fn cur_frame(&self) -> &Frame {
        &self.cur
    }

    pub(crate) fn cur_frame_mut(&mut self) -> &mut Frame {
        &mut self.cur
    }

    pub(crate) fn parent_frame_mut(&mut self) -> Option<&mut Frame> {
        self.input_stack.last_mut()
    }

    pub(crate) fn open_file(&self, name: &str) -> io::Result<Box<dyn Read>> {
        (self.open)(name)
    }

    /// Open (or reuse) the redirection target and wrap it in a writer.
    /// `>` truncates on first open and on reuse, `>>` appends throughout;
    /// targets stay open for the rest of the session.
    fn redirect(&mut self, r: &Redirection) -> Result<Writer> {
        let cached = self.redir_files.get(&r.filename).cloned();
        let file = match r.kind.as_str() {
            ">" => match cached {
                Some(f) => {
                    f.borrow_mut().rewind_truncate()?;
                    f
                }
                None => self.open_cached(&r.filename, RedirMode::Truncate)?,
            },
            ">>" => match cached {
                Some(f) => f,
                None => self.open_cached(&r.filename, RedirMode::Append)?,
            },
            _ => return Err(anyhow!("redirection type not supported")),
        };
        Ok(self.new_writer(Sink::File(file)))
    }

    fn open_cached(
        &mut self,
        name: &str,
        mode: RedirMode,
    ) -> Result<Rc<RefCell<Box<dyn RedirFile>>>> {
        let file = (self.open_redir)(name, mode)?;
        let file = Rc::new(RefCell::new(file));
        self.redir_files.insert(name.to_string(), Rc::clone(&file));
        Ok(file)
    }

    fn new_writer(&self, sink: Sink) -> Writer {
        Writer::new(sink, Rc::clone(&self.env), Rc::clone(&self.templates))
    }

    fn put_prompt(&mut self) {
        let prompt = self.prompt.clone();
        self.write_prompt_str(&prompt);
    }

    pub(crate) fn write_prompt_str(&mut self, prompt: &str) {
        if let Some(hook) = &mut self.write_prompt {
            let _ = hook(prompt);
            return;
        }
        if prompt.is_empty() {
            return;
        }
        let mut out = self.stdout.borrow_mut();
        let _ = out.write_all(prompt.as_bytes());
        let _ = out.flush();
    }

    fn print_cmd(&mut self, c: &CmdLine) {
        let _ = writeln!(self.stdout.borrow_mut(), "% {}", c);
    }

    fn forward_line(&mut self, line: &str) {
        if let Some(fwd) = &mut self.forward {
            if fwd.write_all(line.as_bytes()).is_err() {
                let err = anyhow!("forwarding write failed");
                self.report_error(&err);
            }
        }
    }

    /// Report a failure, record it in `last_ok`, and honor `flag e`.
    pub(crate) fn fail(&mut self, name: &str, err: anyhow::Error) {
        let err = if name.is_empty() {
            err
        } else {
            anyhow::Error::new(FnError {
                name: name.to_string(),
                source: err,
            })
        };
        self.report_error(&err);
        self.last_ok = false;
        if self.flag_e && !self.cur.is_compound {
            self.exit_flag = true;
        }
    }

    fn report_error(&mut self, err: &anyhow::Error) {
        if let Some(handler) = &mut self.handle_error {
            handler(err);
        } else {
            let _ = writeln!(self.err_out.borrow_mut(), "{}", err);
        }
    }

    /// Read raw lines up to one whose trimmed text is `}`. One leading tab
    /// per line is dropped, matching how blocks are usually indented.
    pub(crate) fn scan_block(&mut self) -> Result<String> {
        let mut block = String::new();
        loop {
            self.write_prompt_str("");
            match self.cur.reader.next_line() {
                None => return Err(anyhow!("unexpected EOF")),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(line)) => {
                    let s = line.trim_end();
                    if s == "}" {
                        break;
                    }
                    block.push_str(s.strip_prefix('\t').unwrap_or(s));
                    block.push('\n');
                }
            }
        }
        Ok(block)
    }

    /// Extract a command block from the raw line, starting at raw field
    /// `start`: an inline `{ … }`, a lone trailing `{` opening a multi-line
    /// block read from the following lines, or simply the rest of the line.
    /// The text is kept verbatim so quoting and `$` references survive until
    /// the block runs.
    pub(crate) fn parse_cmd(
        &mut self,
        line: &str,
        raw: &[RawField],
        start: usize,
    ) -> Result<String> {
        let f = raw.get(start..).unwrap_or_default();
        let first = match f.first() {
            Some(first) => first,
            None => return Err(anyhow!("missing command")),
        };
        if first.text == "{" {
            if let Some(j) = matching_brace(f) {
                let body = line[f[0].end..f[j].start].trim();
                return Ok(format!("{}\n", body));
            }
            if f.len() == 1 {
                return self
                    .scan_block()
                    .map_err(|err| anyhow!("error while parsing function body: {}", err));
            }
            return Err(anyhow!("unbalanced block"));
        }
        let body = line[first.start..f[f.len() - 1].end].trim();
        Ok(format!("{}\n", body))
    }

    pub(crate) fn dump_func(&mut self, name: &str) {
        let body = match self.func_map.get(name) {
            Some(body) => body.clone(),
            None => return,
        };
        let mut out = format!("fn {} {{\n", name);
        for line in body.lines() {
            out.push('\t');
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("}\n");
        let _ = self.stdout.borrow_mut().write_all(out.as_bytes());
    }

    /// `help` with no arguments lists the visible commands grouped and
    /// sorted; with a name it shows that entry, descending into sub-maps on
    /// `.`.
    pub(crate) fn help(&mut self, args: &[String]) {
        let mut out = String::new();
        let mut wrote = false;
        {
            let mut m = &self.cmd_map;
            let mut pfx = String::new();
            let mut cmd_name = args.first().cloned().unwrap_or_default();
            let mut is_dir = args.is_empty();
            loop {
                if cmd_name.is_empty() {
                    break;
                }
                if let Some(v) = m.get(&cmd_name) {
                    if let Some(sub) = &v.map {
                        pfx.push_str(&cmd_name);
                        pfx.push('.');
                        cmd_name.clear();
                        is_dir = true;
                        m = sub;
                        continue;
                    }
                    break;
                }
                let descend = cmd_name.find('.').and_then(|i| {
                    m.get(&cmd_name[..i])
                        .and_then(|dir| dir.map.as_ref())
                        .map(|sub| (sub, i))
                });
                match descend {
                    Some((sub, i)) => {
                        pfx.push_str(&cmd_name[..=i]);
                        cmd_name = cmd_name[i + 1..].to_string();
                        m = sub;
                    }
                    None => break,
                }
            }

            let mut groups: BTreeMap<String, Vec<(String, &Cmd)>> = BTreeMap::new();
            for (name, v) in m {
                if !cmd_name.is_empty() && *name != cmd_name {
                    continue;
                }
                let display = if pfx.is_empty() {
                    name.clone()
                } else if name.is_empty() {
                    pfx[..pfx.len() - 1].to_string()
                } else {
                    format!("{}{}", pfx, name)
                };
                let group = if !v.group.is_empty() {
                    v.group.clone()
                } else if !self.default_group.is_empty() {
                    self.default_group.clone()
                } else {
                    DEFAULT_GROUP.to_string()
                };
                groups.entry(group).or_default().push((display, v));
            }

            let multi = groups.len() != 1;
            for (gname, mut entries) in groups {
                let shown = match gname.find("__") {
                    Some(i) => &gname[i + 2..],
                    None => &gname[..],
                };
                if multi {
                    out.push_str(&format!("[{}]\n\n", shown));
                }
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                for (name, v) in entries {
                    if v.hidden && is_dir {
                        continue;
                    }
                    let flags = if v.flags.is_empty() {
                        String::new()
                    } else {
                        format!(" {}", v.flags)
                    };
                    out.push_str(&format!(
                        "\t{}{}{}{}\n",
                        name,
                        flags,
                        arg_string(" ", &v.arg, ""),
                        arg_string(" [", &v.opt, "]")
                    ));
                    if !v.help.is_empty() {
                        for line in v.help.lines() {
                            out.push_str(&format!("\t\t{}\n", line));
                        }
                    }
                    if v.map.is_some() {
                        out.push_str(&format!("\t\tSee `help {}' for details.\n", name));
                    }
                    out.push('\n');
                    wrote = true;
                }
            }
        }
        let _ = self.stdout.borrow_mut().write_all(out.as_bytes());
        if !wrote && !args.is_empty() {
            self.fail(&args[0], InterpError::NotFound.into());
        }
        if let Some(hook) = &mut self.extra_help {
            hook();
        }
    }
}

fn arg_string(pfx: &str, args: &[String], sfx: &str) -> String {
    if args.is_empty() {
        return String::new();
    }
    format!("{}{}{}", pfx, args.join(" "), sfx)
}

/// Index of the `}` raw field matching the `{` at `f[0]`, counting nesting.
pub(crate) fn matching_brace(f: &[RawField]) -> Option<usize> {
    let mut depth = 1;
    for (i, field) in f.iter().enumerate().skip(1) {
        match field.text.as_str() {
            "{" => depth += 1,
            "}" => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Index of the command-name field in a raw field list: the first field
/// that is not a `NAME=VALUE` assignment.
pub(crate) fn raw_name_index(raw: &[RawField]) -> usize {
    for (i, f) in raw.iter().enumerate() {
        if !is_assignment_field(&f.text) {
            return i;
        }
    }
    raw.len()
}

fn is_assignment_field(text: &str) -> bool {
    let mut quoting = false;
    for (i, r) in text.char_indices() {
        match r {
            '\'' => quoting = !quoting,
            '=' if !quoting => return i != 0,
            _ => {}
        }
    }
    false
}

fn default_open_redir(name: &str, mode: RedirMode) -> io::Result<Box<dyn RedirFile>> {
    let mut opts = OpenOptions::new();
    opts.create(true).read(true);
    match mode {
        RedirMode::Truncate => opts.write(true).truncate(true),
        RedirMode::Append => opts.append(true),
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o644);
    }
    opts.open(name).map(|f| Box::new(f) as Box<dyn RedirFile>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::svec;
    use rcstring::raw_fields;

    #[test]
    fn test_repetition_counts_iterations() {
        let mut r = Repetition::new(3, None);
        assert!(!r.done());
        assert!(!r.done());
        assert!(r.done());
    }

    #[test]
    fn test_repetition_deadline() {
        let mut past = Repetition::new(0, Some(Instant::now() - std::time::Duration::from_secs(1)));
        assert!(past.done());
        let mut future =
            Repetition::new(0, Some(Instant::now() + std::time::Duration::from_secs(60)));
        assert!(!future.done());
    }

    #[test]
    fn test_matching_brace_nesting() {
        let raw = raw_fields("{ a { b } c } tail");
        assert_eq!(matching_brace(&raw), Some(6));
        let raw = raw_fields("{ open only");
        assert_eq!(matching_brace(&raw), None);
    }

    #[test]
    fn test_raw_name_index_skips_assignments() {
        let raw = raw_fields("a=1 b='x y' echo hi");
        assert_eq!(raw_name_index(&raw), 2);
        let raw = raw_fields("=weird arg");
        assert_eq!(raw_name_index(&raw), 0);
    }

    #[test]
    fn test_lookup_descends_sub_maps() {
        let mut sub = CmdMap::new();
        sub.insert(
            "inner".to_string(),
            Cmd {
                run: Some(CmdFn::user(|_, _| Ok(()))),
                ..Cmd::default()
            },
        );
        let mut m = CmdMap::new();
        m.insert(
            "outer".to_string(),
            Cmd {
                map: Some(sub),
                ..Cmd::default()
            },
        );
        let interp = Interpreter::new(StringScanner::new(""), m);
        assert!(interp.lookup("outer.inner").is_ok());
        // A directory without an empty-named entry is not callable.
        assert!(interp.lookup("outer").is_err());
        assert!(interp.lookup("outer.missing").is_err());
        // Builtins resolve at the root only.
        assert!(interp.lookup("echo").is_ok());
        assert!(interp.lookup("nonesuch").is_err());
    }

    #[test]
    fn test_lookup_builtin_via_directory() {
        let interp = Interpreter::new(StringScanner::new(""), CmdMap::new());
        assert!(interp.lookup("builtin.echo").is_ok());
    }

    #[test]
    fn test_arg_string_brackets() {
        assert_eq!(arg_string(" [", &svec(&["A", "B"]), "]"), " [A B]");
        assert_eq!(arg_string(" ", &[], ""), "");
    }
}
