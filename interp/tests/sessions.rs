//! End-to-end interpreter sessions: scripts in, observed output out.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use rcinterp::{
    Cmd, CmdFn, CmdMap, InterpError, Interpreter, RedirFile, StringScanner,
};

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Session {
    interp: Interpreter,
    out: SharedBuf,
    errs: Rc<RefCell<Vec<String>>>,
}

fn session(script: &str) -> Session {
    session_with_map(script, CmdMap::new())
}

fn session_with_map(script: &str, cmd_map: CmdMap) -> Session {
    let out = SharedBuf::default();
    let errs: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = errs.clone();
    let interp = Interpreter::new(StringScanner::new(script), cmd_map)
        .with_stdout(Box::new(out.clone()))
        .with_error_handler(move |err| sink.borrow_mut().push(format!("{}", err)));
    Session { interp, out, errs }
}

impl Session {
    fn setenv(&mut self, name: &str, values: &[&str]) {
        self.interp
            .env()
            .borrow_mut()
            .stack_mut()
            .set(name, values.iter().map(|s| s.to_string()).collect());
    }

    fn run(&mut self) {
        self.interp.process().unwrap();
    }

    fn out(&self) -> String {
        self.out.contents()
    }

    fn errs(&self) -> Vec<String> {
        self.errs.borrow().clone()
    }
}

#[test]
fn echo_hello_world() {
    let mut s = session("echo hello world");
    s.run();
    assert_eq!(s.out(), "hello world\n");
    assert!(s.interp.last_ok());
}

#[test]
fn variable_expansion_forms() {
    let mut s = session("echo $foo\necho '$foo'\necho a^$foo^z");
    s.setenv("foo", &["bar"]);
    s.run();
    assert_eq!(s.out(), "bar\n$foo\nabarz\n");
}

#[test]
fn positional_and_indexed_references() {
    let mut s = session("echo $#*\necho $1 $2\necho $*(1)\necho $*(0)");
    s.setenv("*", &["x", "y"]);
    s.run();
    assert_eq!(s.out(), "2\nx y\nx\n\n");
}

#[test]
fn count_of_unset_variable_is_zero() {
    let mut s = session("echo $#nothing");
    s.run();
    assert_eq!(s.out(), "0\n");
}

#[test]
fn unset_variable_vanishes_from_fields() {
    let mut s = session("echo a $nothing b");
    s.run();
    assert_eq!(s.out(), "a b\n");
}

#[test]
fn indexed_variable() {
    let mut s = session("echo $nut(2)");
    s.setenv("nut", &["a", "b", "c"]);
    s.run();
    assert_eq!(s.out(), "b\n");
}

#[test]
fn function_definition_and_call() {
    let mut s = session("fn greet { echo hello $1 }\ngreet world");
    s.run();
    assert_eq!(s.out(), "hello world\n");
}

#[test]
fn function_multiline_block() {
    let script = "fn multi {\n\techo one\n\techo two\n}\nmulti";
    let mut s = session(script);
    s.run();
    assert_eq!(s.out(), "one\ntwo\n");
}

#[test]
fn function_restores_argument_list() {
    let mut s = session("fn show { echo $* }\nshow a b\necho $*");
    s.setenv("*", &["orig"]);
    s.run();
    assert_eq!(s.out(), "a b\norig\n");
}

#[test]
fn function_dump() {
    let mut s = session("fn f { echo a }\nfn");
    s.run();
    assert_eq!(s.out(), "fn f {\n\techo a\n}\n");
}

#[test]
fn inline_assignment_scopes_to_function_call() {
    let mut s = session("fn show { echo $v }\nv=outer\nv=inner show\necho $v");
    s.run();
    assert_eq!(s.out(), "inner\nouter\n");
}

#[test]
fn assignment_only_line_keeps_status() {
    let mut s = session("! echo probe\nx=5");
    s.run();
    // The assignment binds without running a command and leaves the failed
    // status of `!` in place.
    assert_eq!(s.out(), "probe\n");
    assert!(!s.interp.last_ok());
    assert_eq!(s.interp.env().borrow().getenv("x"), "5");
}

#[test]
fn bang_inverts_success() {
    let mut s = session("! echo done\necho still-here");
    s.run();
    assert_eq!(s.out(), "done\nstill-here\n");
    assert!(s.interp.last_ok());
    let mut s = session("! echo done");
    s.run();
    assert!(!s.interp.last_ok());
}

#[test]
fn bang_of_failure_succeeds() {
    let mut s = session("! false");
    s.run();
    assert!(s.interp.last_ok());
}

#[test]
fn if_chain_negative() {
    let script = "if { ~ $x yes } { echo Y }\nif not { echo N }";
    let mut s = session(script);
    s.setenv("x", &["no"]);
    s.run();
    assert_eq!(s.out(), "N\n");
}

#[test]
fn if_chain_positive() {
    let script = "if { ~ $x yes } { echo Y }\nif not { echo N }";
    let mut s = session(script);
    s.setenv("x", &["yes"]);
    s.run();
    assert_eq!(s.out(), "Y\n");
}

#[test]
fn if_not_without_if_is_an_error() {
    let mut s = session("if not { echo N }");
    s.run();
    assert_eq!(s.out(), "");
    assert!(s.errs().iter().any(|e| e.contains("does not follow")));
}

#[test]
fn intervening_command_clears_condition() {
    let script = "if { ~ a a } { echo Y }\necho mid\nif not { echo N }";
    let mut s = session(script);
    s.run();
    assert_eq!(s.out(), "Y\nmid\n");
    assert!(s.errs().iter().any(|e| e.contains("does not follow")));
}

#[test]
fn if_with_unbraced_condition() {
    let mut s = session("if ~ b b { echo hit }");
    s.run();
    assert_eq!(s.out(), "hit\n");
}

#[test]
fn repeat_runs_count_times() {
    let mut s = session("repeat 3 echo ha");
    s.run();
    assert_eq!(s.out(), "ha\nha\nha\n");
}

#[test]
fn repeat_zero_is_a_noop() {
    let mut s = session("repeat 0 echo ha\nrepeat 0s echo ha");
    s.run();
    assert_eq!(s.out(), "");
    assert!(s.interp.last_ok());
}

#[test]
fn break_leaves_repeat_loop() {
    let script = "repeat 5 {\n\techo x\n\tbreak\n}\necho after";
    let mut s = session(script);
    s.run();
    assert_eq!(s.out(), "x\nafter\n");
}

#[test]
fn break_outside_loop_reports() {
    let mut s = session("break");
    s.run();
    assert!(s.errs().iter().any(|e| e.contains("not within a loop")));
    assert!(!s.interp.last_ok());
}

#[test]
fn return_leaves_function_early() {
    let script = "fn f {\n\techo one\n\treturn\n\techo two\n}\nf\necho after";
    let mut s = session(script);
    s.run();
    assert_eq!(s.out(), "one\nafter\n");
}

#[test]
fn return_outside_function_reports() {
    let mut s = session("return");
    s.run();
    assert!(s.errs().iter().any(|e| e.contains("not within a function")));
}

#[test]
fn shift_drops_leading_arguments() {
    let mut s = session("shift\necho $*\nshift 2\necho $#*");
    s.setenv("*", &["a", "b", "c", "d"]);
    s.run();
    assert_eq!(s.out(), "b c d\n1\n");
}

#[test]
fn unbind_removes_function() {
    let mut s = session("fn f { echo x }\nunbind f\nf\nunbind g");
    s.run();
    let errs = s.errs();
    assert!(errs.iter().any(|e| e.contains("f: no such command")));
    assert!(errs.iter().any(|e| e.contains("function not found")));
}

#[test]
fn source_pushes_file_frame() {
    let mut files = HashMap::new();
    files.insert("lib.rc".to_string(), "echo sourced\n".to_string());
    let mut s = session(". lib.rc\necho after");
    s.interp = std::mem::replace(&mut s.interp, dummy()).with_open(move |name| {
        files
            .get(name)
            .map(|text| Box::new(Cursor::new(text.clone().into_bytes())) as Box<dyn Read>)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    });
    s.run();
    assert_eq!(s.out(), "sourced\nafter\n");
}

#[test]
fn cat_copies_raw() {
    let mut s = session("cat notes.txt");
    s.interp = std::mem::replace(&mut s.interp, dummy()).with_open(|_| {
        Ok(Box::new(Cursor::new(b"line1\nline2\n".to_vec())) as Box<dyn Read>)
    });
    s.run();
    assert_eq!(s.out(), "line1\nline2\n");
}

fn dummy() -> Interpreter {
    Interpreter::new(StringScanner::new(""), CmdMap::new())
}

struct MemRedir(Rc<RefCell<Vec<u8>>>);

impl Write for MemRedir {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RedirFile for MemRedir {
    fn rewind_truncate(&mut self) -> io::Result<()> {
        self.0.borrow_mut().clear();
        Ok(())
    }
}

type MemFiles = Rc<RefCell<HashMap<String, Rc<RefCell<Vec<u8>>>>>>;

fn with_mem_redirs(s: &mut Session) -> MemFiles {
    let files: MemFiles = Rc::new(RefCell::new(HashMap::new()));
    let handle = Rc::clone(&files);
    s.interp = std::mem::replace(&mut s.interp, dummy()).with_open_redir(move |name, _mode| {
        let buf = handle
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(Box::new(MemRedir(buf)) as Box<dyn RedirFile>)
    });
    files
}

fn file_contents(files: &MemFiles, name: &str) -> String {
    let files = files.borrow();
    let buf = files.get(name).expect("redirection target exists");
    let contents = buf.borrow().clone();
    String::from_utf8(contents).unwrap()
}

#[test]
fn redirect_truncates_then_appends_within_session() {
    let mut s = session("echo one > f\necho two > f\necho three >> f");
    let files = with_mem_redirs(&mut s);
    s.run();
    assert_eq!(file_contents(&files, "f"), "two\nthree\n");
    assert_eq!(s.out(), "");
}

#[test]
fn redirect_append_after_truncate_keeps_content() {
    let mut s = session("echo a > f\necho b >> f");
    let files = with_mem_redirs(&mut s);
    s.run();
    assert_eq!(file_contents(&files, "f"), "a\nb\n");
}

#[test]
fn input_redirection_is_not_supported() {
    let mut s = session("echo hi < f");
    s.run();
    assert!(s
        .errs()
        .iter()
        .any(|e| e.contains("redirection type not supported")));
}

#[test]
fn flag_e_exits_on_lookup_failure() {
    let mut s = session("flag e +\nnosuchcmd\necho unreached");
    let err = s.interp.process().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<InterpError>(),
        Some(InterpError::LastCmdFailed)
    ));
    assert_eq!(s.out(), "");
    assert!(s.errs().iter().any(|e| e.contains("no such command")));
}

#[test]
fn flag_e_ignores_failures_inside_if_condition() {
    let script = "flag e +\nif { false } { echo Y }\necho reached";
    let mut s = session(script);
    s.run();
    assert_eq!(s.out(), "reached\n");
}

#[test]
fn flag_x_echoes_commands() {
    let mut s = session("flag x +\necho hi");
    s.run();
    assert_eq!(s.out(), "% echo hi\nhi\n");
}

#[test]
fn arity_failure_reports_without_running() {
    let mut s = session("cat");
    s.run();
    assert!(s
        .errs()
        .iter()
        .any(|e| e.contains("cat: wrong number of arguments")));
    assert!(!s.interp.last_ok());
}

#[test]
fn tokenizer_error_discards_line() {
    let mut s = session("echo $##x\necho next");
    s.run();
    assert_eq!(s.out(), "next\n");
    assert!(s.errs().iter().any(|e| e.contains("syntax error")));
}

#[test]
fn exit_stops_the_session() {
    let mut s = session("echo a\nexit\necho b");
    s.run();
    assert_eq!(s.out(), "a\n");
}

#[test]
fn glob_match_builtin() {
    let mut s = session("~ hello h*llo");
    s.run();
    assert!(s.interp.last_ok());
    let mut s = session("~ hello x*");
    s.run();
    assert!(!s.interp.last_ok());
    assert!(s.errs().is_empty(), "no-match failures stay quiet");
}

#[test]
fn user_map_overrides_builtin() {
    let mut m = CmdMap::new();
    m.insert(
        "echo".to_string(),
        Cmd {
            opt: vec!["ARG".to_string(), "...".to_string()],
            run: Some(CmdFn::user(|ctx, _| {
                ctx.println("custom")?;
                Ok(())
            })),
            ..Cmd::default()
        },
    );
    let mut s = session_with_map("echo hi\nbuiltin.echo hi", m);
    s.run();
    assert_eq!(s.out(), "custom\nhi\n");
}

#[test]
fn dotted_lookup_descends_sub_maps() {
    let mut sub = CmdMap::new();
    sub.insert(
        "version".to_string(),
        Cmd {
            run: Some(CmdFn::user(|ctx, _| {
                ctx.println("1.0")?;
                Ok(())
            })),
            ..Cmd::default()
        },
    );
    let mut m = CmdMap::new();
    m.insert(
        "tools".to_string(),
        Cmd {
            map: Some(sub),
            ..Cmd::default()
        },
    );
    let mut s = session_with_map("tools.version", m);
    s.run();
    assert_eq!(s.out(), "1.0\n");
}

#[test]
fn init_flags_hook_strips_options() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let record = Rc::clone(&seen);
    let mut m = CmdMap::new();
    m.insert(
        "paint".to_string(),
        Cmd {
            arg: vec!["WALL".to_string()],
            init_flags: Some(Rc::new(move |args: &[String]| {
                use lexopt::prelude::*;
                let mut rest = Vec::new();
                let mut parser = rcinterp::flag_parser(args);
                while let Some(arg) = parser.next()? {
                    match arg {
                        Short('c') => {
                            let value = parser.value()?.string()?;
                            record.borrow_mut().push(value);
                        }
                        Value(v) => rest.push(v.string()?),
                        arg => return Err(arg.unexpected().into()),
                    }
                }
                Ok(rest)
            })),
            run: Some(CmdFn::user(|ctx, args| {
                ctx.printf(format_args!("painting {}", args[1]))?;
                Ok(())
            })),
            ..Cmd::default()
        },
    );
    let mut s = session_with_map("paint -c red wall", m);
    s.run();
    assert_eq!(s.out(), "painting wall\n");
    assert_eq!(*seen.borrow(), vec!["red".to_string()]);
}

#[test]
fn forward_unknown_commands() {
    let fwd = SharedBuf::default();
    let out = SharedBuf::default();
    let mut interp = Interpreter::new(StringScanner::new("frob 'a b' c"), CmdMap::new())
        .with_stdout(Box::new(out.clone()))
        .with_forward(Box::new(fwd.clone()));
    interp.process().unwrap();
    assert_eq!(fwd.contents(), "frob 'a b' c\n");
    assert!(interp.last_ok(), "forwarded lines are not failures");
}

#[test]
fn help_lists_and_drills_down() {
    // The top-level listing covers the user map; builtins hang off the
    // `builtin` directory entry.
    let mut s = session("help");
    s.run();
    assert!(s.out().contains("See `help builtin' for details."));

    let mut s = session("help builtin");
    s.run();
    let out = s.out();
    assert!(out.contains("builtin.echo"));
    assert!(out.contains("Print arguments."));
    // Hidden markers stay out of the listing.
    assert!(!out.contains("_testcond"));

    let mut s = session("help builtin.echo");
    s.run();
    assert!(s.out().contains("Print arguments."));

    let mut s = session("help nonesuch");
    s.run();
    assert!(s.errs().iter().any(|e| e.contains("no such command")));
}

#[test]
fn prompt_copies_are_stripped() {
    let prompts: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let record = Rc::clone(&prompts);
    let out = SharedBuf::default();
    let mut interp = Interpreter::new(StringScanner::new("% % echo hi"), CmdMap::new())
        .with_stdout(Box::new(out.clone()))
        .with_prompt("% ")
        .with_write_prompt(move |p: &str| {
            record.borrow_mut().push(p.to_string());
            Ok(())
        });
    interp.process().unwrap();
    assert_eq!(out.contents(), "hi\n");
    assert!(prompts.borrow().iter().any(|p| p == "% "));
}

#[test]
fn prefix_template_applies_per_line() {
    let mut s = session("prefix='[{{div 10 5}}] '\necho hi\necho ho");
    s.run();
    assert_eq!(s.out(), "[2] hi\n[2] ho\n");
}

#[test]
fn ofs_changes_apply_immediately() {
    let mut s = session("OFS=:\necho a b c");
    s.run();
    assert_eq!(s.out(), "a:b:c\n");
}

#[test]
fn init_script_runs_first() {
    let out = SharedBuf::default();
    let mut interp = Interpreter::new(StringScanner::new("echo second"), CmdMap::new())
        .with_stdout(Box::new(out.clone()))
        .with_init_script(StringScanner::new("echo first"));
    interp.process().unwrap();
    assert_eq!(out.contents(), "first\nsecond\n");
}

#[test]
fn top_level_interrupt_ends_process() {
    let mut s = session("echo never");
    s.interp.interrupter().interrupt();
    let err = s.interp.process().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<InterpError>(),
        Some(InterpError::Interrupted)
    ));
    assert_eq!(s.out(), "");
}

#[test]
fn interrupt_unwinds_sourced_file_to_prompt() {
    let mut s = session(". slow.rc\necho after");
    s.interp = std::mem::replace(&mut s.interp, dummy()).with_open(|_| {
        Ok(Box::new(Cursor::new(b"sleep 10s\necho skipped\n".to_vec())) as Box<dyn Read>)
    });
    let intr = s.interp.interrupter();
    let waker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        intr.interrupt();
    });
    s.run();
    waker.join().unwrap();
    assert_eq!(s.out(), "after\n");
    assert!(s.errs().iter().any(|e| e.contains("interrupted")));
}

#[test]
fn cmd_hook_runs_before_each_command() {
    let count = Rc::new(RefCell::new(0));
    let tick = Rc::clone(&count);
    let out = SharedBuf::default();
    let mut interp = Interpreter::new(StringScanner::new("echo a\necho b"), CmdMap::new())
        .with_stdout(Box::new(out.clone()))
        .with_cmd_hook(move |_ctx| *tick.borrow_mut() += 1);
    interp.process().unwrap();
    assert_eq!(*count.borrow(), 2);
}

#[test]
fn help_groups_and_extra_help() {
    let mut m = CmdMap::new();
    m.insert(
        "probe".to_string(),
        Cmd {
            run: Some(CmdFn::user(|_, _| Ok(()))),
            group: "10__Tools".to_string(),
            help: "Poke at things.".to_string(),
            ..Cmd::default()
        },
    );
    let out = SharedBuf::default();
    let extra = Rc::new(RefCell::new(false));
    let mark = Rc::clone(&extra);
    let mut interp = Interpreter::new(StringScanner::new("help"), m)
        .with_stdout(Box::new(out.clone()))
        .with_default_group("90__Misc")
        .with_extra_help(move || *mark.borrow_mut() = true);
    interp.process().unwrap();
    let text = out.contents();
    assert!(text.contains("[Tools]"));
    assert!(text.contains("[Misc]"));
    assert!(*extra.borrow());
}

#[test]
fn default_error_path_writes_to_stderr() {
    let out = SharedBuf::default();
    let errs = SharedBuf::default();
    let mut interp = Interpreter::new(StringScanner::new("nosuch"), CmdMap::new())
        .with_stdout(Box::new(out.clone()))
        .with_stderr(Box::new(errs.clone()));
    interp.process().unwrap();
    assert_eq!(errs.contents(), "nosuch: no such command\n");
}

#[test]
fn unterminated_block_stores_no_function() {
    let mut s = session("fn broken {\n\techo half");
    s.run();
    assert!(s
        .errs()
        .iter()
        .any(|e| e.contains("error while parsing") && e.contains("EOF")));

    let mut s = session("fn broken {\n\techo half\nbroken");
    s.run();
    // The definition aborted, so the name never binds. The would-be body
    // lines were consumed by the block scan, leaving nothing to run.
    assert_eq!(s.out(), "");
}

#[test]
fn positional_reference_with_empty_args_is_empty() {
    let mut s = session("echo $1");
    s.run();
    assert_eq!(s.out(), "\n");
}

#[test]
fn sleep_completes_normally() {
    let mut s = session("sleep 5ms\necho done");
    s.run();
    assert_eq!(s.out(), "done\n");
    assert!(s.interp.last_ok());
}
