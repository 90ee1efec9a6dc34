//! The builtin command registry.
//!
//! Builtins run in-process against the interpreter itself: most of the
//! interesting ones push new input frames (sourced files, function bodies,
//! condition chains, rewindable loops) rather than producing output.

use std::io;
use std::rc::Rc;
use std::time::Instant;

use anyhow::{anyhow, Result};

use rcstring::raw_fields;

use crate::command::{svec, Cmd, CmdFn, CmdMap, Context};
use crate::interpreter::{raw_name_index, InterpError, Interpreter, Repetition};
use crate::scan::{LinesScanner, Scanner, StringScanner};

pub(crate) fn builtin_map() -> CmdMap {
    let mut m = CmdMap::new();
    m.insert(
        ".".to_string(),
        Cmd {
            arg: svec(&["FILE"]),
            run: Some(CmdFn::Builtin(bi_source)),
            help: "Read commands from FILE.".to_string(),
            ignore_env: true,
            ..Cmd::default()
        },
    );
    m.insert(
        "echo".to_string(),
        Cmd {
            opt: svec(&["ARG", "..."]),
            run: Some(CmdFn::Builtin(bi_echo)),
            help: "Print arguments.".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "cat".to_string(),
        Cmd {
            arg: svec(&["FILE"]),
            run: Some(CmdFn::Builtin(bi_cat)),
            help: "Print the contents of FILE.".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "if".to_string(),
        Cmd {
            is_compound: true,
            arg: svec(&["CMD", "..."]),
            run: Some(CmdFn::Builtin(bi_if)),
            help: "Run a command block if a condition succeeds; `if not' runs\n\
                   a block when the preceding `if' condition failed."
                .to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "_testcond".to_string(),
        Cmd {
            hidden: true,
            run: Some(CmdFn::Builtin(bi_testcond)),
            ..Cmd::default()
        },
    );
    m.insert(
        "!".to_string(),
        Cmd {
            is_compound: true,
            hide_failure: true,
            opt: svec(&["CMD", "..."]),
            run: Some(CmdFn::Builtin(bi_bang)),
            help: "Run a command and invert its status.".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "_!".to_string(),
        Cmd {
            hidden: true,
            hide_failure: true,
            run: Some(CmdFn::Builtin(bi_bang_status)),
            ..Cmd::default()
        },
    );
    m.insert(
        "~".to_string(),
        Cmd {
            hide_failure: true,
            arg: svec(&["SUBJECT", "PATTERN", "..."]),
            run: Some(CmdFn::Builtin(bi_match)),
            help: "Returns success if subject matches any pattern.".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "flag".to_string(),
        Cmd {
            arg: svec(&["f", "+-"]),
            run: Some(CmdFn::Builtin(bi_flag)),
            help: "Set a flag as in Plan 9's rc:\n\
                   \te\texit if a simple command (not part of an if-condition) fails\n\
                   \tx\tprint each command before executing it"
                .to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "fn".to_string(),
        Cmd {
            is_compound: true,
            opt: svec(&["NAME", "CMD", "..."]),
            run: Some(CmdFn::Builtin(bi_fn)),
            help: "Define a function, or display its definition. CMD can be\n\
                   a single command, or a block enclosed in '{' and '}':\n\
                   \tfn a {\n\
                   \t\tcmdb\n\
                   \t\tcmdc\n\
                   \t}"
            .to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "shift".to_string(),
        Cmd {
            opt: svec(&["N"]),
            run: Some(CmdFn::Builtin(bi_shift)),
            help: "Delete the first n (default: 1) elements of $*".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "unbind".to_string(),
        Cmd {
            arg: svec(&["NAME"]),
            run: Some(CmdFn::Builtin(bi_unbind)),
            help: "Unbind a function.".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "repeat".to_string(),
        Cmd {
            arg: svec(&["{N|T}", "CMD"]),
            opt: svec(&["ARG", "..."]),
            run: Some(CmdFn::Builtin(bi_repeat)),
            help: "Repeat a command N times, or for a specified duration T.".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "return".to_string(),
        Cmd {
            weak_status: true,
            run: Some(CmdFn::Builtin(bi_return)),
            help: "Return from the current function.".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "break".to_string(),
        Cmd {
            weak_status: true,
            run: Some(CmdFn::Builtin(bi_break)),
            help: "Exit the current loop.".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "false".to_string(),
        Cmd {
            hide_failure: true,
            run: Some(CmdFn::Builtin(bi_false)),
            help: "Return an exit status indicating failure".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "sleep".to_string(),
        Cmd {
            arg: svec(&["DURATION"]),
            run: Some(CmdFn::Builtin(bi_sleep)),
            help: "Sleep for the specified duration.".to_string(),
            ..Cmd::default()
        },
    );
    m.insert(
        "exit".to_string(),
        Cmd {
            run: Some(CmdFn::Builtin(bi_exit)),
            help: "Terminate the command line processor.".to_string(),
            ..Cmd::default()
        },
    );
    m
}

fn bi_source(cl: &mut Interpreter, ctx: &mut Context, args: &[String]) -> Result<()> {
    let reader = cl.open_file(&args[1])?;
    let w = ctx.writer().clone();
    cl.push_frame(
        Box::new(LinesScanner::new(io::BufReader::new(reader))),
        None,
        None,
        w,
    );
    Ok(())
}

fn bi_echo(_cl: &mut Interpreter, ctx: &mut Context, args: &[String]) -> Result<()> {
    let args2: Vec<String> = args[1..].iter().filter(|a| !a.is_empty()).cloned().collect();
    ctx.print_slice(&args2)?;
    Ok(())
}

fn bi_cat(cl: &mut Interpreter, ctx: &mut Context, args: &[String]) -> Result<()> {
    let mut reader = cl.open_file(&args[1])?;
    io::copy(&mut reader, ctx)?;
    Ok(())
}

/// `if CMD…`: push the condition followed by the `_testcond` marker, and
/// remember the body on the condition frame. `if not CMD…`: run the body
/// when the sibling condition recorded failure.
fn bi_if(cl: &mut Interpreter, ctx: &mut Context, args: &[String]) -> Result<()> {
    let line = cl.cur_line.clone();
    let raw = raw_fields(&line);
    let k = raw_name_index(&raw);
    let w = ctx.writer().clone();

    if args.get(1).map(String::as_str) == Some("not") {
        let cmd = cl.parse_cmd(&line, &raw, k + 2)?;
        let result = match cl.cur_frame().cond_result {
            Some(result) => result,
            None => return Err(anyhow!("`if not' does not follow `if'")),
        };
        if !result {
            cl.push_string_frame(&cmd, w);
        }
        return Ok(());
    }

    let (cond, cmd) = split_condition(cl, &line, &raw, k)?;
    cl.push_string_frame(&format!("{}\n_testcond\n", cond), w);
    cl.cur_frame_mut().cond_cmd = cmd;
    cl.cur_frame_mut().is_compound = true;
    Ok(())
}

/// Split the raw fields after `if` into condition text and body block. The
/// condition is either braced (`if { cond } …`) or everything before the
/// first brace; with no brace at all, the last field is the command.
fn split_condition(
    cl: &mut Interpreter,
    line: &str,
    raw: &[rcstring::RawField],
    k: usize,
) -> Result<(String, String)> {
    let rest = &raw[k + 1..];
    if rest.is_empty() {
        return Err(anyhow!("missing condition"));
    }
    match rest.iter().position(|f| f.text == "{") {
        Some(0) => {
            let j = crate::interpreter::matching_brace(rest)
                .ok_or_else(|| anyhow!("unbalanced block"))?;
            let cond = line[rest[0].end..rest[j].start].trim().to_string();
            let cmd = cl.parse_cmd(line, raw, k + 1 + j + 1)?;
            Ok((cond, cmd))
        }
        Some(b) => {
            let cond = line[rest[0].start..rest[b - 1].end].trim().to_string();
            let cmd = cl.parse_cmd(line, raw, k + 1 + b)?;
            Ok((cond, cmd))
        }
        None => {
            if rest.len() < 2 {
                return Err(anyhow!("missing command"));
            }
            let cond = line[rest[0].start..rest[rest.len() - 2].end].trim().to_string();
            let cmd = cl.parse_cmd(line, raw, k + rest.len())?;
            Ok((cond, cmd))
        }
    }
}

/// Runs right after an `if` condition: records the outcome on the parent
/// frame and pushes the pending body when the condition succeeded.
fn bi_testcond(cl: &mut Interpreter, ctx: &mut Context, _args: &[String]) -> Result<()> {
    let cmd = std::mem::take(&mut cl.cur_frame_mut().cond_cmd);
    if cmd.is_empty() {
        return Ok(());
    }
    let ok = cl.last_ok();
    if let Some(parent) = cl.parent_frame_mut() {
        parent.cond_result = Some(ok);
    }
    if ok {
        let w = ctx.writer().clone();
        cl.push_string_frame(&cmd, w);
    }
    Ok(())
}

/// `! CMD…`: push the command followed by the `_!` marker, which fails
/// exactly when the command succeeded.
fn bi_bang(cl: &mut Interpreter, ctx: &mut Context, args: &[String]) -> Result<()> {
    if args.len() == 1 {
        return Err(anyhow!("false"));
    }
    let line = cl.cur_line.clone();
    let raw = raw_fields(&line);
    let k = raw_name_index(&raw);
    let body = cl.parse_cmd(&line, &raw, k + 1)?;
    let compound = cl.cur_frame().is_compound;
    let w = ctx.writer().clone();
    cl.push_string_frame(&format!("{}_!\n", body), w);
    cl.cur_frame_mut().is_compound = compound;
    Ok(())
}

fn bi_bang_status(cl: &mut Interpreter, _ctx: &mut Context, _args: &[String]) -> Result<()> {
    if cl.last_ok() {
        return Err(anyhow!("false"));
    }
    Ok(())
}

fn bi_match(_cl: &mut Interpreter, _ctx: &mut Context, args: &[String]) -> Result<()> {
    let subject = &args[1];
    for pat in &args[2..] {
        let pattern = glob::Pattern::new(pat).map_err(|err| anyhow!("{}", err))?;
        if pattern.matches(subject) {
            return Ok(());
        }
    }
    Err(anyhow!("no match"))
}

fn bi_flag(cl: &mut Interpreter, _ctx: &mut Context, args: &[String]) -> Result<()> {
    let v = args[2] == "+";
    match args[1].as_str() {
        "e" => cl.flag_e = v,
        "x" => cl.flag_x = v,
        f => return Err(anyhow!("unknown flag {:?}", f)),
    }
    Ok(())
}

fn bi_fn(cl: &mut Interpreter, _ctx: &mut Context, args: &[String]) -> Result<()> {
    match args.len() {
        1 => {
            let names: Vec<String> = cl.func_map.keys().cloned().collect();
            for name in names {
                cl.dump_func(&name);
            }
            Ok(())
        }
        2 => {
            cl.dump_func(&args[1]);
            Ok(())
        }
        _ => {
            let line = cl.cur_line.clone();
            let raw = raw_fields(&line);
            let k = raw_name_index(&raw);
            let body = cl.parse_cmd(&line, &raw, k + 2)?;
            cl.func_map.insert(args[1].clone(), body);
            Ok(())
        }
    }
}

fn bi_shift(cl: &mut Interpreter, _ctx: &mut Context, args: &[String]) -> Result<()> {
    let mut n: usize = 1;
    if args.len() == 2 {
        n = args[1]
            .parse::<u64>()
            .map_err(|err| anyhow!("{}", err))? as usize;
    }
    let mut env = cl.env.borrow_mut();
    let cur = env.stack().get("*");
    let n = n.min(cur.len());
    env.stack_mut().set("*", cur[n..].to_vec());
    Ok(())
}

fn bi_unbind(cl: &mut Interpreter, _ctx: &mut Context, args: &[String]) -> Result<()> {
    match cl.func_map.remove(&args[1]) {
        Some(_) => Ok(()),
        None => Err(anyhow!("function not found")),
    }
}

/// `repeat {N|T} CMD`: push the body as a rewindable frame that re-runs
/// until the count and deadline are both exhausted.
fn bi_repeat(cl: &mut Interpreter, ctx: &mut Context, args: &[String]) -> Result<()> {
    let spec = &args[1];
    let mut count: u64 = 0;
    let mut deadline = None;
    match humantime::parse_duration(spec) {
        Ok(d) => {
            if d.is_zero() {
                return Ok(());
            }
            deadline = Some(Instant::now() + d);
        }
        Err(_) => {
            count = spec
                .parse::<u64>()
                .map_err(|_| anyhow!("bad count or duration {:?}", spec))?;
            if count == 0 {
                return Ok(());
            }
        }
    }
    let line = cl.cur_line.clone();
    let raw = raw_fields(&line);
    let k = raw_name_index(&raw);
    let body: Rc<str> = cl.parse_cmd(&line, &raw, k + 2)?.into();
    let rewind_body = Rc::clone(&body);
    let rewind: Box<dyn Fn() -> Box<dyn Scanner>> =
        Box::new(move || Box::new(StringScanner::new(&rewind_body)));
    let first = rewind();
    let w = ctx.writer().clone();
    cl.push_frame(first, Some(Repetition::new(count, deadline)), Some(rewind), w);
    Ok(())
}

fn bi_return(cl: &mut Interpreter, _ctx: &mut Context, _args: &[String]) -> Result<()> {
    cl.return_from_func()
}

fn bi_break(cl: &mut Interpreter, _ctx: &mut Context, _args: &[String]) -> Result<()> {
    cl.break_loop()
}

fn bi_false(_cl: &mut Interpreter, _ctx: &mut Context, _args: &[String]) -> Result<()> {
    Err(anyhow!("false"))
}

fn bi_sleep(_cl: &mut Interpreter, ctx: &mut Context, args: &[String]) -> Result<()> {
    let d = humantime::parse_duration(&args[1]).map_err(|err| anyhow!("{}", err))?;
    if ctx.interrupter().sleep(d) {
        Ok(())
    } else {
        Err(InterpError::Interrupted.into())
    }
}

fn bi_exit(cl: &mut Interpreter, _ctx: &mut Context, _args: &[String]) -> Result<()> {
    cl.exit_flag = true;
    Ok(())
}
