//! Output with per-line prefixes and a configurable field separator.

use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::io::{self, Seek, SeekFrom, Write};
use std::rc::Rc;

use crate::env::Env;
use crate::template::TemplateMap;

/// Shared output destination: the session stream or a cached redirection
/// target. Frames clone the writer they were given, so all of them end up
/// appending to the same underlying stream.
#[derive(Clone)]
pub(crate) enum Sink {
    Stream(Rc<RefCell<Box<dyn Write>>>),
    File(Rc<RefCell<Box<dyn RedirFile>>>),
}

impl Sink {
    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        match self {
            Sink::Stream(w) => w.borrow_mut().write_all(buf),
            Sink::File(f) => f.borrow_mut().write_all(buf),
        }
    }

    fn flush(&self) -> io::Result<()> {
        match self {
            Sink::Stream(w) => w.borrow_mut().flush(),
            Sink::File(f) => f.borrow_mut().flush(),
        }
    }
}

/// A redirection target: writable, and resettable when `>` reuses a file
/// that is already open.
pub trait RedirFile: Write {
    /// Seek back to the start and truncate, without reopening.
    fn rewind_truncate(&mut self) -> io::Result<()>;
}

impl RedirFile for fs::File {
    fn rewind_truncate(&mut self) -> io::Result<()> {
        self.seek(SeekFrom::Start(0))?;
        self.set_len(0)
    }
}

/// The writer handed to commands: raw writes pass through untouched, while
/// the `print` family prefixes each line with the rendered `prefix` template
/// and joins slices with the current `OFS`. Both variables are read from the
/// environment at write time, so an assignment takes effect on the very next
/// line of output.
#[derive(Clone)]
pub struct Writer {
    sink: Sink,
    env: Rc<RefCell<Env>>,
    templates: Rc<RefCell<TemplateMap>>,
}

impl Writer {
    pub(crate) fn new(
        sink: Sink,
        env: Rc<RefCell<Env>>,
        templates: Rc<RefCell<TemplateMap>>,
    ) -> Self {
        Self {
            sink,
            env,
            templates,
        }
    }

    /// Format one line; a newline is appended.
    pub fn printf(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.print(&format!("{}\n", args))
    }

    /// Write one line; a newline is appended.
    pub fn println(&mut self, line: &str) -> io::Result<()> {
        self.print(&format!("{}\n", line))
    }

    /// Write the fields joined with the current field separator, newline
    /// appended.
    pub fn print_slice(&mut self, fields: &[String]) -> io::Result<()> {
        let sep = self.field_sep();
        self.print(&format!("{}\n", fields.join(&sep)))
    }

    fn field_sep(&self) -> String {
        unescape(&self.env.borrow().getenv("OFS"))
    }

    fn prefix(&self) -> String {
        let src = unescape(&self.env.borrow().getenv("prefix"));
        if src.is_empty() {
            return String::new();
        }
        match self.templates.borrow_mut().get(&src) {
            Ok(t) => t.render(),
            // A broken prefix template shows up on every line instead of
            // silently disappearing.
            Err(err) => format!("<{}>", err),
        }
    }

    fn print(&mut self, s: &str) -> io::Result<()> {
        let prefix = self.prefix();
        self.sink.write_all(prefix.as_bytes())?;
        self.sink.write_all(s.as_bytes())
    }
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// Process the backslash escapes accepted in the `prefix` and `OFS`
/// variables. Unknown escapes keep their backslash.
pub(crate) fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(r) = chars.next() {
        if r != '\\' {
            out.push(r);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_writer() -> (Writer, Rc<RefCell<Env>>, Rc<RefCell<Vec<u8>>>) {
        let buf = Rc::new(RefCell::new(Vec::new()));
        let sink = Sink::Stream(Rc::new(RefCell::new(
            Box::new(SharedBuf(Rc::clone(&buf))) as Box<dyn Write>,
        )));
        let env = Rc::new(RefCell::new(Env::new()));
        let templates = Rc::new(RefCell::new(TemplateMap::new(4)));
        (Writer::new(sink, Rc::clone(&env), templates), env, buf)
    }

    fn contents(buf: &Rc<RefCell<Vec<u8>>>) -> String {
        String::from_utf8(buf.borrow().clone()).unwrap()
    }

    #[test]
    fn test_print_slice_joins_with_live_ofs() {
        let (mut w, env, buf) = test_writer();
        w.print_slice(&["a".into(), "b".into()]).unwrap();
        env.borrow_mut().setenv("OFS", ":");
        w.print_slice(&["a".into(), "b".into()]).unwrap();
        assert_eq!(contents(&buf), "a b\na:b\n");
    }

    #[test]
    fn test_prefix_applies_to_printed_lines_only() {
        let (mut w, env, buf) = test_writer();
        env.borrow_mut().setenv("prefix", "[{{div 4 2}}] ");
        w.println("hello").unwrap();
        w.write_all(b"raw").unwrap();
        assert_eq!(contents(&buf), "[2] hello\nraw");
    }

    #[test]
    fn test_bad_prefix_shows_error() {
        let (mut w, env, buf) = test_writer();
        env.borrow_mut().setenv("prefix", "{{frob}}");
        w.println("x").unwrap();
        assert!(contents(&buf).starts_with("<unknown function"));
    }

    #[test]
    fn test_ofs_escapes() {
        let (mut w, env, buf) = test_writer();
        env.borrow_mut().setenv("OFS", r"\t");
        w.print_slice(&["a".into(), "b".into()]).unwrap();
        assert_eq!(contents(&buf), "a\tb\n");
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\tb\nc"), "a\tb\nc");
        assert_eq!(unescape(r"keep\qme"), r"keep\qme");
        assert_eq!(unescape(r"end\"), "end\\");
    }
}
