//! Line-oriented input sources for the interpreter.

use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::interrupt::Interrupter;

/// A source of logical lines. The interpreter reads one line at a time from
/// whatever scanner is on top of its input stack; the root scanner is
/// injected by the embedder.
pub trait Scanner {
    /// The next line without its trailing newline; `None` at end of input.
    fn next_line(&mut self) -> Option<io::Result<String>>;
}

/// Scanner over any buffered reader, used for sourced files and stdin.
pub struct LinesScanner<R: BufRead> {
    inner: R,
}

impl<R: BufRead> LinesScanner<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: BufRead> Scanner for LinesScanner<R> {
    fn next_line(&mut self) -> Option<io::Result<String>> {
        let mut line = String::new();
        match self.inner.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => {
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                Some(Ok(line))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

/// Scanner over in-memory text, used for function bodies, condition frames
/// and `repeat` iterations. Rewinding a loop just builds a fresh one over
/// the same text.
pub struct StringScanner {
    lines: Vec<String>,
    pos: usize,
}

impl StringScanner {
    pub fn new(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
            pos: 0,
        }
    }
}

impl Scanner for StringScanner {
    fn next_line(&mut self) -> Option<io::Result<String>> {
        let line = self.lines.get(self.pos)?;
        self.pos += 1;
        Some(Ok(line.clone()))
    }
}

/// Moves a blocking scanner onto a background thread and hands its lines
/// over a channel, so a read that is waiting for input can be abandoned when
/// an interrupt arrives.
///
/// This is the piece that makes an interactive session responsive to
/// interrupts delivered while the interpreter is blocked at the prompt: the
/// receive loop wakes on the interrupt flag and returns `None`, and the
/// interpreter sees the pending interrupt before treating that as end of
/// input.
pub struct SpawnedScanner {
    rx: Receiver<io::Result<String>>,
    intr: Interrupter,
}

impl SpawnedScanner {
    pub fn spawn<S>(mut scanner: S, intr: Interrupter) -> Self
    where
        S: Scanner + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            while let Some(item) = scanner.next_line() {
                if tx.send(item).is_err() {
                    break;
                }
            }
        });
        Self { rx, intr }
    }
}

impl Scanner for SpawnedScanner {
    fn next_line(&mut self) -> Option<io::Result<String>> {
        loop {
            if self.intr.is_pending() {
                return None;
            }
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(item) => return Some(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}
