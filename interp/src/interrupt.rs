//! Asynchronous interruption of a running interpreter.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A cloneable, thread-safe handle used to interrupt the interpreter.
///
/// The interpreter probes the pending flag before and after every line read
/// and after every command, so a signal delivered between commands is
/// observed immediately. Commands receive a clone through their context and
/// may poll [`is_pending`](Interrupter::is_pending) or block in
/// [`sleep`](Interrupter::sleep), which wakes as soon as an interrupt
/// arrives.
#[derive(Clone, Default)]
pub struct Interrupter {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an interrupt. Safe to call from any thread; wakes any waiter
    /// blocked in [`sleep`](Interrupter::sleep).
    pub fn interrupt(&self) {
        let mut pending = self.inner.pending.lock().unwrap();
        *pending = true;
        self.inner.cond.notify_all();
    }

    /// Whether an interrupt has been delivered and not yet handled.
    pub fn is_pending(&self) -> bool {
        *self.inner.pending.lock().unwrap()
    }

    /// Consume a pending interrupt. Returns whether one was pending.
    pub(crate) fn take(&self) -> bool {
        let mut pending = self.inner.pending.lock().unwrap();
        std::mem::replace(&mut *pending, false)
    }

    /// Sleep for `d`, waking early on interrupt. Returns `true` when the
    /// full duration elapsed, `false` when interrupted. The pending flag is
    /// left set for the interpreter to handle.
    pub fn sleep(&self, d: Duration) -> bool {
        let pending = self.inner.pending.lock().unwrap();
        let (pending, result) = self
            .inner
            .cond
            .wait_timeout_while(pending, d, |pending| !*pending)
            .unwrap();
        result.timed_out() && !*pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_take_consumes_pending() {
        let intr = Interrupter::new();
        assert!(!intr.is_pending());
        intr.interrupt();
        assert!(intr.is_pending());
        assert!(intr.take());
        assert!(!intr.is_pending());
        assert!(!intr.take());
    }

    #[test]
    fn test_sleep_completes_without_interrupt() {
        let intr = Interrupter::new();
        assert!(intr.sleep(Duration::from_millis(10)));
    }

    #[test]
    fn test_sleep_wakes_on_interrupt() {
        let intr = Interrupter::new();
        let remote = intr.clone();
        let start = Instant::now();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.interrupt();
        });
        assert!(!intr.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(intr.is_pending());
    }
}
