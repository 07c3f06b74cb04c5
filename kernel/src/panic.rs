//! Kernel Panic
//!
//! Fatal halt for unrecoverable kernel conditions. Triggering is
//! idempotent: only the first call reports anything, and a re-entrant
//! call made while reporting returns at once.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

/// Shown when the panic message itself could not be written
pub const FAULT_BANNER: &str = "\
========================================
Exception occurred during Kernel Panic :(
========================================";

/// One-shot panic flag
#[derive(Debug)]
pub struct PanicLatch {
    triggered: AtomicBool,
}

impl PanicLatch {
    pub const fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
        }
    }

    /// Check if the latch has fired
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Fire the latch
    ///
    /// Writes `KERNEL PANIC! <message>` to `stream`. If that fails,
    /// `notice` is called with the fallback text instead. Returns false
    /// if the latch had already fired and nothing was reported.
    pub fn trigger<W, N>(&self, message: &str, stream: &mut W, notice: N) -> bool
    where
        W: Write + ?Sized,
        N: FnOnce(&str),
    {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }

        error!("KERNEL PANIC! {}", message);

        let written = writeln!(stream, "KERNEL PANIC! {}", message).and_then(|_| stream.flush());
        if let Err(err) = written {
            notice(&format!("{}\n{}: {}", FAULT_BANNER, message, err));
        }
        true
    }
}

impl Default for PanicLatch {
    fn default() -> Self {
        Self::new()
    }
}

static KERNEL_PANIC: PanicLatch = PanicLatch::new();

/// Halt the kernel with `message`
///
/// Returns false if a panic was already in progress.
pub fn panic(message: &str) -> bool {
    KERNEL_PANIC.trigger(message, &mut io::stderr(), interactive_notice)
}

/// Check if a kernel panic has been triggered
pub fn is_panicking() -> bool {
    KERNEL_PANIC.is_triggered()
}

/// Print to stdout and block until the operator presses enter
fn interactive_notice(text: &str) {
    let mut stdout = io::stdout();
    let _ = writeln!(stdout, "{}\nPress enter to acknowledge.", text);
    let _ = stdout.flush();

    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct BrokenStream;

    impl Write for BrokenStream {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_panic_reports_once() {
        let latch = PanicLatch::new();
        let mut out = Vec::new();
        let notices = Cell::new(0);

        assert!(latch.trigger("x", &mut out, |_| notices.set(notices.get() + 1)));
        assert!(!latch.trigger("x", &mut out, |_| notices.set(notices.get() + 1)));

        assert_eq!(String::from_utf8(out).unwrap(), "KERNEL PANIC! x\n");
        assert_eq!(notices.get(), 0);
        assert!(latch.is_triggered());
    }

    #[test]
    fn test_fallback_notice() {
        let latch = PanicLatch::new();
        let mut shown = None;

        assert!(latch.trigger("table corrupt", &mut BrokenStream, |text| shown = Some(text.to_string())));

        let shown = shown.unwrap();
        assert!(shown.starts_with(FAULT_BANNER));
        assert!(shown.contains("table corrupt"));

        // Still latched after the fallback path
        assert!(!latch.trigger("again", &mut BrokenStream, |_| unreachable!()));
    }
}
