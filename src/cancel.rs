//! A process-wide cancellation flag (SPEC_FULL §5): set from a `SIGINT`
//! handler or the shell's `QUIT` path, polled by long-running client loops
//! (the shell's duration-bounded `MEASURE`, and `TEST`) so they break out
//! promptly instead of running to their full count/deadline.

use std::sync::atomic::{AtomicBool, Ordering};

static CANCELED: AtomicBool = AtomicBool::new(false);

/// Installs a `SIGINT` handler that sets the flag. Safe to call more than
/// once; only the first installation takes effect, matching `ctrlc`'s own
/// "only one handler per process" rule.
pub fn install_sigint_handler() {
    let _ = ctrlc::set_handler(|| {
        request_cancel();
    });
}

pub fn request_cancel() {
    CANCELED.store(true, Ordering::SeqCst);
}

pub fn is_canceled() -> bool {
    CANCELED.load(Ordering::SeqCst)
}

/// Clears the flag, so a single `SIGINT` only aborts the loop that was
/// running when it arrived rather than every loop for the rest of the
/// process's life.
pub fn reset() {
    CANCELED.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear_and_latches_until_reset() {
        reset();
        assert!(!is_canceled());
        request_cancel();
        assert!(is_canceled());
        reset();
        assert!(!is_canceled());
    }
}
