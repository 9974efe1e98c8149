use std::fmt;

use backtrace::Backtrace;

/// Error kinds surfaced by the codec, the table/index manager, the runtime
/// and the flusher. Modeled as a flat enum, in the spirit of the crate's
/// original `SimpleError`, rather than one error type per subsystem, so the
/// shell can print a single-line diagnostic no matter which layer failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    TupleNotFound,
    NoCurrentTuple,
    WrongDiskData(String),
    InconsistentIndex(String),
    OpenScanError(String),
    IndexNotFound(String),
    LoadNotExclusive,
    FileException(String),
    OutOfRange,
    TerminatedBuffer,
    DispatcherError(String),
    ErrorInIndexLoad(String),
    MaxRetriesExceeded,
    /// Non-retryable failure reported by the storage manager.
    StorageManager(String),
    /// Retryable failure (deadlock-like) reported by the storage manager.
    Retryable(String),
    Config(String),
}

impl CoreError {
    /// Whether the Session should resubmit the owning transaction rather
    /// than surface the error to the client (see SPEC_FULL §4.7).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Retryable(_))
    }

    /// Logs this error at `error` level together with a captured backtrace.
    /// Reserved for failures an operator actually needs to chase down (a
    /// failed action body, a poisoned flush) rather than routine retryable
    /// contention, which is noisy enough without one.
    pub fn log_with_backtrace(&self, context: &str) {
        log::error!("{}: {}\n{:?}", context, self, Backtrace::new());
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CoreError::TupleNotFound => write!(f, "tuple not found"),
            CoreError::NoCurrentTuple => write!(f, "no current tuple"),
            CoreError::WrongDiskData(s) => write!(f, "wrong disk data: {}", s),
            CoreError::InconsistentIndex(s) => write!(f, "inconsistent index: {}", s),
            CoreError::OpenScanError(s) => write!(f, "could not open scan: {}", s),
            CoreError::IndexNotFound(s) => write!(f, "index not found: {}", s),
            CoreError::LoadNotExclusive => write!(f, "load requires exclusive access"),
            CoreError::FileException(s) => write!(f, "file exception: {}", s),
            CoreError::OutOfRange => write!(f, "out of range"),
            CoreError::TerminatedBuffer => write!(f, "line buffer exceeded its bound"),
            CoreError::DispatcherError(s) => write!(f, "dispatcher error: {}", s),
            CoreError::ErrorInIndexLoad(s) => write!(f, "error in index load: {}", s),
            CoreError::MaxRetriesExceeded => write!(f, "max retries exceeded"),
            CoreError::StorageManager(s) => write!(f, "storage manager error: {}", s),
            CoreError::Retryable(s) => write!(f, "retryable error: {}", s),
            CoreError::Config(s) => write!(f, "configuration error: {}", s),
        }
    }
}

impl std::error::Error for CoreError {
    fn description(&self) -> &str {
        "dora-engine core error"
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
