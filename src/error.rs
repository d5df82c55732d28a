//! Core error taxonomy.
//!
//! Every module-level error type carries an [`ErrorKind`] so callers can apply
//! the propagation policy uniformly: Expected errors are skipped and logged at
//! debug, Recoverable errors are retried, Critical errors fail the operation
//! but allow self-heal on non-protected resources, Fatal errors signal shutdown.

use thiserror::Error;

/// Severity class driving logging level and retry/propagation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Permission denied, file missing, cancellation, invalid parameters.
    /// Logged at debug; the offending item is skipped.
    Expected,
    /// Transient IO (sharing violation, timeout). Logged at warning, retried
    /// with exponential backoff.
    Recoverable,
    /// Index corruption, stuck lock on a protected index. Logged at error;
    /// the operation fails with a structured error.
    Critical,
    /// Out-of-memory, unrecoverable engine errors. Logged at error; the core
    /// signals shutdown.
    Fatal,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error("index error: {0}")]
    Index(#[from] crate::index::IndexError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("watcher error: {0}")]
    Watcher(#[from] crate::watcher::WatcherError),

    #[error("memory error: {0}")]
    Memory(#[from] crate::memory::MemoryError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Registry(e) => e.kind(),
            CoreError::Index(e) => e.kind(),
            CoreError::Pipeline(e) => e.kind(),
            CoreError::Watcher(e) => e.kind(),
            CoreError::Memory(e) => e.kind(),
            CoreError::Io(_) => ErrorKind::Recoverable,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// One per-item failure collected during a bulk operation.
#[derive(Debug, Clone)]
pub struct ItemError {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of a bulk operation: counts plus any per-item failures, never just
/// the first exception.
#[derive(Debug, Clone, Default)]
pub struct OperationReport {
    pub success: bool,
    pub processed: usize,
    pub skipped: usize,
    pub errors: Vec<ItemError>,
    pub duration_ms: u64,
}

impl OperationReport {
    pub fn first_error_kind(&self) -> Option<ErrorKind> {
        self.errors.first().map(|e| e.kind)
    }
}
