//! Error types for all collector operations.

use thiserror::Error;

/// Main error type for GC operations
#[derive(Debug, Error)]
pub enum GcError {
    #[error("Out of heap: requested {requested} bytes, limit {limit} bytes")]
    OutOfHeap { requested: usize, limit: usize },

    #[error("Thread is not registered with the collector")]
    ThreadNotRegistered,

    #[error("Root error: {0}")]
    RootError(String),

    #[error("Virtual memory error: {0}")]
    VirtualMemory(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("GC error: {0}")]
    Gc(String),
}

impl GcError {
    /// Check if this error may succeed on retry (after a collection).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GcError::OutOfHeap { .. })
    }
}

/// Result type alias for GC operations
pub type Result<T> = std::result::Result<T, GcError>;
