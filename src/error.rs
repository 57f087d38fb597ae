//! Error types for tensor_bridge

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for tensor_bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Coarse classification of a [`BridgeError`], used by the session loop to
/// decide whether a failure ends the cycle, the session, or neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A pipe is unavailable, the peer never answered, or the wait was interrupted
    ConnectionFailure,
    /// An encoded frame does not fit the arena
    CapacityExceeded,
    /// A payload does not have the expected structure
    FormatError,
    /// The native engine returned a non-zero status
    FfiStatusError,
    /// Releasing a pipe or segment failed during shutdown
    ResourceCleanupError,
    /// Invalid configuration or setup
    Configuration,
    /// An engine worker thread is gone
    Worker,
}

/// Errors that can occur in tensor_bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Failed to create a named pipe
    #[error("Failed to create pipe '{path}': {source}")]
    PipeCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to open a named pipe
    #[error("Failed to open pipe '{path}': {source}")]
    PipeOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Read, write or poll on an open pipe failed
    #[error("I/O error on pipe '{path}': {source}")]
    PipeIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The peer did not answer before the deadline
    #[error("Timed out after {timeout:?} on pipe '{path}'")]
    TimedOut { path: PathBuf, timeout: Duration },

    /// The wait was cancelled by the shutdown flag
    #[error("Interrupted while waiting on pipe '{path}'")]
    Interrupted { path: PathBuf },

    /// Failed to derive a SysV key from a path
    #[error("Failed to derive shared memory key from '{path}': {source}")]
    ShmKey {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create shared memory
    #[error("Failed to create shared memory (key 0x{key:08X}, {size} bytes): {source}")]
    ShmCreate {
        key: i32,
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Failed to look up or attach shared memory
    #[error("Failed to attach shared memory {target}: {source}")]
    ShmAttach {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Frame does not fit the arena
    #[error("Frame overflow: capacity {capacity} bytes, frame needs {needed} bytes")]
    CapacityExceeded { capacity: usize, needed: usize },

    /// Length prefix read from the arena is out of bounds
    #[error("Corrupt frame: declared length {declared} exceeds limit {limit}")]
    CorruptFrame { declared: usize, limit: usize },

    /// Payload structure is not what the protocol expects
    #[error("Malformed payload: {0}")]
    Format(String),

    /// Dtype code outside the known table
    #[error("Unknown dtype code: {0}")]
    UnknownDType(i64),

    /// Buffer length disagrees with shape and dtype
    #[error("Tensor '{name}' expects {expected} bytes, got {got}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// Two tensors with the same name in one set
    #[error("Duplicate tensor name: {0}")]
    DuplicateTensor(String),

    /// Engine library or one of its symbols could not be loaded
    #[error("Failed to load engine library '{path}': {reason}")]
    LibraryLoad { path: PathBuf, reason: String },

    /// Engine call returned a non-zero status
    #[error("Engine call `{call}` failed with status {status}: {message}")]
    FfiStatus {
        call: &'static str,
        status: i32,
        message: String,
    },

    /// Releasing a resource failed
    #[error("Failed to release {resource}: {source}")]
    Cleanup {
        resource: String,
        #[source]
        source: io::Error,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Engine worker could not be started or has exited
    #[error("Engine worker '{name}' unavailable: {reason}")]
    Worker { name: String, reason: String },
}

impl BridgeError {
    /// Map this error onto the protocol's error taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::PipeCreate { .. }
            | BridgeError::PipeOpen { .. }
            | BridgeError::PipeIo { .. }
            | BridgeError::TimedOut { .. }
            | BridgeError::Interrupted { .. } => ErrorCategory::ConnectionFailure,
            BridgeError::CapacityExceeded { .. } => ErrorCategory::CapacityExceeded,
            BridgeError::CorruptFrame { .. }
            | BridgeError::Format(_)
            | BridgeError::UnknownDType(_)
            | BridgeError::ShapeMismatch { .. } => ErrorCategory::FormatError,
            BridgeError::FfiStatus { .. } => ErrorCategory::FfiStatusError,
            BridgeError::Cleanup { .. } => ErrorCategory::ResourceCleanupError,
            BridgeError::ShmKey { .. }
            | BridgeError::ShmCreate { .. }
            | BridgeError::ShmAttach { .. }
            | BridgeError::DuplicateTensor(_)
            | BridgeError::LibraryLoad { .. }
            | BridgeError::Config(_) => ErrorCategory::Configuration,
            BridgeError::Worker { .. } => ErrorCategory::Worker,
        }
    }

    /// True for errors that mean "the reply is unusable" rather than "the session is broken"
    pub fn is_format_error(&self) -> bool {
        self.category() == ErrorCategory::FormatError
    }

    /// True when the wait ended because of the shutdown flag
    pub fn is_interrupted(&self) -> bool {
        matches!(self, BridgeError::Interrupted { .. })
    }
}
