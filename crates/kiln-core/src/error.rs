//! Error type for the kiln core.

use std::path::PathBuf;

use crate::runtime::{ResourceKind, Status};

/// Result alias used throughout `kiln-core`.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Errors raised by handle ownership, enumeration, compilation and dispatch.
///
/// Failures are raised where they are detected and propagated uncaught; the
/// only cleanup is each handle releasing its own reference on drop.
#[derive(Debug, thiserror::Error)]
pub enum KilnError {
    /// Platform or device index out of range.
    #[error("invalid {what} index {index} (found {count})")]
    InvalidIndex { what: &'static str, index: usize, count: usize },

    /// The platform reports zero devices.
    #[error("no devices found on platform")]
    NoDevices,

    /// An acquire/create/allocate/release call was rejected by the runtime.
    #[error("{operation} failed: {status}")]
    Resource { operation: String, status: Status },

    /// A capability/info query was rejected by the runtime.
    #[error("{query} query failed: {status}")]
    Query { query: String, status: Status },

    /// Program compilation failed; `log` is the runtime's full build log.
    #[error("failed to build program: {status}")]
    Build { status: Status, log: String },

    /// Enqueueing a transfer or kernel launch (or waiting on one) failed.
    #[error("{operation} failed: {status}")]
    Dispatch { operation: String, status: Status },

    /// The number of bound arguments differs from the kernel's signature.
    #[error("kernel '{kernel}' takes {expected} arguments, {got} given")]
    ArgumentCount { kernel: String, expected: usize, got: usize },

    /// A host ↔ device copy would run past the end of the allocation.
    #[error("transfer out of bounds: offset {offset} + {len} bytes > buffer size {capacity}")]
    TransferOutOfBounds { offset: usize, len: usize, capacity: usize },

    /// Operation on an unbound or already released handle.
    #[error("{0} handle is unbound or already released")]
    Released(ResourceKind),

    /// No usable compute runtime.
    #[error("compute runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to read kernel source {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl KilnError {
    pub fn resource(operation: impl Into<String>, status: Status) -> Self {
        Self::Resource { operation: operation.into(), status }
    }

    pub fn query(query: impl Into<String>, status: Status) -> Self {
        Self::Query { query: query.into(), status }
    }

    pub fn dispatch(operation: impl Into<String>, status: Status) -> Self {
        Self::Dispatch { operation: operation.into(), status }
    }

    /// The runtime status behind this error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Resource { status, .. }
            | Self::Query { status, .. }
            | Self::Build { status, .. }
            | Self::Dispatch { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Build log carried by a [`KilnError::Build`].
    pub fn build_log(&self) -> Option<&str> {
        match self {
            Self::Build { log, .. } => Some(log),
            _ => None,
        }
    }
}
