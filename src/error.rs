//! Error types for trace-ring operations

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while creating or using a trace mapping
#[derive(Debug, Error)]
pub enum RingError {
    /// An attached file's header disagrees with the requested configuration
    #[error("config mismatch on '{field}': expected {expected}, got {actual}")]
    ConfigMismatch {
        /// Header field that disagreed
        field: &'static str,
        /// Value the caller asked for (or the value implied by the file length)
        expected: String,
        /// Value found in the file
        actual: String,
    },

    /// Open, map, resize or lock failure on the backing file
    #[error("filesystem error on '{}': {}", .path.display(), .source)]
    FileSystem {
        /// Backing file path
        path: PathBuf,
        /// Source IO error
        source: std::io::Error,
    },

    /// System call failure outside the file path (pid lookup, flock)
    #[error("system call error during {op}: {source}")]
    Os {
        /// Operation that failed
        op: &'static str,
        /// Underlying errno
        source: nix::errno::Errno,
    },

    /// No free ring in the pool; the caller continues uninstrumented
    #[error("ring pool exhausted")]
    Exhausted,

    /// Payload exceeds a configured bound
    #[error("payload of {len} bytes exceeds capacity of {capacity}")]
    TooLarge {
        /// Offered payload length
        len: usize,
        /// Configured bound
        capacity: usize,
    },

    /// Caller tried to free a ring it does not own
    #[error("ring {index} is not owned by the caller")]
    NotOwner {
        /// Ring index
        index: usize,
    },

    /// Reserved for reader-side snapshot validation
    #[error("torn read detected")]
    Torn,
}

/// Result type for trace-ring operations
pub type RingResult<T> = Result<T, RingError>;

impl RingError {
    /// Wrap an IO error with the backing path it occurred on.
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }
}
