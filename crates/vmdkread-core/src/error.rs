//! Error types for the vmdkread core library.

use std::path::PathBuf;

/// The main error type for VMDK read operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Operation not valid for the handle's current open/closed state.
    #[error("state error: {message}")]
    State { message: String },

    /// Malformed argument supplied by the caller.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Error parsing a VMDK descriptor.
    #[error("descriptor error: {message}")]
    Descriptor { message: String },

    /// Error reading a sparse extent file.
    #[error("sparse extent error: {message}")]
    SparseExtent { message: String },

    /// Resolved extents do not form a contiguous, non-overlapping address space.
    #[error("format error: {message}")]
    Format { message: String },
}

/// A specialized Result type for VMDK read operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a state error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a descriptor error.
    pub fn descriptor(message: impl Into<String>) -> Self {
        Self::Descriptor {
            message: message.into(),
        }
    }

    /// Create a sparse extent error.
    pub fn sparse_extent(message: impl Into<String>) -> Self {
        Self::SparseExtent {
            message: message.into(),
        }
    }

    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
