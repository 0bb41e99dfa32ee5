//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Unknown texture format name.
    #[error("Unknown texture format: {0}")]
    UnknownFormat(String),

    /// DRM fourcc code with no matching texture format.
    #[error("Unsupported DRM fourcc: {0:#010x}")]
    UnsupportedFourcc(u32),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
