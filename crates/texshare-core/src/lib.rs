//! Core types shared by every texshare crate.
//!
//! This crate provides the foundational vocabulary of the shared memory layer:
//! - Texture formats, including multi-planar YUV layouts and DRM fourcc codes
//! - Usage capability flags
//! - Extents and texture dimensions
//! - Protocol-wide constants

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Extent3d, TextureDimension, TextureFormat, TextureUsage};

/// Protocol-wide constants.
pub mod constants {
    /// Key every cooperating process acquires and releases a keyed mutex with.
    pub const KEYED_MUTEX_ACQUIRE_KEY: u64 = 0;
    /// Keyed mutex acquire timeout meaning "wait forever" (Win32 `INFINITE`).
    pub const KEYED_MUTEX_INFINITE_TIMEOUT_MS: u32 = u32::MAX;
    /// Maximum number of planes a shared allocation may have.
    pub const MAX_PLANES: usize = 3;
    /// Value a binary primitive reports once signaled.
    pub const BINARY_SIGNALED_VALUE: u64 = 1;
}
