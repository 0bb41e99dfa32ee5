//! Validation and access protocol errors.

use std::fmt;

use texshare_core::{Extent3d, TextureDimension, TextureFormat, TextureUsage};
use texshare_gpu::{BackendKind, DeviceId, FenceId, GpuError, SyncPrimitiveKind};
use thiserror::Error;

/// Validation errors raised by imports, texture creation and submission.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// The import descriptor is missing, unrecognised or disagrees with the platform object.
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Texture format {requested} does not match memory format {memory}")]
    FormatMismatch {
        requested: TextureFormat,
        memory: TextureFormat,
    },

    #[error("Texture usage {requested:?} is not a subset of memory usage {memory:?}")]
    UsageNotAllowed {
        requested: TextureUsage,
        memory: TextureUsage,
    },

    #[error("Texture dimension {0:?} is not 2D")]
    DimensionNotSupported(TextureDimension),

    #[error("Mip level count ({mip_level_count}) and sample count ({sample_count}) must both be 1")]
    MipOrSampleNotSupported {
        mip_level_count: u32,
        sample_count: u32,
    },

    #[error("Texture size {requested} does not match memory size {memory}")]
    SizeMismatch {
        requested: Extent3d,
        memory: Extent3d,
    },

    /// Operation on a memory object that failed to import.
    #[error("{0} is an error object")]
    ErrorObject(String),

    /// Work references a texture outside of an access session.
    #[error("{0} is used while not being accessed")]
    NotAccessed(String),

    /// A write was recorded on a texture accessed read-only.
    #[error("{0} is written while accessed for reading")]
    ReadOnlyAccess(String),

    #[error("{texture} is missing usage {usage:?}")]
    MissingUsage {
        texture: String,
        usage: TextureUsage,
    },

    /// Work references a texture created on another device.
    #[error("{texture} belongs to device {texture_device}, not {queue_device}")]
    WrongDevice {
        texture: String,
        texture_device: DeviceId,
        queue_device: DeviceId,
    },

    #[error("{texture} has format {format} which cannot be rendered to")]
    UnrenderableFormat {
        texture: String,
        format: TextureFormat,
    },

    #[error("Cannot copy {source_texture} to {destination}: {reason}")]
    CopyMismatch {
        source_texture: String,
        destination: String,
        reason: String,
    },

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Core(#[from] texshare_core::Error),
}

/// Access protocol errors raised by begin/end access.
///
/// A rejected call leaves the access state exactly as it was.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("{texture} is already used to access {memory}")]
    AlreadyAccessing { texture: String, memory: String },

    #[error("{memory} is currently accessed for writing")]
    HeldForWriting { memory: String },

    #[error("{memory} is currently accessed for exclusive reading")]
    HeldForExclusiveReading { memory: String },

    #[error("{memory} is currently accessed for reading")]
    HeldForReading { memory: String },

    #[error("Concurrent reading read-write {texture} is not allowed")]
    ConcurrentReadWrite { texture: String },

    #[error("Concurrent reading uninitialized {texture} is not allowed")]
    ConcurrentReadUninitialized { texture: String },

    #[error("{backend} does not support concurrent reading {scope}")]
    ConcurrentReadUnsupported {
        backend: BackendKind,
        scope: ReadScope,
    },

    #[error("{texture} is not currently being accessed")]
    NotAccessed { texture: String },

    #[error("Device {0} is lost")]
    DeviceLost(String),

    #[error("Invalid backend state: {0}")]
    InvalidBackendState(String),

    #[error("{kind} fences cannot be waited on by {backend} devices")]
    UnsupportedFence {
        kind: SyncPrimitiveKind,
        backend: BackendKind,
    },

    #[error("Fence {fence:?} was not imported into device {device}")]
    ForeignFence { fence: FenceId, device: DeviceId },

    #[error(transparent)]
    Sync(#[from] GpuError),
}

impl AccessError {
    /// Whether the error was caused by the device being lost.
    pub const fn is_device_lost(&self) -> bool {
        match self {
            Self::DeviceLost(_) => true,
            Self::Sync(e) => e.is_device_lost(),
            _ => false,
        }
    }
}

/// Where concurrent readers live relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadScope {
    IntraDevice,
    CrossDevice,
}

impl fmt::Display for ReadScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IntraDevice => "within one device",
            Self::CrossDevice => "across devices",
        })
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, MemoryError>;
