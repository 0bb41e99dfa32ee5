//! GPU and synchronization error types.

use ash::vk;
use thiserror::Error;

use crate::capabilities::{BackendKind, SyncPrimitiveKind};

/// `DXGI_ERROR_DEVICE_REMOVED`, the status a keyed mutex reports once its device is gone.
pub const DXGI_ERROR_DEVICE_REMOVED: i32 = 0x887A_0005_u32 as i32;
/// `DXGI_ERROR_INVALID_CALL`.
pub const DXGI_ERROR_INVALID_CALL: i32 = 0x887A_0001_u32 as i32;
/// `EMFILE`, reported when the handle table is exhausted.
pub const EMFILE: i32 = 24;

/// Device and synchronization errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The backend cannot export this primitive kind.
    #[error("Fence of kind {kind} cannot be exported by {backend}")]
    UnsupportedPrimitiveType {
        kind: SyncPrimitiveKind,
        backend: BackendKind,
    },

    /// OS-level export failure.
    #[error("Failed to export {kind} fence (OS error {code:#x})")]
    ExportFailed { kind: SyncPrimitiveKind, code: i32 },

    /// Null, unknown, consumed or mistyped payload.
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// The device's backend cannot consume this primitive kind.
    #[error("{backend} device cannot import {kind} fences")]
    DeviceIncompatible {
        backend: BackendKind,
        kind: SyncPrimitiveKind,
    },

    /// The device was lost or destroyed.
    #[error("Device {0} is lost")]
    DeviceLost(String),

    /// More than one mutually exclusive fence feature was requested.
    #[error("Fence features are mutually exclusive, requested: {0:?}")]
    ConflictingFenceFeatures(Vec<SyncPrimitiveKind>),

    /// Fence feature the backend does not provide.
    #[error("{backend} does not support the {kind} fence feature")]
    FeatureNotSupported {
        backend: BackendKind,
        kind: SyncPrimitiveKind,
    },

    /// No physical device satisfies the requirements.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Internal failure carrying the OS or driver status code.
    #[error("{message} (status {code:#x})")]
    Internal { message: String, code: i32 },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether the error means the device can no longer be used.
    pub const fn is_device_lost(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost(_) | Self::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
