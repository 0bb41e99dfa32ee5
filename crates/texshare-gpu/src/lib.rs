//! Device and synchronization layer for texshare.
//!
//! This crate provides:
//! - An explicit process [`Context`] owning the portable handle table
//! - Software device contexts with an ordered submission queue
//! - Exportable fences and the per-backend synchronization adapters
//! - Keyed mutexes for backends that serialize through one
//! - The backend capability matrix
//! - A Vulkan external semaphore adapter built on `ash`

pub mod capabilities;
pub mod context;
pub mod device;
pub mod error;
pub mod keyed_mutex;
pub mod sync;
pub mod vulkan;

pub use capabilities::{BackendCapabilities, BackendKind, BackendStateKind, SyncPrimitiveKind};
pub use context::{Context, ContextBuilder, HandleObject, RawHandle};
pub use device::{DeviceBuilder, DeviceContext, DeviceId, NativeDeviceId};
pub use error::{GpuError, Result};
pub use keyed_mutex::{KeyedMutex, KeyedMutexStatus, SoftwareKeyedMutex};
pub use sync::{
    adapter_for, FenceCell, FenceId, FenceValue, PortablePayload, SharedFence, SoftwareSyncAdapter,
    SyncAdapter,
};
pub use vulkan::VulkanProbe;
