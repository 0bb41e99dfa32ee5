//! Shared texture memory for texshare.
//!
//! This crate provides:
//! - Platform allocations and their export as import chains
//! - [`SharedTextureMemory`], one allocation imported into one device
//! - [`SharedTexture`] begin/end access sessions with fences and backend state
//! - The access state machine every import of an allocation shares
//! - A small command queue that orders work against access sessions

mod access;
mod backend_state;
pub mod commands;
pub mod descriptor;
pub mod error;
mod memory;
mod platform;
mod texture;

pub use access::{AccessMode, AccessState, TextureKey};
pub use backend_state::BackendState;
pub use commands::{
    CommandBuffer, CommandEncoder, LoadOp, Queue, ReadbackId, SampleId, StoreOp, SubmittedWork,
};
pub use descriptor::{
    BeginAccessDescriptor, DmaBufDescriptor, DmaBufPlane, EndAccessState, MemoryChain,
    SharedTextureMemoryDescriptor, SharedTextureMemoryProperties, TextureDescriptor,
    DRM_FORMAT_MOD_LINEAR,
};
pub use error::{AccessError, MemoryError, ReadScope, Result};
pub use memory::SharedTextureMemory;
pub use platform::{linear_planes, PlatformTexture, PlatformTextureDescriptor, UNINITIALIZED_BYTE};
pub use texture::SharedTexture;
