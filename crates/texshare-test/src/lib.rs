//! Test harness for texshare.
//!
//! Provides one strategy object per backend that knows how to create devices,
//! allocations and begin states for that backend, so the integration suites can run
//! the same scenario against every backend.

pub mod harness;

pub use harness::{
    capability_table, layout_state, read_planes, render_clear, share_fences, TestBackend,
    TestDevices,
};

use texshare_core::{Extent3d, TextureFormat};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] texshare_gpu::GpuError),
    #[error("Memory error: {0}")]
    Memory(#[from] texshare_memory::MemoryError),
    #[error("Access error: {0}")]
    Access(#[from] texshare_memory::AccessError),
    #[error("Readback mismatch: {0}")]
    Readback(String),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Allocation parameters used by the harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub format: TextureFormat,
    pub size: Extent3d,
    /// Maximum number of open handles in the test context.
    pub max_handles: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            format: TextureFormat::Rgba8Unorm,
            size: Extent3d::new_2d(4, 4),
            max_handles: 256,
        }
    }
}
