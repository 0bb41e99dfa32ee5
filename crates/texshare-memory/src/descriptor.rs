//! Import, texture and access descriptors.

use std::fmt;

use texshare_core::{Extent3d, TextureDimension, TextureFormat, TextureUsage};
use texshare_gpu::{BackendKind, FenceValue, RawHandle};

use crate::backend_state::BackendState;

/// `DRM_FORMAT_MOD_LINEAR`.
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// Layout of one dma-buf plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBufPlane {
    pub offset: u64,
    pub stride: u32,
}

/// Linux dma-buf import description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaBufDescriptor {
    pub fd: RawHandle,
    pub size: Extent3d,
    pub drm_format: u32,
    pub drm_modifier: u64,
    pub planes: Vec<DmaBufPlane>,
}

/// Platform specific part of an import descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryChain {
    /// Device-native D3D11 texture wrapped directly.
    D3D11Texture2D { texture: RawHandle },
    DxgiSharedHandle {
        handle: RawHandle,
        use_keyed_mutex: bool,
    },
    DmaBuf(DmaBufDescriptor),
    OpaqueFd {
        fd: RawHandle,
        format: TextureFormat,
        size: Extent3d,
        allocation_size: u64,
    },
    AHardwareBuffer { handle: RawHandle },
    ZirconHandle { vmo: RawHandle, allocation_size: u64 },
    IoSurface { surface: RawHandle },
    EglImage { image: RawHandle },
}

impl MemoryChain {
    /// Backend that consumes this chain.
    pub const fn backend(&self) -> BackendKind {
        match self {
            Self::D3D11Texture2D { .. } => BackendKind::D3D11Texture2D,
            Self::DxgiSharedHandle { .. } => BackendKind::DxgiSharedHandle,
            Self::DmaBuf(_) => BackendKind::DmaBuf,
            Self::OpaqueFd { .. } => BackendKind::OpaqueFd,
            Self::AHardwareBuffer { .. } => BackendKind::SyncFd,
            Self::ZirconHandle { .. } => BackendKind::VkSemaphoreZircon,
            Self::IoSurface { .. } => BackendKind::MtlSharedEvent,
            Self::EglImage { .. } => BackendKind::EglSync,
        }
    }

    /// Handle to the platform allocation.
    pub const fn handle(&self) -> RawHandle {
        match self {
            Self::D3D11Texture2D { texture: handle }
            | Self::DxgiSharedHandle { handle, .. }
            | Self::OpaqueFd { fd: handle, .. }
            | Self::AHardwareBuffer { handle }
            | Self::ZirconHandle { vmo: handle, .. }
            | Self::IoSurface { surface: handle }
            | Self::EglImage { image: handle } => *handle,
            Self::DmaBuf(desc) => desc.fd,
        }
    }
}

impl fmt::Display for MemoryChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::D3D11Texture2D { .. } => "D3D11 texture",
            Self::DxgiSharedHandle { .. } => "DXGI shared handle",
            Self::DmaBuf(_) => "dma-buf",
            Self::OpaqueFd { .. } => "opaque fd",
            Self::AHardwareBuffer { .. } => "AHardwareBuffer",
            Self::ZirconHandle { .. } => "Zircon VMO",
            Self::IoSurface { .. } => "IOSurface",
            Self::EglImage { .. } => "EGL image",
        };
        write!(f, "{name} {}", self.handle())
    }
}

/// Import descriptor.
#[derive(Debug, Clone, Default)]
pub struct SharedTextureMemoryDescriptor {
    pub label: Option<String>,
    pub chain: Option<MemoryChain>,
}

impl SharedTextureMemoryDescriptor {
    pub fn new(chain: MemoryChain) -> Self {
        Self {
            label: None,
            chain: Some(chain),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Immutable properties of an imported allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedTextureMemoryProperties {
    pub format: TextureFormat,
    pub size: Extent3d,
    pub usage: TextureUsage,
}

/// Texture creation descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub dimension: TextureDimension,
    pub size: Extent3d,
    pub mip_level_count: u32,
    pub sample_count: u32,
}

impl TextureDescriptor {
    /// Descriptor mirroring the memory properties.
    pub fn from_properties(properties: SharedTextureMemoryProperties) -> Self {
        Self {
            label: None,
            format: properties.format,
            usage: properties.usage,
            dimension: TextureDimension::D2,
            size: properties.size,
            mip_level_count: 1,
            sample_count: 1,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.format = format;
        self
    }
}

/// Begin access descriptor.
#[derive(Debug, Clone, Default)]
pub struct BeginAccessDescriptor {
    pub concurrent_read: bool,
    /// Whether the contents are defined when access begins.
    pub initialized: bool,
    /// Fences that must complete before work using the texture runs.
    pub fences: Vec<FenceValue>,
    pub backend_state: BackendState,
}

impl BeginAccessDescriptor {
    pub fn new(initialized: bool) -> Self {
        Self {
            initialized,
            ..Self::default()
        }
    }

    pub fn concurrent_read(mut self) -> Self {
        self.concurrent_read = true;
        self
    }

    pub fn with_fences(mut self, fences: Vec<FenceValue>) -> Self {
        self.fences = fences;
        self
    }

    pub fn with_backend_state(mut self, state: BackendState) -> Self {
        self.backend_state = state;
        self
    }
}

/// Result of a successful end access.
#[derive(Debug, Clone)]
pub struct EndAccessState {
    /// Empty when no work used the texture during the session.
    pub fences: Vec<FenceValue>,
    pub initialized: bool,
    pub backend_state: BackendState,
}
