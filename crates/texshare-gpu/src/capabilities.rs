//! Backend capability matrix.
//!
//! Pure declarative policy consulted by the synchronization adapters and by the
//! access state machine. Nothing here touches a device.

use std::fmt;

/// Kind of exportable synchronization primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPrimitiveKind {
    /// Vulkan semaphore exported as an opaque file descriptor.
    VkSemaphoreOpaqueFd,
    /// Linux sync file.
    SyncFd,
    /// Vulkan semaphore exported as a Zircon event handle.
    VkSemaphoreZirconHandle,
    /// D3D12/D3D11 fence exported as a DXGI shared handle.
    DxgiSharedHandle,
    /// Metal shared event.
    MtlSharedEvent,
    /// EGL sync object.
    EglSync,
}

impl SyncPrimitiveKind {
    /// Every primitive kind.
    pub const ALL: [Self; 6] = [
        Self::VkSemaphoreOpaqueFd,
        Self::SyncFd,
        Self::VkSemaphoreZirconHandle,
        Self::DxgiSharedHandle,
        Self::MtlSharedEvent,
        Self::EglSync,
    ];

    /// Timeline primitives carry a monotonically increasing value; the rest are binary.
    pub const fn is_timeline(self) -> bool {
        matches!(self, Self::DxgiSharedHandle | Self::MtlSharedEvent)
    }

    /// Name of the device feature that enables this kind.
    pub const fn feature_name(self) -> &'static str {
        match self {
            Self::VkSemaphoreOpaqueFd => "shared-fence-vk-semaphore-opaque-fd",
            Self::SyncFd => "shared-fence-sync-fd",
            Self::VkSemaphoreZirconHandle => "shared-fence-vk-semaphore-zircon-handle",
            Self::DxgiSharedHandle => "shared-fence-dxgi-shared-handle",
            Self::MtlSharedEvent => "shared-fence-mtl-shared-event",
            Self::EglSync => "shared-fence-egl-sync",
        }
    }
}

impl fmt::Display for SyncPrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::VkSemaphoreOpaqueFd => "VkSemaphoreOpaqueFD",
            Self::SyncFd => "SyncFD",
            Self::VkSemaphoreZirconHandle => "VkSemaphoreZirconHandle",
            Self::DxgiSharedHandle => "DXGISharedHandle",
            Self::MtlSharedEvent => "MTLSharedEvent",
            Self::EglSync => "EGLSync",
        };
        f.write_str(name)
    }
}

/// Platform import path a shared allocation arrives through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Direct wrap of a device-native D3D11 texture.
    D3D11Texture2D,
    /// DXGI shared NT handle, optionally guarded by a keyed mutex.
    DxgiSharedHandle,
    /// Linux dma-buf with DRM format modifiers.
    DmaBuf,
    /// Vulkan opaque file descriptor memory.
    OpaqueFd,
    /// Android hardware buffer synchronized with sync files.
    SyncFd,
    /// Fuchsia VMO synchronized with Zircon event semaphores.
    VkSemaphoreZircon,
    /// IOSurface synchronized with Metal shared events.
    MtlSharedEvent,
    /// EGL image synchronized with EGL sync objects.
    EglSync,
}

/// Kind of out-of-band state a backend carries on begin/end access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendStateKind {
    None,
    D3D11,
    VkImageLayout,
    KeyedMutex,
}

/// Static capabilities of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Backend these capabilities describe.
    pub backend: BackendKind,
    /// Fence kinds the backend can export and import.
    pub fence_kinds: &'static [SyncPrimitiveKind],
    /// Begin access acquires a keyed mutex, end access releases it.
    pub uses_keyed_mutex: bool,
    /// Several concurrent readers on one device.
    pub concurrent_read_intra_device: bool,
    /// Concurrent readers spread over independent devices.
    pub concurrent_read_cross_device: bool,
    /// Importer and exporter must be the identical native device.
    pub use_same_device: bool,
    /// Begin/end state round-tripped through the access calls.
    pub state_kind: BackendStateKind,
    /// Multi-planar (YUV) allocations may be imported.
    pub supports_multi_planar: bool,
}

impl BackendCapabilities {
    /// Whether concurrent read access is supported at all.
    pub const fn supports_concurrent_read(&self) -> bool {
        self.concurrent_read_intra_device || self.concurrent_read_cross_device
    }

    /// Whether fences of `kind` may be exported or imported.
    pub fn supports_fence(&self, kind: SyncPrimitiveKind) -> bool {
        self.fence_kinds.contains(&kind)
    }

    /// The fence kind a device uses when no feature is requested explicitly.
    pub const fn native_fence_kind(&self) -> SyncPrimitiveKind {
        self.fence_kinds[0]
    }
}

const D3D11_TEXTURE_2D: BackendCapabilities = BackendCapabilities {
    backend: BackendKind::D3D11Texture2D,
    fence_kinds: &[SyncPrimitiveKind::DxgiSharedHandle],
    uses_keyed_mutex: false,
    concurrent_read_intra_device: true,
    concurrent_read_cross_device: true,
    use_same_device: true,
    state_kind: BackendStateKind::D3D11,
    supports_multi_planar: true,
};

const DXGI_SHARED_HANDLE: BackendCapabilities = BackendCapabilities {
    backend: BackendKind::DxgiSharedHandle,
    fence_kinds: &[SyncPrimitiveKind::DxgiSharedHandle],
    uses_keyed_mutex: true,
    concurrent_read_intra_device: false,
    concurrent_read_cross_device: false,
    use_same_device: false,
    state_kind: BackendStateKind::KeyedMutex,
    supports_multi_planar: true,
};

// Vulkan-family backends cannot yet run two readers on the same device even though
// the primitives allow it across devices.
const DMA_BUF: BackendCapabilities = BackendCapabilities {
    backend: BackendKind::DmaBuf,
    fence_kinds: &[SyncPrimitiveKind::SyncFd],
    uses_keyed_mutex: false,
    concurrent_read_intra_device: false,
    concurrent_read_cross_device: true,
    use_same_device: false,
    state_kind: BackendStateKind::VkImageLayout,
    supports_multi_planar: true,
};

const OPAQUE_FD: BackendCapabilities = BackendCapabilities {
    backend: BackendKind::OpaqueFd,
    fence_kinds: &[SyncPrimitiveKind::VkSemaphoreOpaqueFd],
    uses_keyed_mutex: false,
    concurrent_read_intra_device: false,
    concurrent_read_cross_device: true,
    use_same_device: false,
    state_kind: BackendStateKind::VkImageLayout,
    supports_multi_planar: false,
};

const SYNC_FD: BackendCapabilities = BackendCapabilities {
    backend: BackendKind::SyncFd,
    fence_kinds: &[SyncPrimitiveKind::SyncFd],
    uses_keyed_mutex: false,
    concurrent_read_intra_device: false,
    concurrent_read_cross_device: true,
    use_same_device: false,
    state_kind: BackendStateKind::VkImageLayout,
    supports_multi_planar: true,
};

const VK_SEMAPHORE_ZIRCON: BackendCapabilities = BackendCapabilities {
    backend: BackendKind::VkSemaphoreZircon,
    fence_kinds: &[SyncPrimitiveKind::VkSemaphoreZirconHandle],
    uses_keyed_mutex: false,
    concurrent_read_intra_device: false,
    concurrent_read_cross_device: true,
    use_same_device: false,
    state_kind: BackendStateKind::VkImageLayout,
    supports_multi_planar: false,
};

const MTL_SHARED_EVENT: BackendCapabilities = BackendCapabilities {
    backend: BackendKind::MtlSharedEvent,
    fence_kinds: &[SyncPrimitiveKind::MtlSharedEvent],
    uses_keyed_mutex: false,
    concurrent_read_intra_device: true,
    concurrent_read_cross_device: true,
    use_same_device: false,
    state_kind: BackendStateKind::None,
    supports_multi_planar: true,
};

const EGL_SYNC: BackendCapabilities = BackendCapabilities {
    backend: BackendKind::EglSync,
    fence_kinds: &[SyncPrimitiveKind::EglSync],
    uses_keyed_mutex: false,
    concurrent_read_intra_device: false,
    concurrent_read_cross_device: false,
    use_same_device: false,
    state_kind: BackendStateKind::None,
    supports_multi_planar: false,
};

impl BackendKind {
    /// Every backend, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::D3D11Texture2D,
        Self::DxgiSharedHandle,
        Self::DmaBuf,
        Self::OpaqueFd,
        Self::SyncFd,
        Self::VkSemaphoreZircon,
        Self::MtlSharedEvent,
        Self::EglSync,
    ];

    /// Look up the capabilities of this backend.
    pub const fn capabilities(self) -> &'static BackendCapabilities {
        match self {
            Self::D3D11Texture2D => &D3D11_TEXTURE_2D,
            Self::DxgiSharedHandle => &DXGI_SHARED_HANDLE,
            Self::DmaBuf => &DMA_BUF,
            Self::OpaqueFd => &OPAQUE_FD,
            Self::SyncFd => &SYNC_FD,
            Self::VkSemaphoreZircon => &VK_SEMAPHORE_ZIRCON,
            Self::MtlSharedEvent => &MTL_SHARED_EVENT,
            Self::EglSync => &EGL_SYNC,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::D3D11Texture2D => "D3D11Texture2D",
            Self::DxgiSharedHandle => "DXGISharedHandle",
            Self::DmaBuf => "DmaBuf",
            Self::OpaqueFd => "OpaqueFD",
            Self::SyncFd => "SyncFD",
            Self::VkSemaphoreZircon => "VkSemaphoreZircon",
            Self::MtlSharedEvent => "MTLSharedEvent",
            Self::EglSync => "EGLSync",
        };
        f.write_str(name)
    }
}
