//! Platform allocations.
//!
//! [`PlatformTexture`] stands in for the OS object behind a shared allocation: a
//! D3D texture, a dma-buf, an IOSurface and so on. It owns the texel storage, the
//! optional keyed mutex and the access tracker shared by every import, and is handed
//! to importers through the context handle table.

use std::any::Any;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use texshare_core::{Extent3d, TextureFormat, TextureUsage};
use texshare_gpu::{
    BackendKind, Context, HandleObject, NativeDeviceId, RawHandle, SoftwareKeyedMutex,
};

use crate::access::AccessTracker;
use crate::descriptor::{DmaBufDescriptor, DmaBufPlane, MemoryChain, DRM_FORMAT_MOD_LINEAR};
use crate::error::{MemoryError, Result};

/// Byte pattern fresh platform allocations are filled with, so that reads of
/// uninitialized contents are distinguishable from cleared ones.
pub const UNINITIALIZED_BYTE: u8 = 0xCD;

pub(crate) struct PlatformStorage {
    pub label: String,
    pub format: TextureFormat,
    pub size: Extent3d,
    pub usage: TextureUsage,
    pub native_device: NativeDeviceId,
    pub planes: RwLock<Vec<Vec<u8>>>,
    pub keyed_mutex: Option<Arc<SoftwareKeyedMutex>>,
    pub access: Mutex<AccessTracker>,
}

impl PlatformStorage {
    /// Byte offset of texel `(x, y)` in `plane`.
    pub fn texel_offset(&self, plane: usize, x: u32, y: u32) -> usize {
        let extent = self.format.plane_extent(plane, self.size);
        let bpp = self.format.plane_bytes_per_texel(plane) as usize;
        (y as usize * extent.width as usize + x as usize) * bpp
    }

    /// Total bytes over all planes.
    pub fn byte_size(&self) -> u64 {
        (0..self.format.plane_count())
            .map(|plane| self.format.plane_byte_size(plane, self.size) as u64)
            .sum()
    }
}

/// Description of a platform allocation.
#[derive(Debug, Clone)]
pub struct PlatformTextureDescriptor {
    pub label: String,
    pub format: TextureFormat,
    pub size: Extent3d,
    pub usage: TextureUsage,
    /// Native device that created the allocation.
    pub native_device: NativeDeviceId,
    /// Guard the allocation with a keyed mutex.
    pub keyed_mutex: bool,
}

impl PlatformTextureDescriptor {
    pub fn new(format: TextureFormat, size: Extent3d, native_device: NativeDeviceId) -> Self {
        Self {
            label: "platform texture".to_string(),
            format,
            size,
            usage: TextureUsage::SHAREABLE,
            native_device,
            keyed_mutex: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_usage(mut self, usage: TextureUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_keyed_mutex(mut self) -> Self {
        self.keyed_mutex = true;
        self
    }
}

/// A platform allocation that can be exported to any backend.
#[derive(Clone)]
pub struct PlatformTexture {
    storage: Arc<PlatformStorage>,
}

impl PlatformTexture {
    /// Allocate storage. Contents start out as [`UNINITIALIZED_BYTE`].
    pub fn new(desc: PlatformTextureDescriptor) -> Result<Self> {
        if desc.format == TextureFormat::Undefined {
            return Err(MemoryError::InvalidDescriptor(format!(
                "{} has no format",
                desc.label
            )));
        }
        if desc.size.width == 0 || desc.size.height == 0 || desc.size.depth_or_array_layers != 1 {
            return Err(MemoryError::InvalidDescriptor(format!(
                "{} has invalid 2D size {}",
                desc.label, desc.size
            )));
        }

        let planes = (0..desc.format.plane_count())
            .map(|plane| vec![UNINITIALIZED_BYTE; desc.format.plane_byte_size(plane, desc.size)])
            .collect();

        Ok(Self {
            storage: Arc::new(PlatformStorage {
                label: desc.label,
                format: desc.format,
                size: desc.size,
                usage: desc.usage,
                native_device: desc.native_device,
                planes: RwLock::new(planes),
                keyed_mutex: desc.keyed_mutex.then(|| Arc::new(SoftwareKeyedMutex::new())),
                access: Mutex::new(AccessTracker::new()),
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.storage.label
    }

    pub fn format(&self) -> TextureFormat {
        self.storage.format
    }

    pub fn size(&self) -> Extent3d {
        self.storage.size
    }

    pub fn usage(&self) -> TextureUsage {
        self.storage.usage
    }

    pub fn native_device(&self) -> NativeDeviceId {
        self.storage.native_device
    }

    /// Keyed mutex guarding the allocation, if any.
    pub fn keyed_mutex(&self) -> Option<&Arc<SoftwareKeyedMutex>> {
        self.storage.keyed_mutex.as_ref()
    }

    /// Copy of one plane's bytes.
    pub fn plane_data(&self, plane: usize) -> Option<Vec<u8>> {
        self.storage.planes.read().get(plane).cloned()
    }

    /// Bytes of texel `(x, y)` in the first plane.
    pub fn texel(&self, x: u32, y: u32) -> Option<Vec<u8>> {
        let bpp = self.storage.format.plane_bytes_per_texel(0) as usize;
        let offset = self.storage.texel_offset(0, x, y);
        self.storage
            .planes
            .read()
            .first()
            .and_then(|plane| plane.get(offset..offset + bpp))
            .map(<[u8]>::to_vec)
    }

    /// Number of open access sessions over every import of this allocation.
    pub fn open_sessions(&self) -> usize {
        self.storage.access.lock().open_sessions()
    }

    /// Export the allocation through the handle table as a chain for `backend`.
    pub fn export(&self, context: &Context, backend: BackendKind) -> Result<MemoryChain> {
        let storage = &self.storage;
        let format = storage.format;
        let drm_format = if backend == BackendKind::DmaBuf {
            Some(format.drm_fourcc().ok_or_else(|| {
                MemoryError::InvalidDescriptor(format!("{format} has no DRM fourcc"))
            })?)
        } else {
            None
        };

        let object: Arc<dyn Any + Send + Sync> = Arc::clone(storage) as _;
        let handle = context.register_handle(HandleObject::Memory(object))?;

        let chain = match backend {
            BackendKind::D3D11Texture2D => MemoryChain::D3D11Texture2D { texture: handle },
            BackendKind::DxgiSharedHandle => MemoryChain::DxgiSharedHandle {
                handle,
                use_keyed_mutex: storage.keyed_mutex.is_some(),
            },
            BackendKind::DmaBuf => MemoryChain::DmaBuf(DmaBufDescriptor {
                fd: handle,
                size: storage.size,
                drm_format: drm_format.unwrap_or_default(),
                drm_modifier: DRM_FORMAT_MOD_LINEAR,
                planes: linear_planes(format, storage.size),
            }),
            BackendKind::OpaqueFd => MemoryChain::OpaqueFd {
                fd: handle,
                format,
                size: storage.size,
                allocation_size: storage.byte_size(),
            },
            BackendKind::SyncFd => MemoryChain::AHardwareBuffer { handle },
            BackendKind::VkSemaphoreZircon => MemoryChain::ZirconHandle {
                vmo: handle,
                allocation_size: storage.byte_size(),
            },
            BackendKind::MtlSharedEvent => MemoryChain::IoSurface { surface: handle },
            BackendKind::EglSync => MemoryChain::EglImage { image: handle },
        };

        tracing::debug!("Exported {} as {}", storage.label, chain);
        Ok(chain)
    }

    pub(crate) fn storage(&self) -> &Arc<PlatformStorage> {
        &self.storage
    }
}

impl std::fmt::Debug for PlatformTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformTexture")
            .field("label", &self.storage.label)
            .field("format", &self.storage.format)
            .field("size", &self.storage.size)
            .finish()
    }
}

/// Tightly packed plane layout.
pub fn linear_planes(format: TextureFormat, size: Extent3d) -> Vec<DmaBufPlane> {
    let mut offset = 0;
    (0..format.plane_count())
        .map(|plane| {
            let extent = format.plane_extent(plane, size);
            let layout = DmaBufPlane {
                offset,
                stride: extent.width * format.plane_bytes_per_texel(plane),
            };
            offset += format.plane_byte_size(plane, size) as u64;
            layout
        })
        .collect()
}

/// Resolve a handle to platform storage.
pub(crate) fn resolve(context: &Context, handle: RawHandle) -> Option<Arc<PlatformStorage>> {
    match context.resolve_handle(handle)? {
        HandleObject::Memory(object) => object.downcast::<PlatformStorage>().ok(),
        HandleObject::Fence(_) => None,
    }
}
