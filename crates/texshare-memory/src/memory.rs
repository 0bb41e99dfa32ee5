//! Shared texture memory objects.

use std::fmt;
use std::sync::Arc;

use texshare_core::{TextureDimension, TextureFormat, TextureUsage};
use texshare_gpu::{DeviceContext, GpuError, SoftwareKeyedMutex};

use crate::access::{AccessState, TextureSlot};
use crate::descriptor::{
    DmaBufDescriptor, MemoryChain, SharedTextureMemoryDescriptor, SharedTextureMemoryProperties,
    TextureDescriptor, DRM_FORMAT_MOD_LINEAR,
};
use crate::error::{MemoryError, Result};
use crate::platform::{self, linear_planes, PlatformStorage};
use crate::texture::SharedTexture;

pub(crate) struct Imported {
    pub storage: Arc<PlatformStorage>,
    pub properties: SharedTextureMemoryProperties,
    /// Keyed mutex acquired on begin access and released on end access.
    pub keyed_mutex: Option<Arc<SoftwareKeyedMutex>>,
}

struct MemoryInner {
    label: String,
    device: DeviceContext,
    /// `None` for error objects.
    imported: Option<Imported>,
}

/// One allocation imported into one device.
///
/// Cloning is cheap and yields another reference to the same import. The
/// allocation stays alive while any clone or any texture created from it exists.
#[derive(Clone)]
pub struct SharedTextureMemory {
    inner: Arc<MemoryInner>,
}

impl SharedTextureMemory {
    /// Import an allocation into `device`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn import(device: &DeviceContext, desc: &SharedTextureMemoryDescriptor) -> Result<Self> {
        if device.is_lost() {
            return Err(GpuError::DeviceLost(device.label().to_string()).into());
        }
        let chain = desc.chain.as_ref().ok_or_else(|| {
            MemoryError::InvalidDescriptor("descriptor has no memory chain".to_string())
        })?;

        let backend = device.backend();
        if chain.backend() != backend {
            return Err(MemoryError::InvalidDescriptor(format!(
                "{chain} cannot be imported by a {backend} device"
            )));
        }

        let storage = platform::resolve(device.context(), chain.handle()).ok_or_else(|| {
            MemoryError::InvalidDescriptor(format!(
                "{} does not refer to a platform allocation",
                chain.handle()
            ))
        })?;
        validate_chain(device, chain, &storage)?;

        let format = storage.format;
        let properties = SharedTextureMemoryProperties {
            format,
            size: storage.size,
            usage: (storage.usage & format.supported_usage())
                .difference(TextureUsage::TRANSIENT_ATTACHMENT),
        };
        let keyed_mutex = match chain {
            MemoryChain::DxgiSharedHandle {
                use_keyed_mutex: true,
                ..
            } => storage.keyed_mutex.clone(),
            _ => None,
        };
        let label = desc
            .label
            .clone()
            .unwrap_or_else(|| format!("{} on {}", storage.label, device.label()));

        tracing::info!(
            "Imported {} ({} {}) into {}",
            label,
            format,
            storage.size,
            device.label()
        );
        Ok(Self {
            inner: Arc::new(MemoryInner {
                label,
                device: device.clone(),
                imported: Some(Imported {
                    storage,
                    properties,
                    keyed_mutex,
                }),
            }),
        })
    }

    /// Import an allocation, returning an error object instead of failing.
    ///
    /// Error objects report zeroed properties and refuse texture creation.
    pub fn import_or_error(device: &DeviceContext, desc: &SharedTextureMemoryDescriptor) -> Self {
        Self::import(device, desc).unwrap_or_else(|e| {
            tracing::warn!("Shared texture memory import failed: {}", e);
            Self {
                inner: Arc::new(MemoryInner {
                    label: desc
                        .label
                        .clone()
                        .unwrap_or_else(|| "error shared texture memory".to_string()),
                    device: device.clone(),
                    imported: None,
                }),
            }
        })
    }

    /// Whether this is an error object.
    pub fn is_error(&self) -> bool {
        self.inner.imported.is_none()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Device the allocation was imported into.
    pub fn device(&self) -> &DeviceContext {
        &self.inner.device
    }

    /// Format, size and usage. Zeroed for error objects.
    pub fn properties(&self) -> SharedTextureMemoryProperties {
        self.inner
            .imported
            .as_ref()
            .map(|imported| imported.properties)
            .unwrap_or_default()
    }

    /// Texture descriptor matching the memory properties.
    pub fn default_texture_descriptor(&self) -> TextureDescriptor {
        TextureDescriptor::from_properties(self.properties())
    }

    /// Whether the importing device was lost or destroyed.
    pub fn is_device_lost(&self) -> bool {
        self.inner.device.is_lost()
    }

    /// Access state of the underlying allocation. Error objects are always idle.
    pub fn access_state(&self) -> AccessState {
        self.inner
            .imported
            .as_ref()
            .map_or(AccessState::Idle, |imported| imported.storage.access.lock().state())
    }

    /// Create a texture over the allocation. `None` uses
    /// [`Self::default_texture_descriptor`].
    pub fn create_texture(&self, desc: Option<&TextureDescriptor>) -> Result<SharedTexture> {
        let Some(imported) = self.inner.imported.as_ref() else {
            return Err(MemoryError::ErrorObject(self.inner.label.clone()));
        };
        let properties = imported.properties;
        let desc = desc
            .cloned()
            .unwrap_or_else(|| TextureDescriptor::from_properties(properties));

        if desc.format != properties.format && !properties.format.is_view_compatible(desc.format)
        {
            return Err(MemoryError::FormatMismatch {
                requested: desc.format,
                memory: properties.format,
            });
        }
        if !properties.usage.contains(desc.usage) {
            return Err(MemoryError::UsageNotAllowed {
                requested: desc.usage,
                memory: properties.usage,
            });
        }
        if desc.dimension != TextureDimension::D2 {
            return Err(MemoryError::DimensionNotSupported(desc.dimension));
        }
        if desc.mip_level_count != 1 || desc.sample_count != 1 {
            return Err(MemoryError::MipOrSampleNotSupported {
                mip_level_count: desc.mip_level_count,
                sample_count: desc.sample_count,
            });
        }
        if desc.size != properties.size {
            return Err(MemoryError::SizeMismatch {
                requested: desc.size,
                memory: properties.size,
            });
        }

        let label = desc
            .label
            .clone()
            .unwrap_or_else(|| format!("texture of {}", self.inner.label));
        let key = imported.storage.access.lock().register(TextureSlot::new(
            label.clone(),
            self.inner.device.id(),
            desc.usage.is_write_capable(),
        ));
        tracing::debug!("Created {} with usage {:?}", label, desc.usage);

        Ok(SharedTexture::new(
            self.clone(),
            Arc::clone(&imported.storage),
            key,
            label,
            desc,
        ))
    }

    pub(crate) fn keyed_mutex(&self) -> Option<&Arc<SoftwareKeyedMutex>> {
        self.inner
            .imported
            .as_ref()
            .and_then(|imported| imported.keyed_mutex.as_ref())
    }
}

impl fmt::Debug for SharedTextureMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTextureMemory")
            .field("label", &self.inner.label)
            .field("device", &self.inner.device.id())
            .field("properties", &self.properties())
            .finish()
    }
}

fn validate_chain(
    device: &DeviceContext,
    chain: &MemoryChain,
    storage: &PlatformStorage,
) -> Result<()> {
    let caps = device.capabilities();
    let invalid = |message: String| Err(MemoryError::InvalidDescriptor(message));

    if caps.use_same_device && storage.native_device != device.native_device() {
        return invalid(format!(
            "{} was created on another native device than {}",
            storage.label,
            device.label()
        ));
    }
    if storage.format.is_multi_planar() && !caps.supports_multi_planar {
        return invalid(format!(
            "{} cannot import multi-planar format {}",
            caps.backend, storage.format
        ));
    }

    match chain {
        MemoryChain::DxgiSharedHandle {
            use_keyed_mutex: true,
            ..
        } if storage.keyed_mutex.is_none() => {
            invalid(format!("{} has no keyed mutex", storage.label))
        }
        MemoryChain::DmaBuf(desc) => validate_dma_buf(desc, storage),
        MemoryChain::OpaqueFd {
            format,
            size,
            allocation_size,
            ..
        } => {
            if *format != storage.format || *size != storage.size {
                return invalid(format!(
                    "opaque fd describes {format} {size}, allocation is {} {}",
                    storage.format, storage.size
                ));
            }
            check_allocation_size(*allocation_size, storage)
        }
        MemoryChain::ZirconHandle {
            allocation_size, ..
        } => check_allocation_size(*allocation_size, storage),
        _ => Ok(()),
    }
}

fn check_allocation_size(allocation_size: u64, storage: &PlatformStorage) -> Result<()> {
    let required = storage.byte_size();
    if allocation_size < required {
        return Err(MemoryError::InvalidDescriptor(format!(
            "allocation size {allocation_size} is smaller than the {required} bytes {} needs",
            storage.label
        )));
    }
    Ok(())
}

fn validate_dma_buf(desc: &DmaBufDescriptor, storage: &PlatformStorage) -> Result<()> {
    let format = TextureFormat::from_drm_fourcc(desc.drm_format)
        .map_err(|e| MemoryError::InvalidDescriptor(e.to_string()))?;
    if format != storage.format {
        return Err(MemoryError::InvalidDescriptor(format!(
            "dma-buf format {format} does not match allocation format {}",
            storage.format
        )));
    }
    if desc.size != storage.size {
        return Err(MemoryError::InvalidDescriptor(format!(
            "dma-buf size {} does not match allocation size {}",
            desc.size, storage.size
        )));
    }
    if desc.drm_modifier != DRM_FORMAT_MOD_LINEAR {
        return Err(MemoryError::InvalidDescriptor(format!(
            "unsupported DRM modifier {:#x}",
            desc.drm_modifier
        )));
    }
    if desc.planes.len() != format.plane_count() {
        return Err(MemoryError::InvalidDescriptor(format!(
            "{format} has {} planes, descriptor lists {}",
            format.plane_count(),
            desc.planes.len()
        )));
    }
    if desc.planes != linear_planes(format, storage.size) {
        return Err(MemoryError::InvalidDescriptor(
            "dma-buf plane layout does not match the allocation".to_string(),
        ));
    }
    Ok(())
}

