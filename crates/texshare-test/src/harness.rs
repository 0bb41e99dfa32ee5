//! Per-backend strategy objects for driving the shared memory protocol.
//!
//! Each [`TestBackend`] knows the four backend specific steps of a test: creating
//! devices that can share an allocation, exporting a platform allocation, importing it
//! and producing the begin state the backend expects.

use std::fmt::Write as _;

use ash::vk;
use texshare_core::{TextureFormat, TextureUsage};
use texshare_gpu::{BackendCapabilities, BackendKind, Context, DeviceContext, FenceValue};
use texshare_memory::{
    BackendState, BeginAccessDescriptor, CommandEncoder, EndAccessState, LoadOp,
    PlatformTexture, PlatformTextureDescriptor, Queue, SharedTexture, SharedTextureMemory,
    SharedTextureMemoryDescriptor, StoreOp,
};

use crate::{HarnessConfig, Result};

/// Two devices of one backend in one context.
///
/// When the backend requires importer and exporter to be the same native device,
/// both devices share it.
#[derive(Debug)]
pub struct TestDevices {
    pub context: Context,
    pub first: DeviceContext,
    pub second: DeviceContext,
}

/// Test strategy for one backend.
#[derive(Debug, Clone)]
pub struct TestBackend {
    kind: BackendKind,
    config: HarnessConfig,
}

impl TestBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            config: HarnessConfig::default(),
        }
    }

    /// One strategy per backend.
    pub fn all() -> Vec<Self> {
        BackendKind::ALL.into_iter().map(Self::new).collect()
    }

    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    pub const fn kind(&self) -> BackendKind {
        self.kind
    }

    pub const fn capabilities(&self) -> &'static BackendCapabilities {
        self.kind.capabilities()
    }

    /// Create a context and two devices able to import the same allocation.
    pub fn create_devices(&self) -> Result<TestDevices> {
        let context = Context::builder()
            .label(format!("{} test", self.kind))
            .max_handles(self.config.max_handles)
            .build();
        let first = DeviceContext::builder(self.kind)
            .label(format!("{} first", self.kind))
            .build(&context)?;
        let mut second = DeviceContext::builder(self.kind).label(format!("{} second", self.kind));
        if self.capabilities().use_same_device {
            second = second.native_device(first.native_device());
        }
        let second = second.build(&context)?;
        tracing::debug!(
            "{} test devices {:?} and {:?}",
            self.kind,
            first.id(),
            second.id()
        );
        Ok(TestDevices {
            context,
            first,
            second,
        })
    }

    /// Allocate a platform texture on the native device of `device`.
    pub fn create_platform_texture(&self, device: &DeviceContext) -> Result<PlatformTexture> {
        self.create_platform_texture_with(device, self.config.format, TextureUsage::SHAREABLE)
    }

    pub fn create_platform_texture_with(
        &self,
        device: &DeviceContext,
        format: TextureFormat,
        usage: TextureUsage,
    ) -> Result<PlatformTexture> {
        let mut desc =
            PlatformTextureDescriptor::new(format, self.config.size, device.native_device())
                .with_label(format!("{} {format}", self.kind))
                .with_usage(usage);
        if self.capabilities().uses_keyed_mutex {
            desc = desc.with_keyed_mutex();
        }
        Ok(PlatformTexture::new(desc)?)
    }

    /// Export `platform` and import it into `device`.
    pub fn import(
        &self,
        device: &DeviceContext,
        platform: &PlatformTexture,
    ) -> Result<SharedTextureMemory> {
        let chain = platform.export(device.context(), self.kind)?;
        let desc = SharedTextureMemoryDescriptor::new(chain)
            .with_label(format!("{} on {}", platform.label(), device.label()));
        Ok(SharedTextureMemory::import(device, &desc)?)
    }

    /// Begin state for a fresh access.
    pub fn begin_state(&self) -> BackendState {
        match self.kind {
            BackendKind::DmaBuf
            | BackendKind::OpaqueFd
            | BackendKind::SyncFd
            | BackendKind::VkSemaphoreZircon => BackendState::UNDEFINED_LAYOUT,
            _ => BackendState::None,
        }
    }

    /// Begin state that continues from a previous end.
    pub fn begin_state_after(&self, end: &EndAccessState) -> BackendState {
        match end.backend_state {
            BackendState::VkImageLayout { new_layout, .. } => BackendState::VkImageLayout {
                old_layout: new_layout,
                new_layout,
            },
            _ => self.begin_state(),
        }
    }

    pub fn begin_descriptor(&self, initialized: bool) -> BeginAccessDescriptor {
        BeginAccessDescriptor::new(initialized).with_backend_state(self.begin_state())
    }
}

/// Export `fences` from `from` and import them into `to`.
pub fn share_fences(
    from: &DeviceContext,
    to: &DeviceContext,
    fences: &[FenceValue],
) -> Result<Vec<FenceValue>> {
    fences
        .iter()
        .map(|wait| {
            let payload = from.export_fence(&wait.fence)?;
            let fence = to.import_fence(&payload)?;
            Ok(FenceValue::new(fence, wait.value))
        })
        .collect()
}

/// Clear `texture` to `rgba` with one render pass.
pub fn render_clear(device: &DeviceContext, texture: &SharedTexture, rgba: [f32; 4]) -> Result<u64> {
    let mut encoder = CommandEncoder::new(device);
    encoder.render_pass(texture, LoadOp::Clear(rgba), StoreOp::Store);
    Ok(Queue::new(device).submit(encoder.finish())?.serial)
}

/// Read every plane of `texture` back.
pub fn read_planes(device: &DeviceContext, texture: &SharedTexture) -> Result<Vec<Vec<u8>>> {
    let mut encoder = CommandEncoder::new(device);
    let id = encoder.readback(texture);
    let work = Queue::new(device).submit(encoder.finish())?;
    Ok(work.readback(id).to_vec())
}

/// Layout pair leaving and entering `layout`.
pub const fn layout_state(layout: vk::ImageLayout) -> BackendState {
    BackendState::VkImageLayout {
        old_layout: layout,
        new_layout: layout,
    }
}

/// One line per backend describing its capabilities.
pub fn capability_table() -> String {
    let mut table = String::new();
    for backend in BackendKind::ALL {
        let caps = backend.capabilities();
        let fences = caps
            .fence_kinds
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let _ = writeln!(
            table,
            "{backend}: fences={fences} keyed_mutex={} read_intra={} read_cross={} same_device={} state={:?} multi_planar={}",
            caps.uses_keyed_mutex,
            caps.concurrent_read_intra_device,
            caps.concurrent_read_cross_device,
            caps.use_same_device,
            caps.state_kind,
            caps.supports_multi_planar,
        );
    }
    table
}
