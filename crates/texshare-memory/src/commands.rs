//! Opaque work submission on shared textures.
//!
//! Commands only exist to give access sessions something to order: the queue checks
//! that every texture it touches is inside an open session on the submitting device,
//! runs the work on the device, and records that the session used the texture.
//! Reading an uninitialized texture clears it to zero first.

use ash::vk;
use texshare_core::TextureUsage;
use texshare_gpu::{DeviceContext, DeviceId};

use crate::access::{AccessMode, Session};
use crate::error::{MemoryError, Result};
use crate::platform::PlatformStorage;
use crate::texture::SharedTexture;

/// How a render pass treats existing contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Load,
    Clear([f32; 4]),
}

/// Whether a render pass keeps what it rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    /// Leaves the contents undefined.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadbackId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleId(usize);

#[derive(Debug)]
enum Command<'a> {
    RenderPass {
        target: &'a SharedTexture,
        load: LoadOp,
        store: StoreOp,
    },
    Copy {
        source: &'a SharedTexture,
        destination: &'a SharedTexture,
    },
    StorageWrite {
        target: &'a SharedTexture,
        value: [f32; 4],
    },
    Sample {
        source: &'a SharedTexture,
        x: u32,
        y: u32,
    },
    Readback {
        source: &'a SharedTexture,
    },
}

/// Records commands for one device.
#[derive(Debug)]
pub struct CommandEncoder<'a> {
    device: DeviceId,
    commands: Vec<Command<'a>>,
    readbacks: usize,
    samples: usize,
}

impl<'a> CommandEncoder<'a> {
    pub fn new(device: &DeviceContext) -> Self {
        Self {
            device: device.id(),
            commands: Vec::new(),
            readbacks: 0,
            samples: 0,
        }
    }

    /// Render to `target`. Full-screen passes are the only kind there is.
    pub fn render_pass(&mut self, target: &'a SharedTexture, load: LoadOp, store: StoreOp) {
        self.commands.push(Command::RenderPass {
            target,
            load,
            store,
        });
    }

    /// Copy every plane of `source` into `destination`.
    pub fn copy_texture_to_texture(
        &mut self,
        source: &'a SharedTexture,
        destination: &'a SharedTexture,
    ) {
        self.commands.push(Command::Copy {
            source,
            destination,
        });
    }

    /// Write `value` to every texel from a compute shader.
    pub fn storage_write(&mut self, target: &'a SharedTexture, value: [f32; 4]) {
        self.commands.push(Command::StorageWrite { target, value });
    }

    /// Sample one texel as normalized RGBA.
    pub fn sample(&mut self, source: &'a SharedTexture, x: u32, y: u32) -> SampleId {
        self.commands.push(Command::Sample { source, x, y });
        self.samples += 1;
        SampleId(self.samples - 1)
    }

    /// Copy the texture contents back to the CPU.
    pub fn readback(&mut self, source: &'a SharedTexture) -> ReadbackId {
        self.commands.push(Command::Readback { source });
        self.readbacks += 1;
        ReadbackId(self.readbacks - 1)
    }

    pub fn finish(self) -> CommandBuffer<'a> {
        CommandBuffer {
            device: self.device,
            commands: self.commands,
        }
    }
}

/// Finished commands, ready to submit.
#[derive(Debug)]
pub struct CommandBuffer<'a> {
    device: DeviceId,
    commands: Vec<Command<'a>>,
}

/// Results of a submission.
#[derive(Debug, Clone, Default)]
pub struct SubmittedWork {
    pub serial: u64,
    readbacks: Vec<Vec<Vec<u8>>>,
    samples: Vec<Option<[f32; 4]>>,
}

impl SubmittedWork {
    /// Plane contents captured by a readback.
    pub fn readback(&self, id: ReadbackId) -> &[Vec<u8>] {
        self.readbacks.get(id.0).map_or(&[], Vec::as_slice)
    }

    /// Sampled value, `None` for multi-planar formats or out of bounds texels.
    pub fn sample(&self, id: SampleId) -> Option<[f32; 4]> {
        self.samples.get(id.0).copied().flatten()
    }
}

/// Submission queue of a device.
#[derive(Debug, Clone)]
pub struct Queue {
    device: DeviceContext,
}

impl Queue {
    pub fn new(device: &DeviceContext) -> Self {
        Self {
            device: device.clone(),
        }
    }

    /// Validate and run `buffer`.
    ///
    /// Fence waits enqueued by begin access are satisfied before any command runs.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, buffer: CommandBuffer<'_>) -> Result<SubmittedWork> {
        let device = self.device.id();
        if buffer.device != device {
            return Err(MemoryError::Gpu(texshare_gpu::GpuError::Other(format!(
                "command buffer recorded for device {} submitted to {}",
                buffer.device, device
            ))));
        }
        for command in &buffer.commands {
            self.validate(command)?;
        }

        let mut work = SubmittedWork::default();
        let serial = self.device.submit(|serial| {
            for command in &buffer.commands {
                execute(command, serial, &mut work);
            }
        })?;
        work.serial = serial;
        Ok(work)
    }

    fn validate(&self, command: &Command<'_>) -> Result<()> {
        match *command {
            Command::RenderPass { target, .. } => {
                self.check(target, TextureUsage::RENDER_ATTACHMENT, true)?;
                let format = target.format();
                if !format.is_renderable() || format.is_multi_planar() {
                    return Err(MemoryError::UnrenderableFormat {
                        texture: target.label().to_string(),
                        format,
                    });
                }
                Ok(())
            }
            Command::Copy {
                source,
                destination,
            } => {
                self.check(source, TextureUsage::COPY_SRC, false)?;
                self.check(destination, TextureUsage::COPY_DST, true)?;
                let mismatch = |reason: &str| MemoryError::CopyMismatch {
                    source_texture: source.label().to_string(),
                    destination: destination.label().to_string(),
                    reason: reason.to_string(),
                };
                if std::ptr::eq(source, destination) {
                    return Err(mismatch("source and destination are the same texture"));
                }
                if source.format() != destination.format()
                    && !source.format().is_view_compatible(destination.format())
                {
                    return Err(mismatch("formats differ"));
                }
                if source.size() != destination.size() {
                    return Err(mismatch("sizes differ"));
                }
                Ok(())
            }
            Command::StorageWrite { target, .. } => {
                self.check(target, TextureUsage::STORAGE_BINDING, true)
            }
            Command::Sample { source, .. } => {
                self.check(source, TextureUsage::TEXTURE_BINDING, false)
            }
            Command::Readback { source } => self.check(source, TextureUsage::COPY_SRC, false),
        }
    }

    fn check(&self, texture: &SharedTexture, usage: TextureUsage, write: bool) -> Result<()> {
        let texture_device = texture.memory().device().id();
        if texture_device != self.device.id() {
            return Err(MemoryError::WrongDevice {
                texture: texture.label().to_string(),
                texture_device,
                queue_device: self.device.id(),
            });
        }
        if !texture.usage().contains(usage) {
            return Err(MemoryError::MissingUsage {
                texture: texture.label().to_string(),
                usage,
            });
        }
        match texture.access_mode() {
            None => Err(MemoryError::NotAccessed(texture.label().to_string())),
            Some(mode) if write && mode != AccessMode::ExclusiveWrite => {
                Err(MemoryError::ReadOnlyAccess(texture.label().to_string()))
            }
            Some(_) => Ok(()),
        }
    }
}

fn execute(command: &Command<'_>, serial: u64, work: &mut SubmittedWork) {
    match *command {
        Command::RenderPass {
            target,
            load,
            store,
        } => {
            match load {
                LoadOp::Load => lazy_clear(target),
                LoadOp::Clear(value) => fill(target, value),
            }
            record(
                target,
                serial,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                true,
                |initialized| *initialized = store == StoreOp::Store,
            );
        }
        Command::Copy {
            source,
            destination,
        } => {
            lazy_clear(source);
            let planes = source.storage().planes.read().clone();
            *destination.storage().planes.write() = planes;
            record(source, serial, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, false, |_| {});
            record(
                destination,
                serial,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                true,
                |initialized| *initialized = true,
            );
        }
        Command::StorageWrite { target, value } => {
            fill(target, value);
            record(target, serial, vk::ImageLayout::GENERAL, true, |initialized| {
                *initialized = true;
            });
        }
        Command::Sample { source, x, y } => {
            lazy_clear(source);
            let value = texel(source.storage(), x, y)
                .and_then(|bytes| source.format().decode_rgba(&bytes));
            work.samples.push(value);
            record(source, serial, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, false, |_| {});
        }
        Command::Readback { source } => {
            lazy_clear(source);
            work.readbacks.push(source.storage().planes.read().clone());
            record(source, serial, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, false, |_| {});
        }
    }
}

/// Note that the session used (and possibly wrote) the texture and update its layout
/// and initialized flag.
fn record(
    texture: &SharedTexture,
    serial: u64,
    layout: vk::ImageLayout,
    writes: bool,
    update_initialized: impl FnOnce(&mut bool),
) {
    texture.with_slot(|slot| {
        update_initialized(&mut slot.initialized);
        if let Some(Session {
            used_serial,
            wrote,
            layout: current,
            ..
        }) = slot.session.as_mut()
        {
            *used_serial = Some(serial);
            *wrote |= writes;
            *current = layout;
        }
    });
}

/// Zero the texture if its contents are undefined.
fn lazy_clear(texture: &SharedTexture) {
    let cleared = texture.with_slot(|slot| {
        if slot.initialized {
            return false;
        }
        for plane in texture.storage().planes.write().iter_mut() {
            plane.fill(0);
        }
        slot.initialized = true;
        if let Some(session) = slot.session.as_mut() {
            session.wrote = true;
        }
        true
    });
    if cleared == Some(true) {
        tracing::debug!("Lazily cleared {}", texture.label());
    }
}

fn fill(texture: &SharedTexture, value: [f32; 4]) {
    let Some(bytes) = texture.format().encode_rgba(value) else {
        return;
    };
    if let Some(plane) = texture.storage().planes.write().first_mut() {
        for chunk in plane.chunks_exact_mut(bytes.len()) {
            chunk.copy_from_slice(&bytes);
        }
    }
}

fn texel(storage: &PlatformStorage, x: u32, y: u32) -> Option<Vec<u8>> {
    if x >= storage.size.width || y >= storage.size.height {
        return None;
    }
    let bpp = storage.format.plane_bytes_per_texel(0) as usize;
    let offset = storage.texel_offset(0, x, y);
    storage
        .planes
        .read()
        .first()
        .and_then(|plane| plane.get(offset..offset + bpp))
        .map(<[u8]>::to_vec)
}
