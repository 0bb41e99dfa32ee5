//! Textures created from shared memory and their access sessions.

use std::fmt;
use std::sync::Arc;

use texshare_core::{Extent3d, TextureFormat, TextureUsage};
use texshare_gpu::{keyed_mutex, GpuError};

use crate::access::{AccessMode, BeginRequest, Session, TextureKey, TextureSlot};
use crate::backend_state::AcceptedState;
use crate::descriptor::{BeginAccessDescriptor, EndAccessState, TextureDescriptor};
use crate::error::AccessError;
use crate::memory::SharedTextureMemory;
use crate::platform::PlatformStorage;

/// A device-local texture bound to a shared allocation.
///
/// Dropping a texture in the middle of an access session closes the session
/// without producing fences.
pub struct SharedTexture {
    memory: SharedTextureMemory,
    storage: Arc<PlatformStorage>,
    key: TextureKey,
    label: String,
    desc: TextureDescriptor,
}

impl SharedTexture {
    pub(crate) fn new(
        memory: SharedTextureMemory,
        storage: Arc<PlatformStorage>,
        key: TextureKey,
        label: String,
        desc: TextureDescriptor,
    ) -> Self {
        Self {
            memory,
            storage,
            key,
            label,
            desc,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format(&self) -> TextureFormat {
        self.desc.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.desc.usage
    }

    pub fn size(&self) -> Extent3d {
        self.desc.size
    }

    /// Memory this texture was created from.
    pub fn memory(&self) -> &SharedTextureMemory {
        &self.memory
    }

    /// Mode of the open session, if any.
    pub fn access_mode(&self) -> Option<AccessMode> {
        self.with_slot(|slot| slot.session.as_ref().map(|session| session.mode))
            .flatten()
    }

    pub fn is_accessing(&self) -> bool {
        self.access_mode().is_some()
    }

    /// Begin an access session.
    ///
    /// Fails without side effects if the request conflicts with an open session,
    /// the backend state or fences do not fit the backend, or the device is lost.
    /// On keyed mutex backends this blocks until the mutex is available.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_access(&mut self, desc: &BeginAccessDescriptor) -> Result<(), AccessError> {
        let device = self.memory.device();
        if device.is_lost() {
            tracing::warn!("Cannot begin access on {}: device is lost", self.label);
            return Err(AccessError::DeviceLost(device.label().to_string()));
        }
        let caps = device.capabilities();

        let mut tracker = self.storage.access.lock();
        let mode = tracker
            .check_begin(
                self.key,
                BeginRequest {
                    memory: self.memory.label(),
                    concurrent_read: desc.concurrent_read,
                    initialized: desc.initialized,
                    caps,
                },
            )
            .inspect_err(|e| tracing::warn!("Rejected begin access: {}", e))?;
        let state = AcceptedState::validate(caps, desc.backend_state)?;

        for (i, wait) in desc.fences.iter().enumerate() {
            let kind = wait.fence.kind();
            if !caps.supports_fence(kind) || kind != device.fence_kind() {
                return Err(AccessError::UnsupportedFence {
                    kind,
                    backend: caps.backend,
                });
            }
            if wait.fence.device() != device.id() {
                return Err(AccessError::ForeignFence {
                    fence: wait.fence.id(),
                    device: device.id(),
                });
            }
            if !kind.is_timeline() && wait.fence.is_consumed() {
                return Err(GpuError::InvalidHandle(format!(
                    "{kind} fence {:?} was already consumed by a wait",
                    wait.fence.id()
                ))
                .into());
            }
            let repeated = desc.fences[..i]
                .iter()
                .any(|earlier| earlier.fence.id() == wait.fence.id());
            if !kind.is_timeline() && repeated {
                return Err(GpuError::InvalidHandle(format!(
                    "{kind} fence {:?} is waited on more than once",
                    wait.fence.id()
                ))
                .into());
            }
        }

        // The tracker lock stays held across the acquire: other begins, ends and
        // state queries on this allocation wait until the keyed mutex is ours.
        let guard_mutex = self.memory.keyed_mutex();
        if let Some(mutex) = guard_mutex {
            keyed_mutex::acquire(device, mutex.as_ref())?;
        }

        let adapter = device.adapter();
        for wait in &desc.fences {
            if let Err(e) = adapter.wait_then_consume(device, &wait.fence, wait.value) {
                if let Some(mutex) = guard_mutex {
                    keyed_mutex::release(mutex.as_ref());
                }
                return Err(e.into());
            }
        }

        tracker.open(
            self.key,
            Session {
                mode,
                initialized_on_entry: desc.initialized,
                used_serial: None,
                wrote: false,
                waited: desc.fences.clone(),
                layout: state.initial_layout(),
                state,
                holds_keyed_mutex: guard_mutex.is_some(),
            },
        );
        Ok(())
    }

    /// End the open access session.
    ///
    /// Succeeds even if the device was lost or destroyed since begin; fences then
    /// cover the work submitted before that happened.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_access(&mut self) -> Result<EndAccessState, AccessError> {
        let device = self.memory.device();
        let mut tracker = self.storage.access.lock();
        tracker
            .check_end(self.key)
            .inspect_err(|e| tracing::warn!("Rejected end access: {}", e))?;

        let (used, read_fences, state, layout, initialized) = match tracker.slot(self.key) {
            Some(TextureSlot {
                session: Some(session),
                initialized,
                ..
            }) => (
                session.used_serial.is_some(),
                session.read_fences().map(<[_]>::to_vec),
                session.state,
                session.layout,
                *initialized,
            ),
            _ => {
                return Err(AccessError::NotAccessed {
                    texture: self.label.clone(),
                })
            }
        };

        // Sessions that only read return the fences they waited on.
        let fences = match read_fences {
            _ if !used || !state.requires_end_fence() => Vec::new(),
            Some(waited) => waited,
            None => vec![device.adapter().signal_after_work(device)?],
        };

        if let Some(session) = tracker.close(self.key) {
            if session.holds_keyed_mutex {
                if let Some(mutex) = self.memory.keyed_mutex() {
                    keyed_mutex::release(mutex.as_ref());
                }
            }
        }

        Ok(EndAccessState {
            fences,
            initialized,
            backend_state: state.end_state(layout),
        })
    }

    /// Destroy the texture, force-closing any open session.
    pub fn destroy(self) {
        drop(self);
    }

    pub(crate) fn storage(&self) -> &Arc<PlatformStorage> {
        &self.storage
    }

    pub(crate) fn with_slot<R>(&self, f: impl FnOnce(&mut TextureSlot) -> R) -> Option<R> {
        self.storage.access.lock().slot_mut(self.key).map(f)
    }
}

impl Drop for SharedTexture {
    fn drop(&mut self) {
        let session = self.storage.access.lock().unregister(self.key);
        if let Some(session) = session {
            tracing::warn!(
                "{} destroyed during {:?} access, closing without fences",
                self.label,
                session.mode
            );
            if session.holds_keyed_mutex {
                if let Some(mutex) = self.memory.keyed_mutex() {
                    keyed_mutex::release(mutex.as_ref());
                }
            }
        }
    }
}

impl fmt::Debug for SharedTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTexture")
            .field("label", &self.label)
            .field("format", &self.desc.format)
            .field("usage", &self.desc.usage)
            .finish()
    }
}
