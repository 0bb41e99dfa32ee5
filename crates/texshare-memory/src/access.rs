//! Per-allocation access state machine.
//!
//! Every import of one allocation shares a single [`AccessTracker`]. The tracker owns
//! an arena of texture slots; textures hold a [`TextureKey`] into it, so a texture
//! that disappears mid-session can always be force-closed without leaving a dangling
//! reader or writer behind.
//!
//! The tracker is pure bookkeeping. Callers hold the allocation lock around a
//! `check_*` call and the matching `open`/`close`, and perform fence and keyed mutex
//! work in between, so a rejected call never has side effects.

use ash::vk;
use slab::Slab;
use texshare_gpu::{BackendCapabilities, DeviceId, FenceValue};

use crate::backend_state::AcceptedState;
use crate::error::{AccessError, ReadScope};

/// Mode of an open access session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ExclusiveWrite,
    ExclusiveRead,
    ConcurrentRead,
}

impl AccessMode {
    /// Mode implied by a begin request.
    ///
    /// Textures that can be written always take exclusive write access; read-only
    /// textures read exclusively unless concurrent reading was requested.
    pub const fn for_request(concurrent_read: bool, write_capable: bool) -> Self {
        if concurrent_read {
            Self::ConcurrentRead
        } else if write_capable {
            Self::ExclusiveWrite
        } else {
            Self::ExclusiveRead
        }
    }

    pub const fn is_exclusive(self) -> bool {
        !matches!(self, Self::ConcurrentRead)
    }
}

/// Access state of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessState {
    #[default]
    Idle,
    HeldExclusiveWrite,
    HeldExclusiveRead,
    HeldConcurrentRead(usize),
}

/// Key of a texture slot in the allocation arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureKey(usize);

/// One open access session.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub mode: AccessMode,
    pub initialized_on_entry: bool,
    /// Serial of the last submission that used the texture during this session.
    pub used_serial: Option<u64>,
    /// Whether work in this session wrote the texture, lazy clears included.
    pub wrote: bool,
    /// Fences waited on at begin.
    pub waited: Vec<FenceValue>,
    pub layout: vk::ImageLayout,
    pub state: AcceptedState,
    pub holds_keyed_mutex: bool,
}

impl Session {
    /// Fences a session that only read can hand back instead of signaling anew.
    pub fn read_fences(&self) -> Option<&[FenceValue]> {
        (self.mode != AccessMode::ExclusiveWrite && !self.wrote && !self.waited.is_empty())
            .then_some(self.waited.as_slice())
    }
}

/// Bookkeeping for one texture.
#[derive(Debug)]
pub(crate) struct TextureSlot {
    pub label: String,
    pub device: DeviceId,
    pub write_capable: bool,
    /// Whether the texture contents are defined.
    pub initialized: bool,
    pub session: Option<Session>,
}

impl TextureSlot {
    pub fn new(label: impl Into<String>, device: DeviceId, write_capable: bool) -> Self {
        Self {
            label: label.into(),
            device,
            write_capable,
            initialized: false,
            session: None,
        }
    }
}

/// A begin request, as seen by the tracker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BeginRequest<'a> {
    pub memory: &'a str,
    pub concurrent_read: bool,
    pub initialized: bool,
    pub caps: &'a BackendCapabilities,
}

#[derive(Debug, Default)]
pub(crate) struct AccessTracker {
    state: AccessState,
    slots: Slab<TextureSlot>,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn state(&self) -> AccessState {
        self.state
    }

    pub fn register(&mut self, slot: TextureSlot) -> TextureKey {
        TextureKey(self.slots.insert(slot))
    }

    /// Remove a texture, force-closing its session. The closed session is returned
    /// so the caller can release what it holds; no fences are produced for it.
    pub fn unregister(&mut self, key: TextureKey) -> Option<Session> {
        let session = self.close(key);
        self.slots.try_remove(key.0);
        session
    }

    pub fn slot(&self, key: TextureKey) -> Option<&TextureSlot> {
        self.slots.get(key.0)
    }

    pub fn slot_mut(&mut self, key: TextureKey) -> Option<&mut TextureSlot> {
        self.slots.get_mut(key.0)
    }

    /// Number of open sessions.
    pub fn open_sessions(&self) -> usize {
        self.slots.iter().filter(|(_, slot)| slot.session.is_some()).count()
    }

    /// Check whether `key` may begin access and return the mode it would get.
    pub fn check_begin(
        &self,
        key: TextureKey,
        request: BeginRequest<'_>,
    ) -> Result<AccessMode, AccessError> {
        let slot = self.slots.get(key.0).ok_or_else(|| AccessError::NotAccessed {
            texture: format!("texture slot {}", key.0),
        })?;

        if slot.session.is_some() {
            return Err(AccessError::AlreadyAccessing {
                texture: slot.label.clone(),
                memory: request.memory.to_string(),
            });
        }
        if request.concurrent_read && slot.write_capable {
            return Err(AccessError::ConcurrentReadWrite {
                texture: slot.label.clone(),
            });
        }
        if request.concurrent_read && !request.initialized {
            return Err(AccessError::ConcurrentReadUninitialized {
                texture: slot.label.clone(),
            });
        }

        let mode = AccessMode::for_request(request.concurrent_read, slot.write_capable);
        let memory = || request.memory.to_string();
        match self.state {
            AccessState::Idle => {
                if mode == AccessMode::ConcurrentRead && !request.caps.supports_concurrent_read() {
                    return Err(AccessError::ConcurrentReadUnsupported {
                        backend: request.caps.backend,
                        scope: ReadScope::IntraDevice,
                    });
                }
            }
            AccessState::HeldExclusiveWrite => {
                return Err(AccessError::HeldForWriting { memory: memory() })
            }
            AccessState::HeldExclusiveRead => {
                return Err(AccessError::HeldForExclusiveReading { memory: memory() })
            }
            AccessState::HeldConcurrentRead(_) => {
                if mode != AccessMode::ConcurrentRead {
                    return Err(AccessError::HeldForReading { memory: memory() });
                }
                self.check_concurrent_scope(slot.device, request.caps)?;
            }
        }
        Ok(mode)
    }

    fn check_concurrent_scope(
        &self,
        device: DeviceId,
        caps: &BackendCapabilities,
    ) -> Result<(), AccessError> {
        for (_, reader) in self.slots.iter().filter(|(_, s)| s.session.is_some()) {
            let (supported, scope) = if reader.device == device {
                (caps.concurrent_read_intra_device, ReadScope::IntraDevice)
            } else {
                (caps.concurrent_read_cross_device, ReadScope::CrossDevice)
            };
            if !supported {
                return Err(AccessError::ConcurrentReadUnsupported {
                    backend: caps.backend,
                    scope,
                });
            }
        }
        Ok(())
    }

    /// Open a session previously accepted by [`Self::check_begin`].
    pub fn open(&mut self, key: TextureKey, session: Session) {
        let mode = session.mode;
        let Some(slot) = self.slots.get_mut(key.0) else {
            return;
        };
        slot.initialized = session.initialized_on_entry;
        slot.session = Some(session);
        self.state = match (self.state, mode) {
            (AccessState::HeldConcurrentRead(n), AccessMode::ConcurrentRead) => {
                AccessState::HeldConcurrentRead(n + 1)
            }
            (_, AccessMode::ConcurrentRead) => AccessState::HeldConcurrentRead(1),
            (_, AccessMode::ExclusiveWrite) => AccessState::HeldExclusiveWrite,
            (_, AccessMode::ExclusiveRead) => AccessState::HeldExclusiveRead,
        };
        tracing::debug!("{} began {:?} access, now {:?}", slot.label, mode, self.state);
    }

    /// Check whether `key` may end access.
    pub fn check_end(&self, key: TextureKey) -> Result<(), AccessError> {
        match self.slots.get(key.0) {
            Some(slot) if slot.session.is_some() => Ok(()),
            Some(slot) => Err(AccessError::NotAccessed {
                texture: slot.label.clone(),
            }),
            None => Err(AccessError::NotAccessed {
                texture: format!("texture slot {}", key.0),
            }),
        }
    }

    /// Close the session of `key`, if any.
    pub fn close(&mut self, key: TextureKey) -> Option<Session> {
        let slot = self.slots.get_mut(key.0)?;
        let session = slot.session.take()?;
        self.state = match self.state {
            AccessState::HeldConcurrentRead(n) if n > 1 => AccessState::HeldConcurrentRead(n - 1),
            _ => AccessState::Idle,
        };
        tracing::debug!(
            "{} ended {:?} access, now {:?}",
            slot.label,
            session.mode,
            self.state
        );
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use texshare_gpu::BackendKind;

    use super::*;

    fn session(mode: AccessMode) -> Session {
        Session {
            mode,
            initialized_on_entry: true,
            used_serial: None,
            wrote: false,
            waited: Vec::new(),
            layout: vk::ImageLayout::UNDEFINED,
            state: AcceptedState::None,
            holds_keyed_mutex: false,
        }
    }

    fn request(caps: &BackendCapabilities, concurrent_read: bool) -> BeginRequest<'_> {
        BeginRequest {
            memory: "memory",
            concurrent_read,
            initialized: true,
            caps,
        }
    }

    fn begin(
        tracker: &mut AccessTracker,
        key: TextureKey,
        caps: &BackendCapabilities,
        concurrent_read: bool,
    ) -> Result<(), AccessError> {
        let mode = tracker.check_begin(key, request(caps, concurrent_read))?;
        tracker.open(key, session(mode));
        Ok(())
    }

    #[test]
    fn writer_excludes_readers() {
        let caps = BackendKind::MtlSharedEvent.capabilities();
        let mut tracker = AccessTracker::new();
        let writer = tracker.register(TextureSlot::new("writer", DeviceId(1), true));
        let reader = tracker.register(TextureSlot::new("reader", DeviceId(1), false));

        begin(&mut tracker, writer, caps, false).unwrap();
        assert_eq!(tracker.state(), AccessState::HeldExclusiveWrite);
        let err = begin(&mut tracker, reader, caps, false).unwrap_err();
        insta::assert_snapshot!(err, @"memory is currently accessed for writing");

        tracker.check_end(writer).unwrap();
        tracker.close(writer).unwrap();
        begin(&mut tracker, reader, caps, false).unwrap();
        assert_eq!(tracker.state(), AccessState::HeldExclusiveRead);
        let err = begin(&mut tracker, writer, caps, false).unwrap_err();
        insta::assert_snapshot!(err, @"memory is currently accessed for exclusive reading");
    }

    #[test]
    fn concurrent_readers_count_down() {
        let caps = BackendKind::MtlSharedEvent.capabilities();
        let mut tracker = AccessTracker::new();
        let a = tracker.register(TextureSlot::new("a", DeviceId(1), false));
        let b = tracker.register(TextureSlot::new("b", DeviceId(1), false));
        let c = tracker.register(TextureSlot::new("c", DeviceId(1), false));

        begin(&mut tracker, a, caps, true).unwrap();
        begin(&mut tracker, b, caps, true).unwrap();
        assert_eq!(tracker.state(), AccessState::HeldConcurrentRead(2));
        let err = begin(&mut tracker, c, caps, false).unwrap_err();
        insta::assert_snapshot!(err, @"memory is currently accessed for reading");

        tracker.close(a);
        assert_eq!(tracker.state(), AccessState::HeldConcurrentRead(1));
        tracker.close(b);
        assert_eq!(tracker.state(), AccessState::Idle);
    }

    #[test]
    fn double_begin_and_double_end() {
        let caps = BackendKind::DmaBuf.capabilities();
        let mut tracker = AccessTracker::new();
        let key = tracker.register(TextureSlot::new("texture", DeviceId(1), true));

        begin(&mut tracker, key, caps, false).unwrap();
        let err = begin(&mut tracker, key, caps, false).unwrap_err();
        insta::assert_snapshot!(err, @"texture is already used to access memory");

        tracker.close(key);
        let err = tracker.check_end(key).unwrap_err();
        insta::assert_snapshot!(err, @"texture is not currently being accessed");
    }

    #[test]
    fn concurrent_read_of_writable_texture_is_rejected() {
        let caps = BackendKind::MtlSharedEvent.capabilities();
        let mut tracker = AccessTracker::new();
        let key = tracker.register(TextureSlot::new("rw", DeviceId(1), true));
        let err = begin(&mut tracker, key, caps, true).unwrap_err();
        insta::assert_snapshot!(err, @"Concurrent reading read-write rw is not allowed");
        assert_eq!(tracker.state(), AccessState::Idle);
    }

    #[test]
    fn vulkan_readers_must_be_on_different_devices() {
        let caps = BackendKind::OpaqueFd.capabilities();
        let mut tracker = AccessTracker::new();
        let first = tracker.register(TextureSlot::new("first", DeviceId(1), false));
        let same = tracker.register(TextureSlot::new("same", DeviceId(1), false));
        let other = tracker.register(TextureSlot::new("other", DeviceId(2), false));

        begin(&mut tracker, first, caps, true).unwrap();
        let err = begin(&mut tracker, same, caps, true).unwrap_err();
        insta::assert_snapshot!(err, @"OpaqueFD does not support concurrent reading within one device");
        begin(&mut tracker, other, caps, true).unwrap();
        assert_eq!(tracker.state(), AccessState::HeldConcurrentRead(2));
    }

    #[test]
    fn unregister_force_closes() {
        let caps = BackendKind::EglSync.capabilities();
        let mut tracker = AccessTracker::new();
        let key = tracker.register(TextureSlot::new("texture", DeviceId(1), true));
        begin(&mut tracker, key, caps, false).unwrap();

        let closed = tracker.unregister(key).unwrap();
        assert_eq!(closed.mode, AccessMode::ExclusiveWrite);
        assert_eq!(tracker.state(), AccessState::Idle);
        assert_eq!(tracker.open_sessions(), 0);
        assert!(tracker.slot(key).is_none());
    }

    #[test]
    fn concurrent_read_needs_initialized_contents() {
        let caps = BackendKind::MtlSharedEvent.capabilities();
        let mut tracker = AccessTracker::new();
        let reader = tracker.register(TextureSlot::new("reader", DeviceId(1), false));
        let concurrent = BeginRequest {
            initialized: false,
            ..request(caps, true)
        };
        let err = tracker.check_begin(reader, concurrent).unwrap_err();
        insta::assert_snapshot!(err, @"Concurrent reading uninitialized reader is not allowed");
        assert_eq!(tracker.state(), AccessState::Idle);

        let exclusive = BeginRequest {
            initialized: false,
            ..request(caps, false)
        };
        assert_eq!(
            tracker.check_begin(reader, exclusive).unwrap(),
            AccessMode::ExclusiveRead
        );
    }

    #[test]
    fn only_untouched_read_sessions_hand_back_their_waits() {
        let mut read = session(AccessMode::ConcurrentRead);
        assert!(read.read_fences().is_none());

        let context = texshare_gpu::Context::builder().build();
        let device = texshare_gpu::DeviceContext::builder(BackendKind::MtlSharedEvent)
            .build(&context)
            .unwrap();
        read.waited.push(FenceValue::new(device.timeline_fence().clone(), 3));
        assert_eq!(read.read_fences().map(<[FenceValue]>::len), Some(1));

        read.wrote = true;
        assert!(read.read_fences().is_none());

        let mut write = session(AccessMode::ExclusiveWrite);
        write.waited = read.waited.clone();
        assert!(write.read_fences().is_none());
    }
}
