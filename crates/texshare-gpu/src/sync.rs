//! External synchronization primitives.
//!
//! Fences are modelled as timelines ([`FenceCell`]). Timeline primitive kinds expose
//! the device's persistent fence and a monotonically increasing value; binary kinds
//! get a fresh fence per signal whose value is [`BINARY_SIGNALED_VALUE`] once
//! signaled, and each imported binary handle can be waited on exactly once.
//!
//! The [`SyncAdapter`] trait is the uniform surface over all primitive kinds. One
//! strategy object per [`BackendKind`] is attached to every device.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use texshare_core::constants::BINARY_SIGNALED_VALUE;

use crate::capabilities::{BackendKind, SyncPrimitiveKind};
use crate::context::{HandleObject, RawHandle};
use crate::device::{DeviceContext, DeviceId};
use crate::error::{GpuError, Result};

/// Identity of a fence, shared by every import and export of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceId(pub u64);

/// Timeline backing every fence.
pub struct FenceCell {
    id: FenceId,
    kind: SyncPrimitiveKind,
    value: Mutex<u64>,
    signaled: Condvar,
}

impl FenceCell {
    /// Create an unsignaled fence.
    pub fn new(id: FenceId, kind: SyncPrimitiveKind) -> Self {
        Self {
            id,
            kind,
            value: Mutex::new(0),
            signaled: Condvar::new(),
        }
    }

    /// Fence identity.
    pub fn id(&self) -> FenceId {
        self.id
    }

    /// Primitive kind.
    pub fn kind(&self) -> SyncPrimitiveKind {
        self.kind
    }

    /// Highest value signaled so far.
    pub fn completed_value(&self) -> u64 {
        *self.value.lock()
    }

    /// Advance the timeline. Values never move backwards.
    pub fn signal(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
            self.signaled.notify_all();
        }
    }

    /// Block until the timeline reaches `value`.
    pub fn wait(&self, value: u64) {
        let mut current = self.value.lock();
        while *current < value {
            self.signaled.wait(&mut current);
        }
    }

    /// Block until the timeline reaches `value` or `timeout` elapses.
    ///
    /// Returns true if the value was reached.
    pub fn wait_timeout(&self, value: u64, timeout: Duration) -> bool {
        let mut current = self.value.lock();
        while *current < value {
            if self.signaled.wait_for(&mut current, timeout).timed_out() {
                return *current >= value;
            }
        }
        true
    }
}

impl fmt::Debug for FenceCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceCell")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("value", &self.completed_value())
            .finish()
    }
}

struct SharedFenceInner {
    cell: Arc<FenceCell>,
    device: DeviceId,
    consumed: AtomicBool,
}

/// A fence as seen by one device, either created there or imported.
#[derive(Clone)]
pub struct SharedFence {
    inner: Arc<SharedFenceInner>,
}

impl SharedFence {
    pub(crate) fn new(cell: Arc<FenceCell>, device: DeviceId) -> Self {
        Self {
            inner: Arc::new(SharedFenceInner {
                cell,
                device,
                consumed: AtomicBool::new(false),
            }),
        }
    }

    /// Primitive kind.
    pub fn kind(&self) -> SyncPrimitiveKind {
        self.inner.cell.kind()
    }

    /// Identity of the underlying fence.
    pub fn id(&self) -> FenceId {
        self.inner.cell.id()
    }

    /// Device this fence object belongs to.
    pub fn device(&self) -> DeviceId {
        self.inner.device
    }

    /// Highest value signaled so far.
    pub fn completed_value(&self) -> u64 {
        self.inner.cell.completed_value()
    }

    /// Whether a binary import has already been waited on.
    pub fn is_consumed(&self) -> bool {
        self.inner.consumed.load(Ordering::Acquire)
    }

    /// Backing timeline.
    pub fn cell(&self) -> &Arc<FenceCell> {
        &self.inner.cell
    }

    /// Mark a binary import as consumed. Returns false if it already was.
    fn consume(&self) -> bool {
        !self.inner.consumed.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for SharedFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFence")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("device", &self.device())
            .finish()
    }
}

/// A fence together with the value to wait for or that will be signaled.
#[derive(Debug, Clone)]
pub struct FenceValue {
    pub fence: SharedFence,
    pub value: u64,
}

impl FenceValue {
    /// Pair a fence with a value.
    pub fn new(fence: SharedFence, value: u64) -> Self {
        Self { fence, value }
    }

    /// Whether the fence already reached the value.
    pub fn is_complete(&self) -> bool {
        self.fence.completed_value() >= self.value
    }
}

/// Exported fence as handed between devices or processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortablePayload {
    pub kind: SyncPrimitiveKind,
    pub handle: RawHandle,
}

/// Uniform import/export/wait/signal surface over heterogeneous OS primitives.
pub trait SyncAdapter: Send + Sync + fmt::Debug {
    /// Backend this adapter serves.
    fn backend(&self) -> BackendKind;

    /// Export a fence to a portable payload.
    fn export(&self, device: &DeviceContext, fence: &SharedFence) -> Result<PortablePayload>;

    /// Import a portable payload into `device`.
    fn import(
        &self,
        device: &DeviceContext,
        payload: &PortablePayload,
        kind: SyncPrimitiveKind,
    ) -> Result<SharedFence>;

    /// Make work submitted after this call wait until `fence` reaches `value`.
    fn wait_then_consume(&self, device: &DeviceContext, fence: &SharedFence, value: u64)
        -> Result<()>;

    /// Fence and value that are reached once all work submitted so far on `device`
    /// has completed.
    fn signal_after_work(&self, device: &DeviceContext) -> Result<FenceValue>;
}

/// Adapter for the software device model.
#[derive(Debug, Clone, Copy)]
pub struct SoftwareSyncAdapter {
    backend: BackendKind,
}

impl SoftwareSyncAdapter {
    /// Create the adapter for `backend`.
    pub const fn new(backend: BackendKind) -> Self {
        Self { backend }
    }
}

impl SyncAdapter for SoftwareSyncAdapter {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn export(&self, device: &DeviceContext, fence: &SharedFence) -> Result<PortablePayload> {
        let kind = fence.kind();
        if !self.backend.capabilities().supports_fence(kind) {
            return Err(GpuError::UnsupportedPrimitiveType {
                kind,
                backend: self.backend,
            });
        }

        let handle = device
            .context()
            .register_handle(HandleObject::Fence(Arc::clone(fence.cell())))
            .map_err(|e| match e {
                GpuError::Internal { code, .. } => GpuError::ExportFailed { kind, code },
                other => other,
            })?;

        tracing::trace!("Exported {} fence {:?} as {}", kind, fence.id(), handle);
        Ok(PortablePayload { kind, handle })
    }

    fn import(
        &self,
        device: &DeviceContext,
        payload: &PortablePayload,
        kind: SyncPrimitiveKind,
    ) -> Result<SharedFence> {
        if payload.handle.is_null() {
            return Err(GpuError::InvalidHandle(format!("null {kind} handle")));
        }
        if payload.kind != kind {
            return Err(GpuError::InvalidHandle(format!(
                "payload holds a {} handle, expected {kind}",
                payload.kind
            )));
        }
        if !self.backend.capabilities().supports_fence(kind) || device.fence_kind() != kind {
            return Err(GpuError::DeviceIncompatible {
                backend: self.backend,
                kind,
            });
        }

        let cell = match device.context().resolve_handle(payload.handle) {
            Some(HandleObject::Fence(cell)) if cell.kind() == kind => cell,
            Some(_) => {
                return Err(GpuError::InvalidHandle(format!(
                    "{} does not refer to a {kind} fence",
                    payload.handle
                )))
            }
            None => {
                return Err(GpuError::InvalidHandle(format!(
                    "{} is not an open handle",
                    payload.handle
                )))
            }
        };

        Ok(SharedFence::new(cell, device.id()))
    }

    fn wait_then_consume(
        &self,
        device: &DeviceContext,
        fence: &SharedFence,
        value: u64,
    ) -> Result<()> {
        if device.is_lost() {
            return Err(GpuError::DeviceLost(device.label().to_string()));
        }

        let value = if fence.kind().is_timeline() {
            value
        } else {
            if !fence.consume() {
                return Err(GpuError::InvalidHandle(format!(
                    "{} fence {:?} was already consumed by a wait",
                    fence.kind(),
                    fence.id()
                )));
            }
            BINARY_SIGNALED_VALUE
        };

        device.enqueue_wait(FenceValue::new(fence.clone(), value));
        Ok(())
    }

    fn signal_after_work(&self, device: &DeviceContext) -> Result<FenceValue> {
        let serial = device.last_submitted_serial();
        let kind = device.fence_kind();

        if kind.is_timeline() {
            return Ok(FenceValue::new(device.timeline_fence().clone(), serial));
        }

        // Software queues complete work before submit returns, so the fresh binary
        // fence can be signaled right away.
        debug_assert!(device.timeline_fence().completed_value() >= serial);
        let cell = Arc::new(FenceCell::new(device.context().next_fence_id(), kind));
        cell.signal(BINARY_SIGNALED_VALUE);
        Ok(FenceValue::new(
            SharedFence::new(cell, device.id()),
            BINARY_SIGNALED_VALUE,
        ))
    }
}

/// Strategy object for `backend`.
pub fn adapter_for(backend: BackendKind) -> Arc<dyn SyncAdapter> {
    Arc::new(SoftwareSyncAdapter::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::device::DeviceBuilder;

    fn device(context: &Context, backend: BackendKind) -> DeviceContext {
        DeviceBuilder::new(backend).build(context).unwrap()
    }

    #[test]
    fn fence_cell_is_monotonic() {
        let cell = FenceCell::new(FenceId(1), SyncPrimitiveKind::MtlSharedEvent);
        cell.signal(4);
        cell.signal(2);
        assert_eq!(cell.completed_value(), 4);
        assert!(cell.wait_timeout(4, Duration::from_millis(1)));
        assert!(!cell.wait_timeout(5, Duration::from_millis(1)));
    }

    #[test]
    fn timeline_round_trip_keeps_identity() {
        let context = Context::builder().build();
        let writer = device(&context, BackendKind::MtlSharedEvent);
        let reader = device(&context, BackendKind::MtlSharedEvent);

        writer.submit(|_| {}).unwrap();
        let signal = writer.adapter().signal_after_work(&writer).unwrap();
        assert_eq!(signal.value, 1);

        let payload = writer.export_fence(&signal.fence).unwrap();
        let imported = reader.import_fence(&payload).unwrap();
        assert_eq!(imported.id(), signal.fence.id());
        assert_eq!(imported.device(), reader.id());
        assert_eq!(imported.completed_value(), 1);
    }

    #[test]
    fn binary_fence_is_consumed_once() {
        let context = Context::builder().build();
        let writer = device(&context, BackendKind::DmaBuf);
        let reader = device(&context, BackendKind::DmaBuf);

        let signal = writer.adapter().signal_after_work(&writer).unwrap();
        assert_eq!(signal.value, BINARY_SIGNALED_VALUE);
        let payload = writer.export_fence(&signal.fence).unwrap();
        let imported = reader.import_fence(&payload).unwrap();

        let adapter = reader.adapter();
        adapter.wait_then_consume(&reader, &imported, 1).unwrap();
        assert!(imported.is_consumed());
        assert!(matches!(
            adapter.wait_then_consume(&reader, &imported, 1),
            Err(GpuError::InvalidHandle(_))
        ));
        assert_eq!(reader.pending_wait_count(), 1);
    }

    #[test]
    fn import_rejects_bad_payloads() {
        let context = Context::builder().build();
        let device = device(&context, BackendKind::OpaqueFd);
        let adapter = device.adapter();

        let null = PortablePayload {
            kind: SyncPrimitiveKind::VkSemaphoreOpaqueFd,
            handle: RawHandle::NULL,
        };
        assert!(matches!(
            adapter.import(&device, &null, SyncPrimitiveKind::VkSemaphoreOpaqueFd),
            Err(GpuError::InvalidHandle(_))
        ));

        let foreign = PortablePayload {
            kind: SyncPrimitiveKind::MtlSharedEvent,
            handle: RawHandle(7),
        };
        assert!(matches!(
            adapter.import(&device, &foreign, SyncPrimitiveKind::MtlSharedEvent),
            Err(GpuError::DeviceIncompatible { .. })
        ));

        let unknown = PortablePayload {
            kind: SyncPrimitiveKind::VkSemaphoreOpaqueFd,
            handle: RawHandle(99),
        };
        assert!(matches!(
            adapter.import(&device, &unknown, SyncPrimitiveKind::VkSemaphoreOpaqueFd),
            Err(GpuError::InvalidHandle(_))
        ));
    }

    #[test]
    fn export_rejects_foreign_kinds() {
        let context = Context::builder().build();
        let metal = device(&context, BackendKind::MtlSharedEvent);
        let egl = device(&context, BackendKind::EglSync);

        let fence = metal.timeline_fence().clone();
        assert!(matches!(
            egl.adapter().export(&egl, &fence),
            Err(GpuError::UnsupportedPrimitiveType { .. })
        ));
    }

    #[test]
    fn export_failure_carries_os_code() {
        let context = Context::builder().max_handles(0).build();
        let device = device(&context, BackendKind::MtlSharedEvent);
        match device.export_fence(device.timeline_fence()) {
            Err(GpuError::ExportFailed { code, .. }) => assert_eq!(code, crate::error::EMFILE),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
