//! Device contexts.
//!
//! A [`DeviceContext`] is one independent GPU device with its own ordered submission
//! queue. Work runs to completion inside [`DeviceContext::submit`]; the queue's
//! timeline fence is then signaled with the submission serial, which is what
//! exported fences wait on.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::capabilities::{BackendCapabilities, BackendKind, SyncPrimitiveKind};
use crate::context::Context;
use crate::error::{GpuError, Result};
use crate::sync::{adapter_for, FenceCell, FenceValue, PortablePayload, SharedFence, SyncAdapter};

/// Identity of a device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of the native device object behind a device context.
///
/// Backends with `use_same_device` only accept memory created on the same native device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeDeviceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Alive,
    Lost,
    Destroyed,
}

struct DeviceState {
    lifecycle: Lifecycle,
    last_submitted: u64,
    pending_waits: Vec<FenceValue>,
}

struct DeviceInner {
    id: DeviceId,
    label: String,
    backend: BackendKind,
    native_device: NativeDeviceId,
    fence_kind: SyncPrimitiveKind,
    context: Context,
    adapter: Arc<dyn SyncAdapter>,
    state: Mutex<DeviceState>,
    // Serializes submissions so serials complete in order.
    queue: Mutex<()>,
    timeline: SharedFence,
}

/// One independent device context.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<DeviceInner>,
}

impl DeviceContext {
    /// Start building a device for `backend`.
    pub fn builder(backend: BackendKind) -> DeviceBuilder {
        DeviceBuilder::new(backend)
    }

    /// Device identity.
    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    /// Device label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Backend this device imports memory through.
    pub fn backend(&self) -> BackendKind {
        self.inner.backend
    }

    /// Capabilities of the backend.
    pub fn capabilities(&self) -> &'static BackendCapabilities {
        self.inner.backend.capabilities()
    }

    /// Native device behind this context.
    pub fn native_device(&self) -> NativeDeviceId {
        self.inner.native_device
    }

    /// The single fence feature enabled on this device.
    pub fn fence_kind(&self) -> SyncPrimitiveKind {
        self.inner.fence_kind
    }

    /// Owning process context.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Synchronization strategy for this device.
    pub fn adapter(&self) -> &Arc<dyn SyncAdapter> {
        &self.inner.adapter
    }

    /// Persistent exportable fence signaled with each submission serial.
    pub fn timeline_fence(&self) -> &SharedFence {
        &self.inner.timeline
    }

    /// Whether the device was lost or destroyed.
    pub fn is_lost(&self) -> bool {
        self.inner.state.lock().lifecycle != Lifecycle::Alive
    }

    /// Whether the device was explicitly destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().lifecycle == Lifecycle::Destroyed
    }

    /// Destroy the device.
    ///
    /// Work submitted before this call is not discarded. Later submissions fail.
    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        if state.lifecycle != Lifecycle::Destroyed {
            tracing::info!(
                "Destroying device {} ({}) after {} submissions",
                self.inner.label,
                self.inner.id,
                state.last_submitted
            );
            state.lifecycle = Lifecycle::Destroyed;
            state.pending_waits.clear();
        }
    }

    /// Mark the device as lost, as if the driver removed it.
    pub fn lose(&self, reason: &str) {
        let mut state = self.inner.state.lock();
        if state.lifecycle == Lifecycle::Alive {
            tracing::error!("Device {} lost: {}", self.inner.label, reason);
            state.lifecycle = Lifecycle::Lost;
            state.pending_waits.clear();
        }
    }

    /// Serial of the most recent submission (0 before the first one).
    pub fn last_submitted_serial(&self) -> u64 {
        self.inner.state.lock().last_submitted
    }

    /// Queue a wait that the next submission performs before running.
    pub fn enqueue_wait(&self, wait: FenceValue) {
        self.inner.state.lock().pending_waits.push(wait);
    }

    /// Number of waits queued for the next submission.
    pub fn pending_wait_count(&self) -> usize {
        self.inner.state.lock().pending_waits.len()
    }

    /// Submit work to the queue.
    ///
    /// Pending fence waits are satisfied first, then `work` runs with the new
    /// submission serial, then the timeline is signaled with that serial.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, work: impl FnOnce(u64)) -> Result<u64> {
        let _queue = self.inner.queue.lock();

        let (waits, serial) = {
            let mut state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Alive {
                return Err(GpuError::DeviceLost(self.inner.label.clone()));
            }
            (
                std::mem::take(&mut state.pending_waits),
                state.last_submitted + 1,
            )
        };

        for wait in &waits {
            wait.fence.cell().wait(wait.value);
        }

        work(serial);

        self.inner.state.lock().last_submitted = serial;
        self.inner.timeline.cell().signal(serial);
        tracing::trace!(
            "Device {} completed submission {} after {} waits",
            self.inner.label,
            serial,
            waits.len()
        );
        Ok(serial)
    }

    /// Export `fence` through this device's adapter.
    pub fn export_fence(&self, fence: &SharedFence) -> Result<PortablePayload> {
        self.inner.adapter.export(self, fence)
    }

    /// Import a payload of this device's fence kind.
    pub fn import_fence(&self, payload: &PortablePayload) -> Result<SharedFence> {
        self.inner.adapter.import(self, payload, self.inner.fence_kind)
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("backend", &self.inner.backend)
            .finish()
    }
}

/// Builder for creating a device context.
pub struct DeviceBuilder {
    label: Option<String>,
    backend: BackendKind,
    fence_features: Vec<SyncPrimitiveKind>,
    native_device: Option<NativeDeviceId>,
    adapter: Option<Arc<dyn SyncAdapter>>,
}

impl DeviceBuilder {
    /// Create a new builder.
    pub fn new(backend: BackendKind) -> Self {
        Self {
            label: None,
            backend,
            fence_features: Vec::new(),
            native_device: None,
            adapter: None,
        }
    }

    /// Set the device label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Request a fence feature. At most one may be requested.
    pub fn fence_feature(mut self, kind: SyncPrimitiveKind) -> Self {
        if !self.fence_features.contains(&kind) {
            self.fence_features.push(kind);
        }
        self
    }

    /// Back the device by an existing native device instead of a new one.
    pub fn native_device(mut self, native_device: NativeDeviceId) -> Self {
        self.native_device = Some(native_device);
        self
    }

    /// Replace the synchronization strategy.
    pub fn adapter(mut self, adapter: Arc<dyn SyncAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Build the device context.
    pub fn build(self, context: &Context) -> Result<DeviceContext> {
        let caps = self.backend.capabilities();

        let fence_kind = match self.fence_features.as_slice() {
            [] => caps.native_fence_kind(),
            [kind] if caps.supports_fence(*kind) => *kind,
            [kind] => {
                return Err(GpuError::FeatureNotSupported {
                    backend: self.backend,
                    kind: *kind,
                })
            }
            _ => {
                return Err(GpuError::ConflictingFenceFeatures(
                    self.fence_features.clone(),
                ))
            }
        };

        let id = DeviceId(context.next_device_id());
        let label = self
            .label
            .unwrap_or_else(|| format!("{} device {}", self.backend, id));
        let native_device = self
            .native_device
            .unwrap_or_else(|| context.new_native_device());
        let adapter = self.adapter.unwrap_or_else(|| adapter_for(self.backend));
        let timeline = SharedFence::new(
            Arc::new(FenceCell::new(context.next_fence_id(), fence_kind)),
            id,
        );

        tracing::info!(
            "Created device {} ({}) with {} fences",
            label,
            id,
            fence_kind
        );

        Ok(DeviceContext {
            inner: Arc::new(DeviceInner {
                id,
                label,
                backend: self.backend,
                native_device,
                fence_kind,
                context: context.clone(),
                adapter,
                state: Mutex::new(DeviceState {
                    lifecycle: Lifecycle::Alive,
                    last_submitted: 0,
                    pending_waits: Vec::new(),
                }),
                queue: Mutex::new(()),
                timeline,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_fence_features_are_rejected_at_build() {
        let context = Context::builder().build();
        let result = DeviceBuilder::new(BackendKind::DmaBuf)
            .fence_feature(SyncPrimitiveKind::SyncFd)
            .fence_feature(SyncPrimitiveKind::VkSemaphoreOpaqueFd)
            .build(&context);
        assert!(matches!(result, Err(GpuError::ConflictingFenceFeatures(kinds)) if kinds.len() == 2));
    }

    #[test]
    fn repeated_feature_is_not_a_conflict() {
        let context = Context::builder().build();
        let device = DeviceBuilder::new(BackendKind::DmaBuf)
            .fence_feature(SyncPrimitiveKind::SyncFd)
            .fence_feature(SyncPrimitiveKind::SyncFd)
            .build(&context)
            .unwrap();
        assert_eq!(device.fence_kind(), SyncPrimitiveKind::SyncFd);
    }

    #[test]
    fn foreign_feature_is_rejected() {
        let context = Context::builder().build();
        let result = DeviceBuilder::new(BackendKind::EglSync)
            .fence_feature(SyncPrimitiveKind::MtlSharedEvent)
            .build(&context);
        assert!(matches!(result, Err(GpuError::FeatureNotSupported { .. })));
    }

    #[test]
    fn submissions_advance_timeline() {
        let context = Context::builder().build();
        let device = DeviceBuilder::new(BackendKind::MtlSharedEvent)
            .build(&context)
            .unwrap();
        let mut seen = Vec::new();
        device.submit(|serial| seen.push(serial)).unwrap();
        device.submit(|serial| seen.push(serial)).unwrap();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(device.timeline_fence().completed_value(), 2);
    }

    #[test]
    fn destroyed_device_rejects_work_but_keeps_history() {
        let context = Context::builder().build();
        let device = DeviceBuilder::new(BackendKind::OpaqueFd)
            .build(&context)
            .unwrap();
        device.submit(|_| {}).unwrap();
        device.destroy();
        assert!(device.is_lost());
        assert!(device.is_destroyed());
        assert!(matches!(device.submit(|_| {}), Err(GpuError::DeviceLost(_))));
        assert_eq!(device.last_submitted_serial(), 1);
    }

    #[test]
    fn same_native_device_can_be_shared() {
        let context = Context::builder().build();
        let first = DeviceBuilder::new(BackendKind::D3D11Texture2D)
            .build(&context)
            .unwrap();
        let second = DeviceBuilder::new(BackendKind::D3D11Texture2D)
            .native_device(first.native_device())
            .build(&context)
            .unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.native_device(), second.native_device());
    }
}
