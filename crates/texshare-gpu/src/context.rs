//! Process context and the portable handle table.
//!
//! A [`Context`] stands in for the operating system's handle namespace: exported
//! fences and platform allocations are registered here and handed
//! around as [`RawHandle`] values, exactly like file descriptors or NT handles.
//! All process-wide state lives in this object; there are no globals.
//!
//! Create one with [`ContextBuilder::build`]. Dropping the last clone closes every
//! handle that is still open.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::NativeDeviceId;
use crate::error::{GpuError, Result, EMFILE};
use crate::sync::{FenceCell, FenceId};

/// Opaque portable handle (fd, NT handle, shared event reference, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

impl RawHandle {
    /// Null handle.
    pub const NULL: Self = Self(0);

    /// Returns true if this is the null handle.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Object a handle refers to.
#[derive(Clone)]
pub enum HandleObject {
    Fence(Arc<FenceCell>),
    /// Platform memory owned by a higher layer.
    Memory(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for HandleObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fence(cell) => f.debug_tuple("Fence").field(&cell.id()).finish(),
            Self::Memory(_) => f.write_str("Memory"),
        }
    }
}

struct HandleTable {
    next: u64,
    capacity: usize,
    entries: HashMap<u64, HandleObject>,
}

struct ContextInner {
    label: String,
    handles: Mutex<HandleTable>,
    next_device: AtomicU64,
    next_native_device: AtomicU64,
    next_fence: AtomicU64,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let handles = self.handles.get_mut();
        if !handles.entries.is_empty() {
            tracing::debug!(
                "Context {} closing {} outstanding handles",
                self.label,
                handles.entries.len()
            );
        }
        handles.entries.clear();
    }
}

/// Explicit process context shared by every device.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Start building a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Context label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Register an object and return a fresh handle to it.
    ///
    /// Fails with `EMFILE` once the table is full.
    pub fn register_handle(&self, object: HandleObject) -> Result<RawHandle> {
        let mut table = self.inner.handles.lock();
        if table.entries.len() >= table.capacity {
            return Err(GpuError::Internal {
                message: format!("Handle table of context {} is full", self.inner.label),
                code: EMFILE,
            });
        }
        table.next += 1;
        let raw = table.next;
        table.entries.insert(raw, object);
        Ok(RawHandle(raw))
    }

    /// Look up the object behind a handle.
    pub fn resolve_handle(&self, handle: RawHandle) -> Option<HandleObject> {
        self.inner.handles.lock().entries.get(&handle.0).cloned()
    }

    /// Close a handle. Returns false if it was not open.
    pub fn close_handle(&self, handle: RawHandle) -> bool {
        self.inner.handles.lock().entries.remove(&handle.0).is_some()
    }

    /// Number of handles currently open.
    pub fn open_handle_count(&self) -> usize {
        self.inner.handles.lock().entries.len()
    }

    pub(crate) fn next_device_id(&self) -> u64 {
        self.inner.next_device.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_fence_id(&self) -> FenceId {
        FenceId(self.inner.next_fence.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Allocate the identity of a new native device.
    pub fn new_native_device(&self) -> NativeDeviceId {
        NativeDeviceId(self.inner.next_native_device.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Returns true if both values refer to the same context.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("label", &self.inner.label)
            .field("open_handles", &self.open_handle_count())
            .finish()
    }
}

/// Builder for creating a context.
pub struct ContextBuilder {
    label: String,
    max_handles: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            label: "texshare".to_string(),
            max_handles: 1024,
        }
    }
}

impl ContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the context label used in diagnostics.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Set how many handles may be open at once.
    pub fn max_handles(mut self, max_handles: usize) -> Self {
        self.max_handles = max_handles;
        self
    }

    /// Build the context.
    pub fn build(self) -> Context {
        tracing::debug!("Creating context {}", self.label);
        Context {
            inner: Arc::new(ContextInner {
                label: self.label,
                handles: Mutex::new(HandleTable {
                    next: 0,
                    capacity: self.max_handles,
                    entries: HashMap::new(),
                }),
                next_device: AtomicU64::new(0),
                next_native_device: AtomicU64::new(0),
                next_fence: AtomicU64::new(0),
            }),
        }
    }
}
