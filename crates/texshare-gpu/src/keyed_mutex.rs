//! Keyed mutexes.
//!
//! A keyed mutex is a binary cross-device lock. `acquire_sync(key)` succeeds once the
//! mutex was last released with the same key; every cooperating process uses
//! [`KEYED_MUTEX_ACQUIRE_KEY`] for both acquire and release.

use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use texshare_core::constants::{KEYED_MUTEX_ACQUIRE_KEY, KEYED_MUTEX_INFINITE_TIMEOUT_MS};

use crate::device::DeviceContext;
use crate::error::{GpuError, Result, DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_INVALID_CALL};

/// `WAIT_ABANDONED`.
pub const WAIT_ABANDONED: i32 = 0x80;
/// `WAIT_TIMEOUT`.
pub const WAIT_TIMEOUT: i32 = 0x102;

/// Outcome of an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyedMutexStatus {
    Acquired,
    /// The previous owner's device went away while holding the mutex.
    Abandoned,
    Timeout,
    DeviceRemoved,
    Failed(i32),
}

/// Binary cross-device mutual exclusion primitive.
pub trait KeyedMutex: Send + Sync {
    /// Wait until the mutex was released with `key` and take it.
    fn acquire_sync(&self, key: u64, timeout_ms: u32) -> KeyedMutexStatus;

    /// Release the mutex, handing it to the next acquirer of `key`.
    ///
    /// Returns the OS status code on failure.
    fn release_sync(&self, key: u64) -> std::result::Result<(), i32>;
}

#[derive(Debug)]
struct KeyedMutexState {
    held: bool,
    release_key: u64,
    device_removed: bool,
}

/// In-process keyed mutex shared through the context handle table.
pub struct SoftwareKeyedMutex {
    state: Mutex<KeyedMutexState>,
    released: Condvar,
}

impl Default for SoftwareKeyedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareKeyedMutex {
    /// Create a released mutex, acquirable with [`KEYED_MUTEX_ACQUIRE_KEY`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KeyedMutexState {
                held: false,
                release_key: KEYED_MUTEX_ACQUIRE_KEY,
                device_removed: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Simulate removal of the device owning the mutex.
    ///
    /// Pending and future acquires report [`KeyedMutexStatus::DeviceRemoved`].
    pub fn mark_device_removed(&self) {
        self.state.lock().device_removed = true;
        self.released.notify_all();
    }

    /// Whether the mutex is currently held.
    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }
}

impl KeyedMutex for SoftwareKeyedMutex {
    fn acquire_sync(&self, key: u64, timeout_ms: u32) -> KeyedMutexStatus {
        let mut state = self.state.lock();
        loop {
            if state.device_removed {
                return KeyedMutexStatus::DeviceRemoved;
            }
            if !state.held && state.release_key == key {
                state.held = true;
                return KeyedMutexStatus::Acquired;
            }
            if timeout_ms == KEYED_MUTEX_INFINITE_TIMEOUT_MS {
                self.released.wait(&mut state);
            } else if self
                .released
                .wait_for(&mut state, Duration::from_millis(u64::from(timeout_ms)))
                .timed_out()
            {
                return KeyedMutexStatus::Timeout;
            }
        }
    }

    fn release_sync(&self, key: u64) -> std::result::Result<(), i32> {
        let mut state = self.state.lock();
        if !state.held {
            return Err(DXGI_ERROR_INVALID_CALL);
        }
        state.held = false;
        state.release_key = key;
        self.released.notify_all();
        Ok(())
    }
}

impl fmt::Debug for SoftwareKeyedMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareKeyedMutex")
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Acquire `mutex` for `device` with the well-known key and no timeout.
///
/// This blocks the calling thread until the mutex becomes available.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn acquire(device: &DeviceContext, mutex: &dyn KeyedMutex) -> Result<()> {
    if device.is_lost() {
        return Err(GpuError::DeviceLost(device.label().to_string()));
    }

    match mutex.acquire_sync(KEYED_MUTEX_ACQUIRE_KEY, KEYED_MUTEX_INFINITE_TIMEOUT_MS) {
        KeyedMutexStatus::Acquired => Ok(()),
        KeyedMutexStatus::DeviceRemoved => {
            tracing::error!(
                "Keyed mutex acquire on {} reported device removal (status {:#x})",
                device.label(),
                DXGI_ERROR_DEVICE_REMOVED
            );
            Err(GpuError::DeviceLost(device.label().to_string()))
        }
        KeyedMutexStatus::Abandoned => Err(GpuError::Internal {
            message: "Keyed mutex was abandoned by its previous owner".to_string(),
            code: WAIT_ABANDONED,
        }),
        KeyedMutexStatus::Timeout => Err(GpuError::Internal {
            message: "Keyed mutex acquire timed out".to_string(),
            code: WAIT_TIMEOUT,
        }),
        KeyedMutexStatus::Failed(code) => Err(GpuError::Internal {
            message: "Failed to acquire keyed mutex".to_string(),
            code,
        }),
    }
}

/// Release a mutex previously taken with [`acquire`].
///
/// # Panics
/// Panics if the release fails, which only happens when the mutex was not held.
pub fn release(mutex: &dyn KeyedMutex) {
    let result = mutex.release_sync(KEYED_MUTEX_ACQUIRE_KEY);
    assert!(
        result.is_ok(),
        "keyed mutex release failed with status {:#x}",
        result.err().unwrap_or_default()
    );
}
