//! Vulkan external semaphore support.
//!
//! The software devices in this crate need no driver. This module talks to a real
//! Vulkan driver through `ash` to report which [`SyncPrimitiveKind`]s the host can
//! export and import, and to exercise an opaque-fd export/import round trip.

pub mod instance;
pub mod semaphore;

use ash::vk;

use crate::capabilities::SyncPrimitiveKind;
use crate::error::{GpuError, Result};

pub use semaphore::{handle_type, SemaphoreSupport};

/// Support for one primitive kind on the probed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSupport {
    pub kind: SyncPrimitiveKind,
    pub support: SemaphoreSupport,
}

/// Headless Vulkan instance bound to the best physical device.
pub struct VulkanProbe {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device_name: String,
}

impl VulkanProbe {
    /// Load the Vulkan loader and pick a physical device.
    pub fn new(enable_validation: bool) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;
        let instance =
            unsafe { instance::create_headless_instance(&entry, "texshare-probe", enable_validation)? };

        let physical_device = match unsafe { instance::select_physical_device(&instance) } {
            Ok(device) => device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let device_name = unsafe { instance::device_name(&instance, physical_device) };
        tracing::info!("Probing Vulkan device {}", device_name);

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device_name,
        })
    }

    /// Name of the probed device.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// External semaphore support for every primitive kind.
    pub fn semaphore_support(&self) -> Vec<KindSupport> {
        SyncPrimitiveKind::ALL
            .into_iter()
            .map(|kind| KindSupport {
                kind,
                support: unsafe {
                    semaphore::query_support(&self.instance, self.physical_device, kind)
                },
            })
            .collect()
    }

    /// Export an opaque-fd semaphore and import it into a second semaphore.
    ///
    /// Returns the exported descriptor number.
    pub fn opaque_fd_round_trip(&self) -> Result<i32> {
        let kind = SyncPrimitiveKind::VkSemaphoreOpaqueFd;
        let extension = ash::khr::external_semaphore_fd::NAME;
        if !unsafe { instance::has_device_extension(&self.instance, self.physical_device, extension) }
        {
            return Err(GpuError::ExtensionNotSupported(
                extension.to_string_lossy().into_owned(),
            ));
        }
        let support =
            unsafe { semaphore::query_support(&self.instance, self.physical_device, kind) };
        if !(support.exportable && support.importable) {
            return Err(GpuError::FeatureNotSupported {
                backend: crate::capabilities::BackendKind::OpaqueFd,
                kind,
            });
        }

        let priorities = [1.0_f32];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(0)
            .queue_priorities(&priorities)];
        let extensions = [extension.as_ptr()];
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&extensions);
        let device = unsafe {
            self.instance
                .create_device(self.physical_device, &create_info, None)?
        };

        let result = unsafe { round_trip(&self.instance, &device, kind) };
        unsafe { device.destroy_device(None) };
        result
    }
}

unsafe fn round_trip(
    instance: &ash::Instance,
    device: &ash::Device,
    kind: SyncPrimitiveKind,
) -> Result<i32> {
    let loader = ash::khr::external_semaphore_fd::Device::new(instance, device);
    let exported = unsafe { semaphore::create_exportable_semaphore(device, kind)? };
    let imported = match unsafe { semaphore::create_import_target(device, kind) } {
        Ok(semaphore) => semaphore,
        Err(e) => {
            unsafe { device.destroy_semaphore(exported, None) };
            return Err(e);
        }
    };

    let result = unsafe { semaphore::export_fd(&loader, exported, kind) }.and_then(|fd| {
        unsafe { semaphore::import_fd(&loader, imported, kind, fd)? };
        Ok(fd)
    });

    unsafe {
        device.destroy_semaphore(imported, None);
        device.destroy_semaphore(exported, None);
    }
    if let Ok(fd) = result {
        tracing::debug!("{} round trip through descriptor {}", kind, fd);
    }
    result
}

impl Drop for VulkanProbe {
    fn drop(&mut self) {
        unsafe { self.instance.destroy_instance(None) };
    }
}
