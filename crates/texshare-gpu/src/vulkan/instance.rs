//! Headless Vulkan instance creation.

use std::ffi::{CStr, CString};

use ash::vk;

use crate::error::{GpuError, Result};

/// Instance extensions needed for external semaphore queries. Surfaces are never used.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Validation layers to enable on request.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance without any presentation extensions.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_headless_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::Other(format!("Invalid application name {app_name:?}")))?;
    let engine_name = c"texshare";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let extension_names: Vec<*const std::ffi::c_char> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let mut layer_names = Vec::with_capacity(layers.len());
    for layer in layers {
        let found = available_layers
            .iter()
            .any(|props| props.layer_name_as_c_str() == Ok(layer));
        if found {
            layer_names.push(layer.as_ptr());
        } else {
            tracing::warn!("Validation layer {:?} not available", layer);
        }
    }

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None)? };
    Ok(instance)
}

/// Select the physical device to probe, preferring discrete GPUs.
///
/// Devices below Vulkan 1.1 are skipped since external semaphores are core from 1.1.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    devices
        .into_iter()
        .filter_map(|device| {
            let properties = unsafe { instance.get_physical_device_properties(device) };
            let version = properties.api_version;
            if vk::api_version_major(version) == 1 && vk::api_version_minor(version) < 1 {
                return None;
            }
            let score = match properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 3,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
                vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
                _ => 0,
            };
            Some((score, device))
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Human readable name of a physical device.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn device_name(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> String {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    properties
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Whether the device exposes a device extension.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn has_device_extension(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    name: &CStr,
) -> bool {
    unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .unwrap_or_default()
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(name))
}
