//! Exportable Vulkan semaphores.

use ash::vk;

use crate::capabilities::SyncPrimitiveKind;
use crate::error::{GpuError, Result};

/// Vulkan handle type used to share a primitive of `kind`.
///
/// Metal shared events and EGL syncs have no Vulkan semaphore representation.
pub const fn handle_type(kind: SyncPrimitiveKind) -> Option<vk::ExternalSemaphoreHandleTypeFlags> {
    match kind {
        SyncPrimitiveKind::VkSemaphoreOpaqueFd => {
            Some(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD)
        }
        SyncPrimitiveKind::SyncFd => Some(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD),
        SyncPrimitiveKind::VkSemaphoreZirconHandle => {
            Some(vk::ExternalSemaphoreHandleTypeFlags::ZIRCON_EVENT_FUCHSIA)
        }
        SyncPrimitiveKind::DxgiSharedHandle => {
            Some(vk::ExternalSemaphoreHandleTypeFlags::D3D12_FENCE)
        }
        SyncPrimitiveKind::MtlSharedEvent | SyncPrimitiveKind::EglSync => None,
    }
}

/// Whether the handle type is transported as a POSIX file descriptor.
pub const fn is_fd_handle(kind: SyncPrimitiveKind) -> bool {
    matches!(
        kind,
        SyncPrimitiveKind::VkSemaphoreOpaqueFd | SyncPrimitiveKind::SyncFd
    )
}

fn require_handle_type(kind: SyncPrimitiveKind) -> Result<vk::ExternalSemaphoreHandleTypeFlags> {
    handle_type(kind).ok_or_else(|| {
        GpuError::ExtensionNotSupported(format!("{kind} has no Vulkan semaphore handle type"))
    })
}

/// External semaphore support reported by the driver for one primitive kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SemaphoreSupport {
    pub exportable: bool,
    pub importable: bool,
}

/// Query external semaphore support for `kind`.
///
/// Timeline kinds are queried with a timeline semaphore type.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn query_support(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    kind: SyncPrimitiveKind,
) -> SemaphoreSupport {
    let Some(handle_type) = handle_type(kind) else {
        return SemaphoreSupport::default();
    };

    let semaphore_type = if kind.is_timeline() {
        vk::SemaphoreType::TIMELINE
    } else {
        vk::SemaphoreType::BINARY
    };
    let mut type_info = vk::SemaphoreTypeCreateInfo::default().semaphore_type(semaphore_type);
    let info = vk::PhysicalDeviceExternalSemaphoreInfo::default()
        .handle_type(handle_type)
        .push_next(&mut type_info);
    let mut properties = vk::ExternalSemaphoreProperties::default();
    unsafe {
        instance.get_physical_device_external_semaphore_properties(
            physical_device,
            &info,
            &mut properties,
        );
    }

    let features = properties.external_semaphore_features;
    SemaphoreSupport {
        exportable: features.contains(vk::ExternalSemaphoreFeatureFlags::EXPORTABLE),
        importable: features.contains(vk::ExternalSemaphoreFeatureFlags::IMPORTABLE),
    }
}

/// Create a semaphore that can be exported as `kind`.
///
/// # Safety
/// The device must be valid and created with the matching external semaphore extension.
pub unsafe fn create_exportable_semaphore(
    device: &ash::Device,
    kind: SyncPrimitiveKind,
) -> Result<vk::Semaphore> {
    let handle_type = require_handle_type(kind)?;
    let mut export_info = vk::ExportSemaphoreCreateInfo::default().handle_types(handle_type);
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(if kind.is_timeline() {
            vk::SemaphoreType::TIMELINE
        } else {
            vk::SemaphoreType::BINARY
        })
        .initial_value(0);
    let create_info = vk::SemaphoreCreateInfo::default()
        .push_next(&mut export_info)
        .push_next(&mut type_info);

    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

/// Create a plain semaphore to import a payload into.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_import_target(
    device: &ash::Device,
    kind: SyncPrimitiveKind,
) -> Result<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default().semaphore_type(
        if kind.is_timeline() {
            vk::SemaphoreType::TIMELINE
        } else {
            vk::SemaphoreType::BINARY
        },
    );
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

/// Export a semaphore as a file descriptor.
///
/// For sync files the semaphore must have a pending signal operation.
///
/// # Safety
/// The loader's device and the semaphore must be valid.
pub unsafe fn export_fd(
    loader: &ash::khr::external_semaphore_fd::Device,
    semaphore: vk::Semaphore,
    kind: SyncPrimitiveKind,
) -> Result<i32> {
    if !is_fd_handle(kind) {
        return Err(GpuError::ExtensionNotSupported(format!(
            "{kind} is not shared as a file descriptor"
        )));
    }
    let info = vk::SemaphoreGetFdInfoKHR::default()
        .semaphore(semaphore)
        .handle_type(require_handle_type(kind)?);
    match unsafe { loader.get_semaphore_fd(&info) } {
        Ok(fd) => Ok(fd),
        Err(result) => {
            tracing::error!("vkGetSemaphoreFdKHR failed for {}: {:?}", kind, result);
            Err(GpuError::ExportFailed {
                kind,
                code: result.as_raw(),
            })
        }
    }
}

/// Import a file descriptor payload into `semaphore`.
///
/// Ownership of `fd` passes to the driver on success. Sync files are imported
/// temporarily, so the payload is consumed by the next wait.
///
/// # Safety
/// The loader's device and the semaphore must be valid and `fd` must be an open
/// descriptor of the right type.
pub unsafe fn import_fd(
    loader: &ash::khr::external_semaphore_fd::Device,
    semaphore: vk::Semaphore,
    kind: SyncPrimitiveKind,
    fd: i32,
) -> Result<()> {
    if fd < 0 {
        return Err(GpuError::InvalidHandle(format!("negative {kind} descriptor {fd}")));
    }
    let flags = if kind == SyncPrimitiveKind::SyncFd {
        vk::SemaphoreImportFlags::TEMPORARY
    } else {
        vk::SemaphoreImportFlags::empty()
    };
    let info = vk::ImportSemaphoreFdInfoKHR::default()
        .semaphore(semaphore)
        .handle_type(require_handle_type(kind)?)
        .flags(flags)
        .fd(fd);
    unsafe { loader.import_semaphore_fd(&info)? };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_handle_types() {
        assert_eq!(
            handle_type(SyncPrimitiveKind::SyncFd),
            Some(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD)
        );
        assert_eq!(handle_type(SyncPrimitiveKind::MtlSharedEvent), None);
        assert!(is_fd_handle(SyncPrimitiveKind::VkSemaphoreOpaqueFd));
        assert!(!is_fd_handle(SyncPrimitiveKind::VkSemaphoreZirconHandle));
    }

    #[test]
    fn kinds_without_handle_type_are_rejected() {
        assert!(matches!(
            require_handle_type(SyncPrimitiveKind::EglSync),
            Err(GpuError::ExtensionNotSupported(_))
        ));
    }
}
