//! Backend specific state carried through begin and end access.

use ash::vk;
use texshare_core::constants::KEYED_MUTEX_ACQUIRE_KEY;
use texshare_gpu::{BackendCapabilities, BackendStateKind};

use crate::error::AccessError;

/// Out-of-band state a backend exchanges on begin and end access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendState {
    #[default]
    None,
    /// D3D11 textures may skip the end access fence when the caller orders work itself.
    D3D11 { requires_end_access_fence: bool },
    /// Layout the image was left in and the layout it must be transitioned to.
    VkImageLayout {
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    KeyedMutex { key: u64 },
}

impl BackendState {
    /// Undefined-layout begin state for Vulkan backends.
    pub const UNDEFINED_LAYOUT: Self = Self::VkImageLayout {
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::UNDEFINED,
    };

    pub const fn kind(&self) -> BackendStateKind {
        match self {
            Self::None => BackendStateKind::None,
            Self::D3D11 { .. } => BackendStateKind::D3D11,
            Self::VkImageLayout { .. } => BackendStateKind::VkImageLayout,
            Self::KeyedMutex { .. } => BackendStateKind::KeyedMutex,
        }
    }
}

/// Begin state after validation against a backend, normalised so the end path
/// never needs to look at the caller's descriptor again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptedState {
    None,
    D3D11 { requires_end_access_fence: bool },
    VkImageLayout { layout: vk::ImageLayout },
    KeyedMutex,
}

impl AcceptedState {
    /// Validate `state` for a backend.
    ///
    /// Vulkan backends require an explicit layout pair; the others accept `None` and
    /// fall back to their defaults.
    pub(crate) fn validate(
        caps: &BackendCapabilities,
        state: BackendState,
    ) -> Result<Self, AccessError> {
        match (caps.state_kind, state) {
            (BackendStateKind::None, BackendState::None) => Ok(Self::None),
            (BackendStateKind::D3D11, BackendState::None) => Ok(Self::D3D11 {
                requires_end_access_fence: true,
            }),
            (
                BackendStateKind::D3D11,
                BackendState::D3D11 {
                    requires_end_access_fence,
                },
            ) => Ok(Self::D3D11 {
                requires_end_access_fence,
            }),
            (BackendStateKind::VkImageLayout, BackendState::VkImageLayout { new_layout, .. }) => {
                Ok(Self::VkImageLayout { layout: new_layout })
            }
            (BackendStateKind::VkImageLayout, BackendState::None) => {
                Err(AccessError::InvalidBackendState(format!(
                    "{} requires a Vulkan image layout begin state",
                    caps.backend
                )))
            }
            (BackendStateKind::KeyedMutex, BackendState::None) => Ok(Self::KeyedMutex),
            (BackendStateKind::KeyedMutex, BackendState::KeyedMutex { key })
                if key == KEYED_MUTEX_ACQUIRE_KEY =>
            {
                Ok(Self::KeyedMutex)
            }
            (BackendStateKind::KeyedMutex, BackendState::KeyedMutex { key }) => {
                Err(AccessError::InvalidBackendState(format!(
                    "keyed mutex key {key} is not the shared acquire key {KEYED_MUTEX_ACQUIRE_KEY}"
                )))
            }
            (expected, state) => Err(AccessError::InvalidBackendState(format!(
                "{} expects {expected:?} state, got {:?}",
                caps.backend,
                state.kind()
            ))),
        }
    }

    /// Whether end access must export fences for submitted work.
    pub(crate) const fn requires_end_fence(self) -> bool {
        !matches!(
            self,
            Self::D3D11 {
                requires_end_access_fence: false
            }
        )
    }

    /// State handed back on end access. `current_layout` is the layout the last
    /// submitted work left the image in.
    pub(crate) const fn end_state(self, current_layout: vk::ImageLayout) -> BackendState {
        match self {
            Self::None => BackendState::None,
            Self::D3D11 {
                requires_end_access_fence,
            } => BackendState::D3D11 {
                requires_end_access_fence,
            },
            Self::VkImageLayout { .. } => BackendState::VkImageLayout {
                old_layout: current_layout,
                new_layout: current_layout,
            },
            Self::KeyedMutex => BackendState::KeyedMutex {
                key: KEYED_MUTEX_ACQUIRE_KEY,
            },
        }
    }

    /// Layout the image is in when access begins.
    pub(crate) const fn initial_layout(self) -> vk::ImageLayout {
        match self {
            Self::VkImageLayout { layout } => layout,
            _ => vk::ImageLayout::UNDEFINED,
        }
    }
}
