//! RHI-specific error types.

use thiserror::Error;

use crate::backend::BackendKind;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// The backend does not implement the requested operation.
    #[error("{operation} is not supported by the {backend:?} backend")]
    Unsupported {
        backend: BackendKind,
        operation: &'static str,
    },

    /// A descriptor pool has no capacity left for the request.
    #[error("Descriptor pool exhausted: {0}")]
    PoolExhausted(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// The presentation surface is gone.
    #[error("Surface lost: {0}")]
    SurfaceLost(String),

    /// A command buffer was used in the wrong recording state.
    #[error("Command buffer state error: {0}")]
    CommandBufferState(String),
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_display() {
        let err = RhiError::Unsupported {
            backend: BackendKind::Vulkan,
            operation: "offscreen render target",
        };
        assert_eq!(
            err.to_string(),
            "offscreen render target is not supported by the Vulkan backend"
        );
    }

    #[test]
    fn test_vulkan_error_conversion() {
        let err: RhiError = ash::vk::Result::ERROR_OUT_OF_POOL_MEMORY.into();
        assert!(matches!(err, RhiError::VulkanError(_)));
    }
}
