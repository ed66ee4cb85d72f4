//! Backend-neutral GPU object handles.
//!
//! Handles are plain 64-bit values. The Vulkan backend stores the raw
//! Vulkan handle, the headless backend a counter.

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const NULL: Self = Self(0);

            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            #[inline]
            pub const fn raw(self) -> u64 {
                self.0
            }

            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

define_handle!(
    /// GPU-to-CPU synchronization object.
    FenceHandle
);
define_handle!(
    /// GPU-to-GPU synchronization object.
    SemaphoreHandle
);
define_handle!(
    /// Primary or secondary command buffer.
    CommandBufferHandle
);
define_handle!(DescriptorPoolHandle);
define_handle!(DescriptorSetHandle);
define_handle!(
    /// Device buffer, typically a uniform buffer.
    BufferHandle
);
define_handle!(
    /// Compiled shader program and its pipeline state.
    PipelineHandle
);
define_handle!(
    /// Offscreen color target.
    TextureHandle
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_round_trip() {
        let handle = BufferHandle::from_raw(42);
        assert_eq!(handle.raw(), 42);
        assert!(!handle.is_null());
        assert!(BufferHandle::NULL.is_null());
    }
}
