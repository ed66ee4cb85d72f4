//! Renderer configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Per-category descriptor pool parameters.
///
/// The four fields correspond to the global, layer, drawable-uniform and
/// drawable-image binding categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolSizes {
    pub global: u32,
    pub layer: u32,
    pub drawable_uniform: u32,
    pub drawable_image: u32,
}

impl DescriptorPoolSizes {
    /// Default number of sets in the first pool of each category.
    pub const BASE_SETS: Self = Self {
        global: 3 * 4,
        layer: 3 * 256,
        drawable_uniform: 3 * 1024,
        drawable_image: 3 * 1024 / 2,
    };

    /// Default number of descriptors in one set of each category.
    pub const DESCRIPTORS_PER_SET: Self = Self {
        global: 4,
        layer: 4,
        drawable_uniform: 4,
        drawable_image: 4,
    };

    /// Scales pool sizes for `worker_threads` encoding threads.
    ///
    /// Every thread gets its own pools, so each one starts smaller:
    /// sizes are multiplied by two and divided by the thread count.
    pub fn scaled_for_threads(self, worker_threads: usize) -> Self {
        if worker_threads == 0 {
            return self;
        }
        let scale = |size: u32| (size.saturating_mul(2) / worker_threads as u32).max(1);
        Self {
            global: scale(self.global),
            layer: scale(self.layer),
            drawable_uniform: scale(self.drawable_uniform),
            drawable_image: scale(self.drawable_image),
        }
    }
}

impl Default for DescriptorPoolSizes {
    fn default() -> Self {
        Self::BASE_SETS
    }
}

/// Configuration for the rendering context and orchestrator.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Number of frame resource slots (frames in flight).
    pub frames_in_flight: usize,
    /// Number of encoding worker threads. Zero encodes everything on the
    /// render thread.
    pub worker_threads: usize,
    /// Number of sets in the first descriptor pool of each category.
    pub descriptor_pool_sizes: DescriptorPoolSizes,
    /// Number of descriptors per set of each category.
    pub descriptors_per_set: DescriptorPoolSizes,
    /// Geometric growth factor between successive descriptor pools.
    pub pool_grow_factor: f32,
    /// Upper bound for waiting on a frame's in-flight fence.
    pub fence_timeout: Duration,
    /// Reverse the partition to worker mapping on alternate frames.
    pub debug_thread_scramble: bool,
    /// Emit debug groups into command buffers.
    pub debug_groups: bool,
}

impl RendererConfig {
    /// Largest supported ring size.
    pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

    /// Default number of encoding threads for this machine.
    pub fn default_worker_threads() -> usize {
        num_cpus::get().saturating_sub(1).clamp(1, 4)
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_descriptor_pool_sizes(mut self, sizes: DescriptorPoolSizes) -> Self {
        self.descriptor_pool_sizes = sizes;
        self
    }

    pub fn with_pool_grow_factor(mut self, factor: f32) -> Self {
        self.pool_grow_factor = factor;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn with_debug_thread_scramble(mut self, enabled: bool) -> Self {
        self.debug_thread_scramble = enabled;
        self
    }

    pub fn with_debug_groups(mut self, enabled: bool) -> Self {
        self.debug_groups = enabled;
        self
    }

    /// Pool sizes adjusted for the configured number of worker threads.
    pub fn effective_pool_sizes(&self) -> DescriptorPoolSizes {
        self.descriptor_pool_sizes
            .scaled_for_threads(self.worker_threads)
    }

    /// Checks the configuration for values the backend cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > Self::MAX_FRAMES_IN_FLIGHT {
            return Err(Error::Config(format!(
                "frames_in_flight must be in 1..={}, got {}",
                Self::MAX_FRAMES_IN_FLIGHT,
                self.frames_in_flight
            )));
        }
        if !(self.pool_grow_factor > 1.0 && self.pool_grow_factor.is_finite()) {
            return Err(Error::Config(format!(
                "pool_grow_factor must be greater than 1.0, got {}",
                self.pool_grow_factor
            )));
        }
        let sizes = self.descriptor_pool_sizes;
        if [sizes.global, sizes.layer, sizes.drawable_uniform, sizes.drawable_image].contains(&0) {
            return Err(Error::Config("descriptor pool sizes must be non-zero".into()));
        }
        let per_set = self.descriptors_per_set;
        if [
            per_set.global,
            per_set.layer,
            per_set.drawable_uniform,
            per_set.drawable_image,
        ]
        .contains(&0)
        {
            return Err(Error::Config("descriptors per set must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            worker_threads: Self::default_worker_threads(),
            descriptor_pool_sizes: DescriptorPoolSizes::BASE_SETS,
            descriptors_per_set: DescriptorPoolSizes::DESCRIPTORS_PER_SET,
            pool_grow_factor: 1.5,
            fence_timeout: Duration::from_nanos(u64::MAX),
            debug_thread_scramble: false,
            debug_groups: true,
        }
    }
}
