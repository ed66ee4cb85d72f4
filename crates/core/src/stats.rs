//! Rendering statistics.
//!
//! Counters are updated from the render thread and from encoding worker
//! threads, so every field is atomic. Observers read a [`StatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Telemetry counters for the rendering backend.
#[derive(Debug, Default)]
pub struct RenderingStats {
    draw_calls: AtomicU64,
    total_draw_calls: AtomicU64,
    stencil_clears: AtomicU64,
    stencil_updates: AtomicU64,
    num_uniform_buffers: AtomicU64,
    mem_uniform_buffers: AtomicU64,
    num_uniform_updates: AtomicU64,
    uniform_update_bytes: AtomicU64,
    descriptor_pools: AtomicU64,
    descriptor_writes: AtomicU64,
    frames_rendered: AtomicU64,
    frames_skipped: AtomicU64,
}

/// Point-in-time copy of [`RenderingStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Draw calls issued in the current frame.
    pub draw_calls: u64,
    pub total_draw_calls: u64,
    pub stencil_clears: u64,
    pub stencil_updates: u64,
    pub num_uniform_buffers: u64,
    pub mem_uniform_buffers: u64,
    pub num_uniform_updates: u64,
    pub uniform_update_bytes: u64,
    pub descriptor_pools: u64,
    pub descriptor_writes: u64,
    pub frames_rendered: u64,
    pub frames_skipped: u64,
}

impl RenderingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_draw_calls(&self, count: u64) {
        self.draw_calls.fetch_add(count, Ordering::Relaxed);
        self.total_draw_calls.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_stencil_clear(&self) {
        self.stencil_clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stencil_update(&self) {
        self.stencil_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a newly created uniform buffer of `bytes` size.
    pub fn add_uniform_buffer(&self, bytes: u64) {
        self.num_uniform_buffers.fetch_add(1, Ordering::Relaxed);
        self.mem_uniform_buffers.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records the release of a uniform buffer of `bytes` size.
    pub fn remove_uniform_buffer(&self, bytes: u64) {
        self.num_uniform_buffers.fetch_sub(1, Ordering::Relaxed);
        self.mem_uniform_buffers.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn add_uniform_update(&self, bytes: u64) {
        self.num_uniform_updates.fetch_add(1, Ordering::Relaxed);
        self.uniform_update_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_descriptor_pool(&self) {
        self.descriptor_pools.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_descriptor_writes(&self, count: u64) {
        self.descriptor_writes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_frame_rendered(&self) {
        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_frame_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Resets the counters that describe a single frame.
    pub fn begin_frame(&self) {
        self.draw_calls.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            draw_calls: load(&self.draw_calls),
            total_draw_calls: load(&self.total_draw_calls),
            stencil_clears: load(&self.stencil_clears),
            stencil_updates: load(&self.stencil_updates),
            num_uniform_buffers: load(&self.num_uniform_buffers),
            mem_uniform_buffers: load(&self.mem_uniform_buffers),
            num_uniform_updates: load(&self.num_uniform_updates),
            uniform_update_bytes: load(&self.uniform_update_bytes),
            descriptor_pools: load(&self.descriptor_pools),
            descriptor_writes: load(&self.descriptor_writes),
            frames_rendered: load(&self.frames_rendered),
            frames_skipped: load(&self.frames_skipped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draw_calls_reset_per_frame() {
        let stats = RenderingStats::new();
        stats.add_draw_calls(3);
        stats.add_draw_calls(2);
        assert_eq!(stats.snapshot().draw_calls, 5);

        stats.begin_frame();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.draw_calls, 0);
        assert_eq!(snapshot.total_draw_calls, 5);
    }

    #[test]
    fn test_uniform_buffer_accounting() {
        let stats = RenderingStats::new();
        stats.add_uniform_buffer(256);
        stats.add_uniform_buffer(64);
        stats.remove_uniform_buffer(256);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.num_uniform_buffers, 1);
        assert_eq!(snapshot.mem_uniform_buffers, 64);
    }

    #[test]
    fn test_stats_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RenderingStats>();
    }
}
