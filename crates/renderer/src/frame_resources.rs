//! Frames-in-flight resources and deferred release.
//!
//! The [`FrameRing`] holds one [`FrameResources`] per frame in flight:
//!
//! - A primary command buffer for the frame's render passes
//! - An upload command buffer submitted ahead of the primary
//! - One secondary command buffer per worker thread
//! - A surface-acquire semaphore, a frame-complete semaphore and a fence
//!
//! GPU objects dropped while a frame may still use them are not destroyed
//! directly. They are pushed into the [`ReleaseQueue`] of the current slot
//! and released the next time that slot comes around, after its fence has
//! been waited on.
//!
//! # Synchronization Flow
//!
//! ```text
//! 1. Wait on fence (the previous use of this slot has finished)
//! 2. Reset command buffers, run the slot's pending releases
//! 3. Acquire a surface image (signals surface semaphore)
//! 4. Record upload, primary and secondary buffers
//! 5. Submit upload + primary:
//!    - Wait on surface semaphore
//!    - Signal frame semaphore
//!    - Signal fence
//! 6. Present (waits on frame semaphore)
//! 7. Advance to the next slot
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use maprender_rhi::{
    CommandBufferHandle, CommandBufferLevel, DescriptorSetCategory, DescriptorSetHandle,
    FenceHandle, GpuResource, GraphicsBackend, RhiResult, SemaphoreHandle,
};

/// Index of the per-thread slot used by `thread_index`.
///
/// Slot 0 belongs to the render thread, slot `i + 1` to worker `i`.
#[inline]
pub fn thread_slot(thread_index: Option<usize>) -> usize {
    thread_index.map_or(0, |index| index + 1)
}

/// A release deferred until the GPU is done with the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRelease {
    /// Destroyed through [`GraphicsBackend::release`].
    Gpu(GpuResource),
    /// Returned to the reuse queue of the pool they were allocated from.
    DescriptorSets {
        category: DescriptorSetCategory,
        thread_index: Option<usize>,
        pool_index: usize,
        sets: Vec<DescriptorSetHandle>,
    },
}

struct ReleaseQueues {
    backend: Arc<dyn GraphicsBackend>,
    current: AtomicUsize,
    closed: AtomicBool,
    /// Indexed by frame, then by thread slot.
    queues: Vec<Vec<Mutex<Vec<PendingRelease>>>>,
}

/// Shared handle to the per-frame, per-thread deferred release queues.
///
/// Cloned into every object that releases GPU resources on drop.
#[derive(Clone)]
pub struct ReleaseQueue {
    inner: Arc<ReleaseQueues>,
}

impl ReleaseQueue {
    pub(crate) fn new(
        backend: Arc<dyn GraphicsBackend>,
        frame_count: usize,
        slot_count: usize,
    ) -> Self {
        let queues = (0..frame_count)
            .map(|_| (0..slot_count).map(|_| Mutex::new(Vec::new())).collect())
            .collect();
        Self {
            inner: Arc::new(ReleaseQueues {
                backend,
                current: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                queues,
            }),
        }
    }

    /// Defers `release` until the current frame slot is reused.
    ///
    /// Once the frame resources are gone, GPU releases run immediately and
    /// descriptor sets are dropped along with their pools.
    pub fn enqueue(&self, thread_index: Option<usize>, release: PendingRelease) {
        if self.inner.closed.load(Ordering::Acquire) {
            match release {
                PendingRelease::Gpu(resource) => self.inner.backend.release(resource),
                PendingRelease::DescriptorSets { .. } => {
                    trace!("Dropping descriptor sets released after teardown");
                }
            }
            return;
        }

        let frame = self.inner.current.load(Ordering::Acquire);
        let slot = thread_slot(thread_index);
        match self.inner.queues.get(frame).and_then(|slots| slots.get(slot)) {
            Some(queue) => queue.lock().push(release),
            None => {
                debug_assert!(false, "release queued for unknown slot {}", slot);
                self.inner.queues[frame][0].lock().push(release);
            }
        }
    }

    /// Number of releases waiting in all slots.
    pub fn pending(&self) -> usize {
        self.inner
            .queues
            .iter()
            .flatten()
            .map(|queue| queue.lock().len())
            .sum()
    }

    /// Empties every thread queue of `frame`, in thread slot order.
    pub(crate) fn take_frame(&self, frame: usize) -> Vec<PendingRelease> {
        let mut releases = Vec::new();
        if let Some(slots) = self.inner.queues.get(frame) {
            for queue in slots {
                releases.append(&mut queue.lock());
            }
        }
        releases
    }

    /// Empties the queues of every frame.
    pub(crate) fn take_all(&self) -> Vec<PendingRelease> {
        (0..self.inner.queues.len())
            .flat_map(|frame| self.take_frame(frame))
            .collect()
    }

    pub(crate) fn set_current_frame(&self, frame: usize) {
        self.inner.current.store(frame, Ordering::Release);
    }

    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for ReleaseQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseQueue")
            .field("current", &self.inner.current.load(Ordering::Relaxed))
            .field("pending", &self.pending())
            .finish()
    }
}

/// Secondary command buffer of one worker thread.
#[derive(Debug)]
pub(crate) struct SecondarySlot {
    pub buffer: CommandBufferHandle,
    /// Whether the buffer has been begun in the current frame.
    pub begun: bool,
}

/// Per-frame rendering data.
pub struct FrameResources {
    primary: CommandBufferHandle,
    upload: CommandBufferHandle,
    secondaries: Vec<Mutex<SecondarySlot>>,
    surface_semaphore: SemaphoreHandle,
    frame_semaphore: SemaphoreHandle,
    fence: FenceHandle,
}

impl FrameResources {
    /// Allocates the resources of one slot.
    ///
    /// # Errors
    ///
    /// Returns an error if any allocation fails.
    fn new(backend: &dyn GraphicsBackend, worker_threads: usize) -> RhiResult<Self> {
        let primary = backend.allocate_command_buffer(CommandBufferLevel::Primary, None)?;
        let upload = backend.allocate_command_buffer(CommandBufferLevel::Primary, None)?;
        let secondaries = (0..worker_threads)
            .map(|index| {
                backend
                    .allocate_command_buffer(CommandBufferLevel::Secondary, Some(index))
                    .map(|buffer| {
                        Mutex::new(SecondarySlot {
                            buffer,
                            begun: false,
                        })
                    })
            })
            .collect::<RhiResult<Vec<_>>>()?;
        let surface_semaphore = backend.create_semaphore()?;
        let frame_semaphore = backend.create_semaphore()?;
        // Signaled so the first wait on a fresh slot returns immediately
        let fence = backend.create_fence(true)?;

        Ok(Self {
            primary,
            upload,
            secondaries,
            surface_semaphore,
            frame_semaphore,
            fence,
        })
    }

    #[inline]
    pub fn primary(&self) -> CommandBufferHandle {
        self.primary
    }

    #[inline]
    pub fn upload(&self) -> CommandBufferHandle {
        self.upload
    }

    #[inline]
    pub fn surface_semaphore(&self) -> SemaphoreHandle {
        self.surface_semaphore
    }

    #[inline]
    pub fn frame_semaphore(&self) -> SemaphoreHandle {
        self.frame_semaphore
    }

    #[inline]
    pub fn fence(&self) -> FenceHandle {
        self.fence
    }

    pub(crate) fn secondary(&self, thread_index: usize) -> Option<&Mutex<SecondarySlot>> {
        self.secondaries.get(thread_index)
    }

    pub(crate) fn secondaries(&self) -> &[Mutex<SecondarySlot>] {
        &self.secondaries
    }

    /// Resets every command buffer of the slot to the initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if a reset fails.
    pub(crate) fn reset(&self, backend: &dyn GraphicsBackend) -> RhiResult<()> {
        backend.reset_command_buffer(self.primary)?;
        backend.reset_command_buffer(self.upload)?;
        for secondary in &self.secondaries {
            let mut secondary = secondary.lock();
            backend.reset_command_buffer(secondary.buffer)?;
            secondary.begun = false;
        }
        Ok(())
    }

    fn into_resources(self) -> Vec<GpuResource> {
        let mut resources = vec![
            GpuResource::CommandBuffer {
                buffer: self.primary,
                thread_index: None,
            },
            GpuResource::CommandBuffer {
                buffer: self.upload,
                thread_index: None,
            },
        ];
        resources.extend(
            self.secondaries
                .into_iter()
                .enumerate()
                .map(|(index, secondary)| GpuResource::CommandBuffer {
                    buffer: secondary.into_inner().buffer,
                    thread_index: Some(index),
                }),
        );
        resources.push(GpuResource::Semaphore(self.surface_semaphore));
        resources.push(GpuResource::Semaphore(self.frame_semaphore));
        resources.push(GpuResource::Fence(self.fence));
        resources
    }
}

/// Ring of frame resources with a rotating current index.
pub struct FrameRing {
    frames: Vec<FrameResources>,
    index: usize,
}

impl FrameRing {
    /// Allocates `frame_count` slots eagerly.
    ///
    /// # Errors
    ///
    /// Returns an error if any allocation fails.
    pub(crate) fn new(
        backend: &dyn GraphicsBackend,
        frame_count: usize,
        worker_threads: usize,
    ) -> RhiResult<Self> {
        let frames = (0..frame_count)
            .map(|_| FrameResources::new(backend, worker_threads))
            .collect::<RhiResult<Vec<_>>>()?;

        debug!(
            "Created {} frame slot(s) with {} secondary buffer(s) each",
            frame_count, worker_threads
        );

        Ok(Self { frames, index: 0 })
    }

    #[inline]
    pub fn current(&self) -> &FrameResources {
        &self.frames[self.index]
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Moves to the next slot and returns its index.
    pub(crate) fn advance(&mut self) -> usize {
        self.index = (self.index + 1) % self.frames.len();
        self.index
    }

    pub(crate) fn reset_index(&mut self) {
        self.index = 0;
    }

    /// Empties the ring, returning every GPU object it owned.
    pub(crate) fn take_resources(&mut self) -> Vec<GpuResource> {
        self.index = 0;
        std::mem::take(&mut self.frames)
            .into_iter()
            .flat_map(FrameResources::into_resources)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maprender_rhi::{BufferHandle, HeadlessBackend, Size};

    fn backend() -> Arc<HeadlessBackend> {
        Arc::new(HeadlessBackend::new(Size::new(256, 256)))
    }

    #[test]
    fn test_thread_slot() {
        assert_eq!(thread_slot(None), 0);
        assert_eq!(thread_slot(Some(0)), 1);
        assert_eq!(thread_slot(Some(3)), 4);
    }

    #[test]
    fn test_ring_rotation_returns_to_start() {
        let backend = backend();
        let mut ring = FrameRing::new(backend.as_ref(), 3, 2).unwrap();
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.index(), 0);
        for expected in [1, 2, 0, 1, 2, 0] {
            assert_eq!(ring.advance(), expected);
        }
        assert_eq!(ring.index(), 0);
    }

    #[test]
    fn test_frame_owns_secondaries_per_worker() {
        let backend = backend();
        let ring = FrameRing::new(backend.as_ref(), 2, 3).unwrap();
        let frame = ring.current();
        assert_eq!(frame.secondaries().len(), 3);
        let secondary = frame.secondary(2).unwrap().lock().buffer;
        assert_eq!(backend.command_buffer_thread(secondary), Some(Some(2)));
        assert!(frame.secondary(3).is_none());
    }

    #[test]
    fn test_take_resources_lists_everything() {
        let backend = backend();
        let mut ring = FrameRing::new(backend.as_ref(), 2, 1).unwrap();
        // primary, upload, one secondary, two semaphores, one fence
        assert_eq!(ring.take_resources().len(), 2 * 6);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_release_queue_is_per_frame() {
        let backend = backend();
        let queue = ReleaseQueue::new(backend.clone(), 2, 3);
        queue.enqueue(None, PendingRelease::Gpu(GpuResource::Buffer(BufferHandle::from_raw(1))));
        queue.set_current_frame(1);
        queue.enqueue(
            Some(1),
            PendingRelease::Gpu(GpuResource::Buffer(BufferHandle::from_raw(2))),
        );
        assert_eq!(queue.pending(), 2);

        let first = queue.take_frame(0);
        assert_eq!(
            first,
            vec![PendingRelease::Gpu(GpuResource::Buffer(BufferHandle::from_raw(1)))]
        );
        assert!(queue.take_frame(0).is_empty());
        assert_eq!(queue.take_all().len(), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_closed_queue_releases_immediately() {
        let backend = backend();
        let queue = ReleaseQueue::new(backend.clone(), 1, 1);
        queue.close();
        queue.enqueue(None, PendingRelease::Gpu(GpuResource::Buffer(BufferHandle::from_raw(9))));
        assert_eq!(queue.pending(), 0);
        assert_eq!(
            backend.released(),
            vec![GpuResource::Buffer(BufferHandle::from_raw(9))]
        );
    }

    #[test]
    fn test_release_queue_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ReleaseQueue>();
        assert_send_sync::<FrameResources>();
    }
}
