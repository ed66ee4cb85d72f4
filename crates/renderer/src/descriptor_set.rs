//! Lazily allocated, per-thread descriptor sets.
//!
//! A [`DescriptorSet`] holds, for every thread slot, one backend set per
//! frame in flight. Slots are allocated the first time a thread needs
//! them, from that thread's own pools, so encoding threads never contend
//! on a pool. Each frame has its own dirty flag: a write made for one frame
//! must not touch a set the GPU may still be reading for another.

use tracing::trace;

use maprender_rhi::{CommandBufferHandle, DescriptorSetCategory, DescriptorSetHandle};

use crate::context::Context;
use crate::error::RenderResult;
use crate::frame_resources::{PendingRelease, ReleaseQueue, thread_slot};

#[derive(Debug, Default)]
struct ThreadSets {
    sets: Vec<DescriptorSetHandle>,
    dirty: Vec<bool>,
    pool_index: Option<usize>,
}

/// Descriptor sets of one binding category.
#[derive(Debug)]
pub struct DescriptorSet {
    category: DescriptorSetCategory,
    frame_count: usize,
    threads: Vec<ThreadSets>,
    releases: ReleaseQueue,
}

impl DescriptorSet {
    /// Creates an unallocated set shaped for `context`.
    pub fn new(context: &Context, category: DescriptorSetCategory) -> Self {
        Self {
            category,
            frame_count: context.frame_count(),
            threads: (0..context.slot_count()).map(|_| ThreadSets::default()).collect(),
            releases: context.release_queue().clone(),
        }
    }

    #[inline]
    pub fn category(&self) -> DescriptorSetCategory {
        self.category
    }

    pub fn is_allocated(&self, thread_index: Option<usize>) -> bool {
        self.threads
            .get(thread_slot(thread_index))
            .is_some_and(|thread| thread.pool_index.is_some())
    }

    /// Allocates one set per frame for `thread_index`.
    ///
    /// Repeated calls are no-ops until the set is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool allocation fails.
    pub fn allocate(&mut self, context: &Context, thread_index: Option<usize>) -> RenderResult<()> {
        let slot = thread_slot(thread_index);
        let Some(thread) = self.threads.get_mut(slot) else {
            debug_assert!(false, "no descriptor slot for thread {:?}", thread_index);
            return Ok(());
        };
        if thread.pool_index.is_some() {
            return Ok(());
        }

        let (pool_index, sets) = context
            .descriptor_pools()
            .get(self.category, thread_index)
            .lock()
            .allocate(context.backend().as_ref(), self.frame_count, context.stats())?;

        trace!(
            "Allocated {} {} set(s) for slot {} from pool {}",
            sets.len(),
            self.category.name(),
            slot,
            pool_index
        );

        thread.sets = sets;
        thread.dirty = vec![true; self.frame_count];
        thread.pool_index = Some(pool_index);
        Ok(())
    }

    /// Allocates the sets of every thread slot ahead of encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if a pool allocation fails.
    pub fn allocate_all(&mut self, context: &Context) -> RenderResult<()> {
        self.allocate(context, None)?;
        for index in 0..self.threads.len().saturating_sub(1) {
            self.allocate(context, Some(index))?;
        }
        Ok(())
    }

    /// Sets the dirty flag of every frame on every thread.
    pub fn mark_dirty(&mut self, dirty: bool) {
        for thread in &mut self.threads {
            thread.dirty.fill(dirty);
        }
    }

    pub fn is_dirty(&self, thread_index: Option<usize>, frame: usize) -> bool {
        self.threads
            .get(thread_slot(thread_index))
            .and_then(|thread| thread.dirty.get(frame))
            .copied()
            .unwrap_or(false)
    }

    pub(crate) fn set_dirty(&mut self, thread_index: Option<usize>, frame: usize, dirty: bool) {
        if let Some(flag) = self
            .threads
            .get_mut(thread_slot(thread_index))
            .and_then(|thread| thread.dirty.get_mut(frame))
        {
            *flag = dirty;
        }
    }

    /// The set of `thread_index` for `frame`, if allocated.
    pub fn handle(&self, thread_index: Option<usize>, frame: usize) -> Option<DescriptorSetHandle> {
        self.threads
            .get(thread_slot(thread_index))
            .and_then(|thread| thread.sets.get(frame))
            .copied()
    }

    /// Binds the current frame's set at the category's set index.
    pub fn bind(
        &self,
        context: &Context,
        command_buffer: CommandBufferHandle,
        thread_index: Option<usize>,
    ) {
        let frame = context.current_frame_index();
        let Some(set) = self.handle(thread_index, frame) else {
            debug_assert!(false, "{} set bound before allocation", self.category.name());
            return;
        };
        context
            .backend()
            .bind_descriptor_set(command_buffer, self.category, set);
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        for (slot, thread) in self.threads.iter_mut().enumerate() {
            if let Some(pool_index) = thread.pool_index.take() {
                self.releases.enqueue(
                    None,
                    PendingRelease::DescriptorSets {
                        category: self.category,
                        thread_index: slot.checked_sub(1),
                        pool_index,
                        sets: std::mem::take(&mut thread.sets),
                    },
                );
            }
        }
    }
}
