//! Uniform buffers and indexed uniform buffer arrays.

use std::sync::Arc;

use tracing::trace;

use maprender_core::RenderingStats;
use maprender_rhi::{
    BufferBinding, BufferHandle, BufferUsage, DescriptorSetCategory, GpuResource,
};

use crate::command_encoder::RenderPass;
use crate::context::Context;
use crate::descriptor_set::DescriptorSet;
use crate::error::{RenderError, RenderResult};
use crate::frame_resources::{PendingRelease, ReleaseQueue};

/// A host-visible uniform buffer.
///
/// Dropping it defers the GPU release until the current frame slot is
/// reused.
#[derive(Debug)]
pub struct UniformBuffer {
    buffer: BufferHandle,
    size: u64,
    releases: ReleaseQueue,
    stats: Arc<RenderingStats>,
}

impl UniformBuffer {
    /// Creates a buffer holding a copy of `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is empty or the backend cannot create
    /// or write the buffer.
    pub fn new(context: &Context, data: &[u8]) -> RenderResult<Self> {
        if data.is_empty() {
            return Err(RenderError::EmptyUniformData);
        }
        let size = data.len() as u64;
        let backend = context.backend();
        let buffer = backend.create_buffer(size, BufferUsage::Uniform, "uniform")?;
        if let Err(e) = backend.write_buffer(buffer, 0, data) {
            backend.release(GpuResource::Buffer(buffer));
            return Err(e.into());
        }

        let stats = Arc::clone(context.stats());
        stats.add_uniform_buffer(size);

        Ok(Self {
            buffer,
            size,
            releases: context.release_queue().clone(),
            stats,
        })
    }

    /// Overwrites the contents; `data` must be exactly [`Self::size`] bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on a size mismatch or if the write fails.
    pub fn update(&self, context: &Context, data: &[u8]) -> RenderResult<()> {
        if data.len() as u64 != self.size {
            return Err(RenderError::UniformSizeMismatch {
                expected: self.size,
                actual: data.len() as u64,
            });
        }
        context.backend().write_buffer(self.buffer, 0, data)?;
        self.stats.add_uniform_update(self.size);
        Ok(())
    }

    #[inline]
    pub fn handle(&self) -> BufferHandle {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for UniformBuffer {
    fn drop(&mut self) {
        self.stats.remove_uniform_buffer(self.size);
        self.releases
            .enqueue(None, PendingRelease::Gpu(GpuResource::Buffer(self.buffer)));
    }
}

/// Fixed number of uniform buffer slots bound through one descriptor set.
///
/// Slot `i` is bound at binding `i`. Empty slots are bound to a small
/// dummy buffer so every binding of the layout is valid.
#[derive(Debug)]
pub struct UniformBufferArray {
    buffers: Vec<Option<Arc<UniformBuffer>>>,
    descriptor_set: DescriptorSet,
}

impl UniformBufferArray {
    pub fn new(context: &Context, category: DescriptorSetCategory, count: usize) -> Self {
        Self {
            buffers: vec![None; count],
            descriptor_set: DescriptorSet::new(context, category),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Arc<UniformBuffer>> {
        self.buffers.get(id).and_then(Option::as_ref)
    }

    #[inline]
    pub fn descriptor_set(&self) -> &DescriptorSet {
        &self.descriptor_set
    }

    #[inline]
    pub fn descriptor_set_mut(&mut self) -> &mut DescriptorSet {
        &mut self.descriptor_set
    }

    /// Replaces the buffer in slot `id`.
    ///
    /// Setting the buffer already in the slot does nothing; anything else
    /// marks every frame dirty.
    pub fn set(&mut self, id: usize, buffer: Option<Arc<UniformBuffer>>) {
        let Some(slot) = self.buffers.get_mut(id) else {
            debug_assert!(false, "uniform slot {} out of range", id);
            return;
        };
        let unchanged = match (slot.as_ref(), buffer.as_ref()) {
            (Some(current), Some(new)) => Arc::ptr_eq(current, new),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }
        *slot = buffer;
        self.descriptor_set.mark_dirty(true);
    }

    /// Writes `data` into slot `id`, creating a new buffer when the slot is
    /// empty or holds a buffer of a different size.
    ///
    /// # Errors
    ///
    /// Returns an error if buffer creation or the write fails.
    pub fn create_or_update(
        &mut self,
        context: &Context,
        id: usize,
        data: &[u8],
    ) -> RenderResult<()> {
        if let Some(buffer) = self.get(id)
            && buffer.size() == data.len() as u64
        {
            return buffer.update(context, data);
        }
        let buffer = UniformBuffer::new(context, data)?;
        self.set(id, Some(Arc::new(buffer)));
        Ok(())
    }

    /// Writes the descriptors of slots `start..start + count` for the current
    /// frame of `thread_index`, if that frame is dirty.
    ///
    /// # Errors
    ///
    /// Returns an error if allocating the descriptor set or writing it fails.
    pub fn update(
        &mut self,
        context: &Context,
        start: usize,
        count: usize,
        thread_index: Option<usize>,
    ) -> RenderResult<()> {
        self.descriptor_set.allocate(context, thread_index)?;

        let frame = context.current_frame_index();
        if !self.descriptor_set.is_dirty(thread_index, frame) {
            return Ok(());
        }
        let Some(set) = self.descriptor_set.handle(thread_index, frame) else {
            return Ok(());
        };

        let dummy = context.dummy_uniform_buffer();
        let bindings: Vec<BufferBinding> = (start..start + count)
            .map(|index| {
                let (buffer, size) = match self.get(index) {
                    Some(buffer) => (buffer.handle(), buffer.size()),
                    None => (dummy.handle(), dummy.size()),
                };
                BufferBinding {
                    binding: index as u32,
                    buffer,
                    offset: 0,
                    size,
                }
            })
            .collect();

        context
            .backend()
            .write_uniform_descriptors(set, &bindings)?;
        context.stats().add_descriptor_writes(1);
        self.descriptor_set.set_dirty(thread_index, frame, false);

        trace!(
            "Wrote {} {} binding(s) for frame {}",
            bindings.len(),
            self.descriptor_set.category().name(),
            frame
        );
        Ok(())
    }

    /// Updates every slot and binds the set for `thread_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update or command buffer access fails.
    pub fn bind(
        &mut self,
        context: &Context,
        render_pass: &RenderPass<'_>,
        thread_index: Option<usize>,
    ) -> RenderResult<()> {
        self.update(context, 0, self.buffers.len(), thread_index)?;
        let command_buffer = render_pass.command_buffer(thread_index)?;
        self.descriptor_set
            .bind(context, command_buffer, thread_index);
        Ok(())
    }

    /// Empties every slot.
    pub fn clear(&mut self) {
        if self.buffers.iter().any(Option::is_some) {
            self.buffers.fill(None);
            self.descriptor_set.mark_dirty(true);
        }
    }
}
