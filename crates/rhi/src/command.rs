//! Command pool and command buffer recording.
//!
//! - [`CommandPool`] owns a VkCommandPool. The Vulkan backend creates one
//!   per encoding thread slot, since a pool may only be used by one thread
//!   at a time.
//! - [`CommandBuffer`] wraps a VkCommandBuffer handle with recording methods.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use crate::backend::{CommandBufferLevel, SubpassContents};
use crate::device::Device;
use crate::error::RhiResult;

/// Vulkan command pool wrapper.
///
/// Buffers are individually resettable.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Creates a command pool for the graphics queue family.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };

        debug!(
            "Command pool created for queue family {}",
            device.graphics_queue_family()
        );

        Ok(Self { device, pool })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocates a single command buffer of the given level.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn allocate(&self, level: CommandBufferLevel) -> RhiResult<vk::CommandBuffer> {
        let vk_level = match level {
            CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        };
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk_level)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into())
    }

    /// Returns a command buffer to the pool.
    pub fn free(&self, buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .handle()
                .free_command_buffers(self.pool, &[buffer]);
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
        debug!("Command pool destroyed");
    }
}

/// Recording view over a command buffer handle.
///
/// Does not own the buffer; it is freed through its [`CommandPool`].
pub struct CommandBuffer<'a> {
    device: &'a Device,
    buffer: vk::CommandBuffer,
}

impl<'a> CommandBuffer<'a> {
    #[inline]
    pub fn from_handle(device: &'a Device, buffer: vk::CommandBuffer) -> Self {
        Self { device, buffer }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins a primary buffer for one-time submission.
    ///
    /// # Errors
    ///
    /// Returns an error if beginning fails (e.g., if already recording).
    pub fn begin(&self) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)?;
        }

        Ok(())
    }

    /// Begins a secondary buffer that continues `render_pass` on `framebuffer`.
    ///
    /// # Errors
    ///
    /// Returns an error if beginning fails.
    pub fn begin_render_pass_continue(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    ) -> RhiResult<()> {
        let inheritance = vk::CommandBufferInheritanceInfo::default()
            .render_pass(render_pass)
            .subpass(0)
            .framebuffer(framebuffer);
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                    | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            )
            .inheritance_info(&inheritance);

        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)?;
        }

        Ok(())
    }

    /// Ends recording commands to the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if ending fails (e.g., if not recording).
    pub fn end(&self) -> RhiResult<()> {
        unsafe {
            self.device.handle().end_command_buffer(self.buffer)?;
        }

        Ok(())
    }

    /// Resets the command buffer to its initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&self) -> RhiResult<()> {
        unsafe {
            self.device
                .handle()
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::empty())?;
        }

        Ok(())
    }

    /// Executes secondary command buffers in slice order.
    pub fn execute_commands(&self, secondaries: &[vk::CommandBuffer]) {
        if secondaries.is_empty() {
            return;
        }
        unsafe {
            self.device
                .handle()
                .cmd_execute_commands(self.buffer, secondaries);
        }
    }

    // =========================================================================
    // Render Passes
    // =========================================================================

    pub fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
        contents: SubpassContents,
    ) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        let contents = match contents {
            SubpassContents::Inline => vk::SubpassContents::INLINE,
            SubpassContents::SecondaryCommandBuffers => {
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS
            }
        };

        unsafe {
            self.device
                .handle()
                .cmd_begin_render_pass(self.buffer, &begin_info, contents);
        }
    }

    pub fn end_render_pass(&self) {
        unsafe {
            self.device.handle().cmd_end_render_pass(self.buffer);
        }
    }

    /// Clears the stencil aspect of the whole render area.
    pub fn clear_stencil(&self, extent: vk::Extent2D, value: u32) {
        let attachment = vk::ClearAttachment::default()
            .aspect_mask(vk::ImageAspectFlags::STENCIL)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: value,
                },
            });
        let rect = vk::ClearRect::default()
            .rect(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .base_array_layer(0)
            .layer_count(1);

        unsafe {
            self.device
                .handle()
                .cmd_clear_attachments(self.buffer, &[attachment], &[rect]);
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn bind_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.handle().cmd_bind_pipeline(
                self.buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            );
        }
    }

    pub fn bind_descriptor_set(
        &self,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                self.buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set_index,
                &[set],
                &[],
            );
        }
    }

    pub fn set_stencil_reference(&self, reference: u32) {
        unsafe {
            self.device.handle().cmd_set_stencil_reference(
                self.buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                reference,
            );
        }
    }

    pub fn push_constants(&self, layout: vk::PipelineLayout, data: &[u8]) {
        unsafe {
            self.device.handle().cmd_push_constants(
                self.buffer,
                layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                data,
            );
        }
    }

    pub fn bind_vertex_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_vertex_buffers(self.buffer, 0, &[buffer], &[0]);
        }
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_index_buffer(self.buffer, buffer, 0, vk::IndexType::UINT16);
        }
    }

    pub fn draw_indexed(&self, index_count: u32, instance_count: u32) {
        unsafe {
            self.device
                .handle()
                .cmd_draw_indexed(self.buffer, index_count, instance_count, 0, 0, 0);
        }
    }

    // =========================================================================
    // Debug Labels
    // =========================================================================

    pub fn push_debug_group(&self, label: &str) {
        let Some(debug_utils) = self.device.debug_utils() else {
            return;
        };
        let Ok(name) = CString::new(label) else {
            warn!("Debug label contains a NUL byte: {:?}", label);
            return;
        };
        let info = vk::DebugUtilsLabelEXT::default().label_name(&name);
        unsafe { debug_utils.cmd_begin_debug_utils_label(self.buffer, &info) };
    }

    pub fn pop_debug_group(&self) {
        if let Some(debug_utils) = self.device.debug_utils() {
            unsafe { debug_utils.cmd_end_debug_utils_label(self.buffer) };
        }
    }

    pub fn insert_debug_marker(&self, label: &str) {
        let Some(debug_utils) = self.device.debug_utils() else {
            return;
        };
        let Ok(name) = CString::new(label) else {
            return;
        };
        let info = vk::DebugUtilsLabelEXT::default().label_name(&name);
        unsafe { debug_utils.cmd_insert_debug_utils_label(self.buffer, &info) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_pool_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CommandPool>();
    }
}
