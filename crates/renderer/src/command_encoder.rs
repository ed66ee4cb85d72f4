//! Per-frame command recording scopes.
//!
//! A frame is encoded through one [`CommandEncoder`]: an [`UploadPass`] for
//! buffer and texture uploads, then one or more [`RenderPass`]es. A render
//! pass records on the primary command buffer when encoding is
//! single-threaded; with worker threads each thread records into its own
//! secondary buffer, and [`RenderPass::end_encoding`] splices them back into
//! the primary in thread-index order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, trace};

use maprender_rhi::{
    ClearValues, CommandBufferHandle, RenderPassBegin, RenderTarget, SubpassContents,
    TextureHandle,
};

use crate::context::{Context, FrameStatus};
use crate::error::{RenderError, RenderResult};

/// What a render pass draws into and how it is cleared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPassDescriptor {
    pub target: RenderTarget,
    pub clear: ClearValues,
    /// Records every thread on the primary buffer, even with workers.
    pub inline: bool,
}

impl RenderPassDescriptor {
    /// Renders to the surface, keeping its previous contents.
    pub fn surface() -> Self {
        Self {
            target: RenderTarget::Surface,
            clear: ClearValues::default(),
            inline: false,
        }
    }

    /// Renders to an offscreen texture.
    pub fn offscreen(texture: TextureHandle) -> Self {
        Self {
            target: RenderTarget::Offscreen(texture),
            ..Self::surface()
        }
    }

    pub fn inline(mut self) -> Self {
        self.inline = true;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear.color = Some(color);
        self
    }

    pub fn with_clear_depth(mut self, depth: f32) -> Self {
        self.clear.depth = Some(depth);
        self
    }

    pub fn with_clear_stencil(mut self, stencil: u32) -> Self {
        self.clear.stencil = Some(stencil);
        self
    }
}

/// Recording scope of one frame.
pub struct CommandEncoder<'c> {
    context: &'c Context,
    pass_active: Arc<AtomicBool>,
}

impl<'c> CommandEncoder<'c> {
    pub(crate) fn new(context: &'c Context) -> Self {
        Self {
            context,
            pass_active: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn context(&self) -> &'c Context {
        self.context
    }

    /// Opens the upload pass. Uploads record on the upload buffer, which is
    /// submitted ahead of the primary buffer.
    pub fn create_upload_pass(&self, name: &str) -> UploadPass<'c> {
        let command_buffer = self.context.upload_command_buffer();
        UploadPass {
            context: self.context,
            command_buffer,
            _group: DebugGroup::new(self.context, command_buffer, name),
        }
    }

    /// Begins a render pass on the current frame.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::RenderPassActive`] if another pass is still
    /// open, [`RenderError::TargetUnavailable`] if the renderable cannot be
    /// rendered to, or the backend error if beginning fails.
    pub fn create_render_pass(
        &self,
        name: &str,
        descriptor: RenderPassDescriptor,
    ) -> RenderResult<RenderPass<'c>> {
        if !self.context.backend().renderable().is_available() {
            return Err(RenderError::TargetUnavailable);
        }
        if self.pass_active.swap(true, Ordering::AcqRel) {
            return Err(RenderError::RenderPassActive);
        }

        let primary = self.context.primary_command_buffer();
        let inline = descriptor.inline || self.context.worker_threads() == 0;
        let contents = if inline {
            SubpassContents::Inline
        } else {
            SubpassContents::SecondaryCommandBuffers
        };

        let debug_group = self.context.config().debug_groups;
        if debug_group {
            self.context.backend().push_debug_group(primary, name);
        }
        let begin = RenderPassBegin {
            target: descriptor.target,
            image_index: self.context.image_index(),
            clear: descriptor.clear,
            contents,
        };
        if let Err(e) = self.context.backend().begin_render_pass(primary, &begin) {
            if debug_group {
                self.context.backend().pop_debug_group(primary);
            }
            self.pass_active.store(false, Ordering::Release);
            return Err(e.into());
        }
        self.context.set_inline_encoding(descriptor.inline);

        debug!("Began render pass '{}' ({:?})", name, contents);
        Ok(RenderPass {
            context: self.context,
            name: name.to_string(),
            debug_group,
            secondary_contents: !inline,
            pass_active: Arc::clone(&self.pass_active),
            ended: AtomicBool::new(false),
        })
    }

    /// Opens a debug group on the buffer `thread_index` records into.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread's secondary buffer cannot be begun.
    pub fn create_debug_group(
        &self,
        thread_index: Option<usize>,
        name: &str,
    ) -> RenderResult<DebugGroup<'c>> {
        let command_buffer = self.context.command_buffer(thread_index)?;
        Ok(DebugGroup::new(self.context, command_buffer, name))
    }

    /// Submits the frame and presents it.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::RenderPassActive`] if a render pass is still
    /// open, or the backend error if submission fails.
    pub fn present(&self) -> RenderResult<FrameStatus> {
        if self.pass_active.load(Ordering::Acquire) {
            return Err(RenderError::RenderPassActive);
        }
        self.context.submit_frame()
    }
}

/// Upload scope. Dropping it closes its debug group.
pub struct UploadPass<'c> {
    context: &'c Context,
    command_buffer: CommandBufferHandle,
    _group: DebugGroup<'c>,
}

impl<'c> UploadPass<'c> {
    #[inline]
    pub fn context(&self) -> &'c Context {
        self.context
    }

    #[inline]
    pub fn command_buffer(&self) -> CommandBufferHandle {
        self.command_buffer
    }

    pub fn create_debug_group(&self, name: &str) -> DebugGroup<'c> {
        DebugGroup::new(self.context, self.command_buffer, name)
    }
}

/// An open render pass.
///
/// Ended explicitly with [`RenderPass::end_encoding`], or on drop.
pub struct RenderPass<'c> {
    context: &'c Context,
    name: String,
    debug_group: bool,
    /// Contents come from worker secondaries only.
    secondary_contents: bool,
    pass_active: Arc<AtomicBool>,
    ended: AtomicBool,
}

impl<'c> RenderPass<'c> {
    #[inline]
    pub fn context(&self) -> &'c Context {
        self.context
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The command buffer `thread_index` records into inside this pass.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::ThreadIndexRequired`] for the render thread
    /// (`None`) in a pass fed by secondary buffers, or an error if the
    /// thread's secondary buffer cannot be begun.
    pub fn command_buffer(&self, thread_index: Option<usize>) -> RenderResult<CommandBufferHandle> {
        if self.secondary_contents && thread_index.is_none() {
            return Err(RenderError::ThreadIndexRequired(self.name.clone()));
        }
        self.context.command_buffer(thread_index)
    }

    /// Clears the stencil attachment to `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread's secondary buffer cannot be begun.
    pub fn clear_stencil(&self, thread_index: Option<usize>, value: u32) -> RenderResult<()> {
        let command_buffer = self.command_buffer(thread_index)?;
        self.context.backend().clear_stencil(command_buffer, value);
        Ok(())
    }

    /// Opens a debug group on the buffer of `thread_index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread's secondary buffer cannot be begun.
    pub fn create_debug_group(
        &self,
        thread_index: Option<usize>,
        name: &str,
    ) -> RenderResult<DebugGroup<'c>> {
        let command_buffer = self.command_buffer(thread_index)?;
        Ok(DebugGroup::new(self.context, command_buffer, name))
    }

    /// Inserts a single debug label.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread's secondary buffer cannot be begun.
    pub fn insert_debug_marker(&self, thread_index: Option<usize>, name: &str) -> RenderResult<()> {
        if self.context.config().debug_groups {
            let command_buffer = self.command_buffer(thread_index)?;
            self.context
                .backend()
                .insert_debug_marker(command_buffer, name);
        }
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Executes the secondary buffers and ends the pass. Later calls do
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if ending a secondary buffer fails.
    pub fn end_encoding(&self) -> RenderResult<()> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.context.end_encoding();
        self.context.set_inline_encoding(false);
        if self.debug_group {
            self.context
                .backend()
                .pop_debug_group(self.context.primary_command_buffer());
        }
        self.pass_active.store(false, Ordering::Release);
        trace!("Ended render pass '{}'", self.name);
        result
    }
}

impl Drop for RenderPass<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.end_encoding() {
            error!("Failed to end render pass '{}': {}", self.name, e);
        }
    }
}

/// Labelled command range, closed on drop. Inert when debug groups are
/// disabled.
pub struct DebugGroup<'c> {
    context: &'c Context,
    command_buffer: Option<CommandBufferHandle>,
}

impl<'c> DebugGroup<'c> {
    fn new(context: &'c Context, command_buffer: CommandBufferHandle, name: &str) -> Self {
        let command_buffer = context.config().debug_groups.then(|| {
            context.backend().push_debug_group(command_buffer, name);
            command_buffer
        });
        Self {
            context,
            command_buffer,
        }
    }
}

impl Drop for DebugGroup<'_> {
    fn drop(&mut self) {
        if let Some(command_buffer) = self.command_buffer {
            self.context.backend().pop_debug_group(command_buffer);
        }
    }
}
