//! Descriptor set layouts, pools and updates for Vulkan.
//!
//! Every [`DescriptorSetCategory`] has one layout: `descriptors_per_set`
//! uniform-buffer bindings, or combined image samplers for the
//! drawable-image category. All four layouts are combined into a single
//! [`PipelineLayout`] so a category's set index is the same in every
//! pipeline.
//!
//! Pools are never freed set by set. Released sets are recycled by the
//! caller, so pools are created without `FREE_DESCRIPTOR_SET`.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::backend::DescriptorSetCategory;
use crate::device::Device;
use crate::error::RhiResult;

/// Size of the push constant block shared by all pipelines.
pub const PUSH_CONSTANT_SIZE: u32 = 128;

fn descriptor_type(category: DescriptorSetCategory) -> vk::DescriptorType {
    match category {
        DescriptorSetCategory::DrawableImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        _ => vk::DescriptorType::UNIFORM_BUFFER,
    }
}

/// Vulkan descriptor set layout wrapper.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Creates the layout used by every set of `category`.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn for_category(
        device: Arc<Device>,
        category: DescriptorSetCategory,
        descriptors_per_set: u32,
    ) -> RhiResult<Self> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..descriptors_per_set)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(descriptor_type(category))
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };

        debug!(
            "Created {} descriptor set layout with {} binding(s)",
            category.name(),
            bindings.len()
        );

        Ok(Self { device, layout })
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("Destroyed descriptor set layout");
    }
}

/// Pipeline layout combining the four category set layouts.
pub struct PipelineLayout {
    device: Arc<Device>,
    layout: vk::PipelineLayout,
}

impl PipelineLayout {
    /// Creates the layout; `set_layouts` must be in set index order.
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn new(device: Arc<Device>, set_layouts: &[vk::DescriptorSetLayout]) -> RhiResult<Self> {
        let push_constants = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE)];
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(&push_constants);

        let layout = unsafe { device.handle().create_pipeline_layout(&create_info, None)? };

        debug!("Created pipeline layout with {} set(s)", set_layouts.len());

        Ok(Self { device, layout })
    }

    #[inline]
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_pipeline_layout(self.layout, None);
        }
        debug!("Destroyed pipeline layout");
    }
}

/// Vulkan descriptor pool wrapper.
pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    category: DescriptorSetCategory,
    max_sets: u32,
}

impl DescriptorPool {
    /// Creates a pool holding `max_sets` sets of `category`.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation fails.
    pub fn new(
        device: Arc<Device>,
        category: DescriptorSetCategory,
        max_sets: u32,
        descriptors_per_set: u32,
    ) -> RhiResult<Self> {
        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(descriptor_type(category))
            .descriptor_count(max_sets * descriptors_per_set)];
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.handle().create_descriptor_pool(&create_info, None)? };

        debug!(
            "Created {} descriptor pool: max_sets={}",
            category.name(),
            max_sets
        );

        Ok(Self {
            device,
            pool,
            category,
            max_sets,
        })
    }

    /// Allocates `count` sets with `layout`.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails (e.g., pool exhausted).
    pub fn allocate(
        &self,
        layout: vk::DescriptorSetLayout,
        count: usize,
    ) -> RhiResult<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout; count];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.handle().allocate_descriptor_sets(&alloc_info)? };

        debug!(
            "Allocated {} {} descriptor set(s)",
            sets.len(),
            self.category.name()
        );

        Ok(sets)
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    #[inline]
    pub fn category(&self) -> DescriptorSetCategory {
        self.category
    }

    #[inline]
    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_pool(self.pool, None);
        }
        debug!("Destroyed {} descriptor pool", self.category.name());
    }
}

/// Writes uniform buffer bindings into `set`.
///
/// Each entry is `(binding, buffer, offset, range)`.
pub fn write_uniform_buffers(
    device: &Device,
    set: vk::DescriptorSet,
    buffers: &[(u32, vk::Buffer, vk::DeviceSize, vk::DeviceSize)],
) {
    if buffers.is_empty() {
        return;
    }

    let infos: Vec<[vk::DescriptorBufferInfo; 1]> = buffers
        .iter()
        .map(|&(_, buffer, offset, range)| {
            [vk::DescriptorBufferInfo::default()
                .buffer(buffer)
                .offset(offset)
                .range(range)]
        })
        .collect();
    let writes: Vec<vk::WriteDescriptorSet> = buffers
        .iter()
        .zip(&infos)
        .map(|(&(binding, ..), info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(info)
        })
        .collect();

    unsafe {
        device.handle().update_descriptor_sets(&writes, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_types_per_category() {
        assert_eq!(
            descriptor_type(DescriptorSetCategory::Global),
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            descriptor_type(DescriptorSetCategory::DrawableUniform),
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            descriptor_type(DescriptorSetCategory::DrawableImage),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }
}
