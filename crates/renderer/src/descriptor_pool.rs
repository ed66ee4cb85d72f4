//! Growable descriptor pools.
//!
//! A [`DescriptorPoolGrowable`] owns a list of fixed-capacity pools for one
//! binding category and one thread slot. When every pool is full a new one
//! is created, `grow_factor` times larger than the previous. Pools never
//! shrink; released sets go to a per-pool reuse queue instead.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

use maprender_core::{DescriptorPoolSizes, RenderingStats};
use maprender_rhi::{
    DescriptorPoolHandle, DescriptorSetCategory, DescriptorSetHandle, GpuResource,
    GraphicsBackend, RhiResult,
};

use crate::frame_resources::thread_slot;

/// One fixed-capacity pool.
#[derive(Debug)]
pub struct PoolInfo {
    pub handle: DescriptorPoolHandle,
    pub capacity: u32,
    /// Sets never handed out by the backend yet.
    pub remaining_sets: u32,
    /// Released batches waiting for reuse, oldest first.
    pub unused_sets: VecDeque<Vec<DescriptorSetHandle>>,
}

/// Geometrically growing list of descriptor pools for one category.
#[derive(Debug)]
pub struct DescriptorPoolGrowable {
    category: DescriptorSetCategory,
    base_sets: u32,
    descriptors_per_set: u32,
    grow_factor: f32,
    pools: Vec<PoolInfo>,
    current: Option<usize>,
}

impl DescriptorPoolGrowable {
    pub fn new(
        category: DescriptorSetCategory,
        base_sets: u32,
        descriptors_per_set: u32,
        grow_factor: f32,
    ) -> Self {
        Self {
            category,
            base_sets,
            descriptors_per_set,
            grow_factor,
            pools: Vec::new(),
            current: None,
        }
    }

    /// Capacity of the `k`-th pool: `floor(base_sets * grow_factor^k)`.
    pub fn capacity_for(&self, k: usize) -> u32 {
        let exponent = i32::try_from(k).unwrap_or(i32::MAX);
        let capacity = f64::from(self.base_sets) * f64::from(self.grow_factor).powi(exponent);
        (capacity.floor() as u32).max(1)
    }

    #[inline]
    pub fn category(&self) -> DescriptorSetCategory {
        self.category
    }

    #[inline]
    pub fn pools(&self) -> &[PoolInfo] {
        &self.pools
    }

    #[inline]
    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Allocates a batch of `count` sets.
    ///
    /// Tries, in order: a pool with a released batch to reuse, a pool with
    /// enough remaining capacity, and finally exactly one new pool. The new
    /// pool is enlarged to the batch size when its geometric capacity is
    /// smaller.
    ///
    /// Returns the index of the pool the batch came from.
    ///
    /// # Errors
    ///
    /// Returns an error if pool creation or set allocation fails.
    pub fn allocate(
        &mut self,
        backend: &dyn GraphicsBackend,
        count: usize,
        stats: &RenderingStats,
    ) -> RhiResult<(usize, Vec<DescriptorSetHandle>)> {
        let needed = u32::try_from(count).unwrap_or(u32::MAX);

        let usable = |pool: &PoolInfo| !pool.unused_sets.is_empty() || pool.remaining_sets >= needed;
        let index = match self.current {
            Some(index) if usable(&self.pools[index]) => index,
            _ => self.select_pool(backend, needed, stats)?,
        };
        self.current = Some(index);

        let pool = &mut self.pools[index];
        if let Some(sets) = pool.unused_sets.pop_front() {
            debug_assert_eq!(sets.len(), count);
            return Ok((index, sets));
        }

        let sets = backend.allocate_descriptor_sets(pool.handle, self.category, count)?;
        pool.remaining_sets -= needed;
        Ok((index, sets))
    }

    fn select_pool(
        &mut self,
        backend: &dyn GraphicsBackend,
        needed: u32,
        stats: &RenderingStats,
    ) -> RhiResult<usize> {
        if let Some(index) = self.pools.iter().position(|p| !p.unused_sets.is_empty()) {
            return Ok(index);
        }
        if let Some(index) = self.pools.iter().position(|p| p.remaining_sets >= needed) {
            return Ok(index);
        }

        // A batch never spans pools, so a new pool holds at least one batch.
        let capacity = self.capacity_for(self.pools.len()).max(needed);

        let handle =
            backend.create_descriptor_pool(self.category, capacity, self.descriptors_per_set)?;
        stats.add_descriptor_pool();
        debug!(
            "Created {} descriptor pool #{} with capacity {}",
            self.category.name(),
            self.pools.len(),
            capacity
        );

        self.pools.push(PoolInfo {
            handle,
            capacity,
            remaining_sets: capacity,
            unused_sets: VecDeque::new(),
        });
        Ok(self.pools.len() - 1)
    }

    /// Queues a released batch for reuse by the pool it came from.
    pub fn release(&mut self, pool_index: usize, sets: Vec<DescriptorSetHandle>) {
        match self.pools.get_mut(pool_index) {
            Some(pool) => pool.unused_sets.push_back(sets),
            None => debug_assert!(false, "release into unknown pool {}", pool_index),
        }
    }

    fn take_resources(&mut self) -> impl Iterator<Item = GpuResource> + use<> {
        self.current = None;
        std::mem::take(&mut self.pools)
            .into_iter()
            .map(|pool| GpuResource::DescriptorPool(pool.handle))
    }
}

fn base_sets(sizes: DescriptorPoolSizes, category: DescriptorSetCategory) -> u32 {
    match category {
        DescriptorSetCategory::Global => sizes.global,
        DescriptorSetCategory::Layer => sizes.layer,
        DescriptorSetCategory::DrawableUniform => sizes.drawable_uniform,
        DescriptorSetCategory::DrawableImage => sizes.drawable_image,
    }
}

/// Growable pools for every category and thread slot.
pub struct DescriptorPools {
    /// Indexed by thread slot, then by category set index.
    slots: Vec<Vec<Mutex<DescriptorPoolGrowable>>>,
}

impl DescriptorPools {
    pub fn new(
        slot_count: usize,
        base: DescriptorPoolSizes,
        per_set: DescriptorPoolSizes,
        grow_factor: f32,
    ) -> Self {
        let slots = (0..slot_count)
            .map(|_| {
                DescriptorSetCategory::ALL
                    .iter()
                    .map(|&category| {
                        Mutex::new(DescriptorPoolGrowable::new(
                            category,
                            base_sets(base, category),
                            base_sets(per_set, category),
                            grow_factor,
                        ))
                    })
                    .collect()
            })
            .collect();
        Self { slots }
    }

    /// The pools of `category` owned by `thread_index`.
    pub fn get(
        &self,
        category: DescriptorSetCategory,
        thread_index: Option<usize>,
    ) -> &Mutex<DescriptorPoolGrowable> {
        let slot = thread_slot(thread_index).min(self.slots.len() - 1);
        &self.slots[slot][category.set_index() as usize]
    }

    /// Empties every pool list, returning the backend pools to destroy.
    pub(crate) fn take_resources(&mut self) -> Vec<GpuResource> {
        self.slots
            .iter_mut()
            .flatten()
            .flat_map(|pool| pool.get_mut().take_resources())
            .collect()
    }
}
