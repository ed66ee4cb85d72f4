//! Ordered layer groups and their distribution across encoding threads.
//!
//! Groups are kept sorted by [`LayerGroup::layer_index`]. A threaded visit
//! splits the sequence into one contiguous slice per worker thread: thread
//! `i` of `T` takes `[i * N / T, (i + 1) * N / T)`. Worker `i` records into
//! secondary buffer `i`, and the secondaries are executed in thread order,
//! so the merged commands keep layer order.

use std::collections::BTreeMap;
use std::ops::Range;

use parking_lot::Mutex;
use tracing::{debug, trace};

use maprender_scheduler::Scheduler;

use crate::error::{RenderError, RenderResult};
use crate::layer_group::LayerGroup;

/// Slice of a sequence of `len` items handled by `partition` of `count`.
pub fn partition_range(partition: usize, len: usize, count: usize) -> Range<usize> {
    debug_assert!(partition < count);
    partition * len / count..(partition + 1) * len / count
}

/// Visitor called for every group: `(group, thread_index, sequential_index)`.
///
/// The sequential index counts groups in layer order regardless of the
/// visiting direction; it does not match [`LayerGroup::layer_index`].
pub type GroupVisitor<'f> =
    dyn Fn(&mut dyn LayerGroup, Option<usize>, usize) -> RenderResult<()> + Sync + 'f;

/// Layer groups keyed by layer index. Groups with equal indices keep
/// insertion order.
#[derive(Default)]
pub struct LayerGroupMap {
    groups: BTreeMap<i32, Vec<Box<dyn LayerGroup>>>,
}

impl LayerGroupMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `group`. Returns `false`, dropping it, if a group with the same
    /// name is already present.
    pub fn add_layer_group(&mut self, group: Box<dyn LayerGroup>) -> bool {
        if self.contains(group.name()) {
            debug!("Layer group '{}' already present", group.name());
            return false;
        }
        self.groups
            .entry(group.layer_index())
            .or_default()
            .push(group);
        true
    }

    pub fn remove_layer_group(&mut self, name: &str) -> Option<Box<dyn LayerGroup>> {
        let (&index, position) = self.groups.iter().find_map(|(index, groups)| {
            groups
                .iter()
                .position(|group| group.name() == name)
                .map(|position| (index, position))
        })?;
        let bucket = self.groups.get_mut(&index)?;
        let group = bucket.remove(position);
        if bucket.is_empty() {
            self.groups.remove(&index);
        }
        Some(group)
    }

    /// Moves a group to a new layer index, after any groups already there.
    /// The group must report `layer_index` itself after the move.
    pub fn update_layer_index(&mut self, name: &str) -> bool {
        match self.remove_layer_group(name) {
            Some(group) => self.add_layer_group(group),
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|group| group.name() == name)
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Groups in layer order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn LayerGroup> {
        self.groups.values().flatten().map(|group| group.as_ref())
    }

    /// Mutable groups in layer order, or reversed.
    pub fn groups_mut(&mut self, reversed: bool) -> Vec<&mut dyn LayerGroup> {
        let mut groups: Vec<&mut dyn LayerGroup> = self
            .groups
            .values_mut()
            .flatten()
            .map(|group| group.as_mut() as &mut dyn LayerGroup)
            .collect();
        if reversed {
            groups.reverse();
        }
        groups
    }

    pub fn visit_layer_groups(
        &mut self,
        reversed: bool,
        mut f: impl FnMut(&mut dyn LayerGroup, usize),
    ) {
        for (index, group) in self.groups_mut(reversed).into_iter().enumerate() {
            f(group, index);
        }
    }

    /// Runs `f` on every group, spreading contiguous slices across the
    /// scheduler's threads. Runs serially on the calling thread with a
    /// `None` thread index when there is no scheduler.
    ///
    /// With `reverse_threads`, worker `t` takes slice `T - t - 1` and
    /// records under that slice's thread index, so each group moves to a
    /// different worker than on the previous frame while the merged order
    /// is unchanged.
    ///
    /// # Errors
    ///
    /// Returns the first error `f` returned. Other slices still run to
    /// completion.
    pub fn visit_layer_groups_threaded(
        &mut self,
        scheduler: Option<&dyn Scheduler>,
        reversed: bool,
        reverse_threads: bool,
        f: &GroupVisitor<'_>,
    ) -> RenderResult<()> {
        let len = self.len();
        if len == 0 {
            return Ok(());
        }
        let sequential = |i: usize| if reversed { len - i - 1 } else { i };

        let Some(scheduler) = scheduler.filter(|s| s.thread_count() > 0) else {
            for (i, group) in self.groups_mut(reversed).into_iter().enumerate() {
                f(group, None, sequential(i))?;
            }
            return Ok(());
        };

        let threads = scheduler.thread_count();
        let mut groups = self.groups_mut(reversed);
        let mut slices = Vec::with_capacity(threads);
        let mut rest: &mut [&mut dyn LayerGroup] = &mut groups;
        for partition in 0..threads {
            let range = partition_range(partition, len, threads);
            let (slice, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
            slices.push(Mutex::new((range.start, slice)));
            rest = tail;
        }

        let error: Mutex<Option<RenderError>> = Mutex::new(None);
        scheduler.each_thread(&|worker| {
            let thread_index = if reverse_threads {
                threads - worker - 1
            } else {
                worker
            };
            let Some(slice) = slices.get(thread_index) else {
                return;
            };
            let mut slice = slice.lock();
            let (start, groups) = &mut *slice;
            let start = *start;
            trace!(
                "Thread {} visiting {} group(s) from {}",
                thread_index,
                groups.len(),
                start
            );
            for (offset, group) in groups.iter_mut().enumerate() {
                if let Err(e) = f(&mut **group, Some(thread_index), sequential(start + offset)) {
                    error.lock().get_or_insert(e);
                    return;
                }
            }
        });

        match error.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
