// SPDX-License-Identifier: AGPL-3.0-or-later
// RillDB - In-Memory Transactional Storage Engine
// Copyright (C) 2026 RillDB Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Cooperative garbage collection of retired index memory.
//!
//! Dropping a large index cannot release everything at once without stalling
//! the database task, so retirement is packaged as a task that runs one
//! bounded step at a time. A finished task is destroyed immediately - unless
//! a checkpoint is in flight, in which case the checkpoint writer may still
//! be reading through the retired structure, and the task parks on a
//! "to-free" list that drains after the checkpoint commits.

use std::collections::VecDeque;

use rilldb_core::FormatRegistry;

use crate::extent::{Extent, ExtentPool};
use crate::small::SmallAlloc;
use crate::tuple::{drop_tuple, TupleRef};

/// Tuples unreferenced per GC step.
const GC_STEP_TUPLES: usize = 1024;

/// Mutable engine state a GC task may touch.
pub struct GcContext<'a> {
    pub alloc: &'a mut SmallAlloc,
    pub extents: &'a mut ExtentPool,
    pub formats: &'a mut FormatRegistry,
    pub generation: u32,
}

/// A unit of deferred reclamation work.
pub trait GcTask: Send {
    /// Perform one bounded step; return true when no work remains.
    fn run_step(&mut self, ctx: &mut GcContext<'_>) -> bool;

    /// Release whatever the task still holds. Called only after `run_step`
    /// reported done, and deferred past an in-flight checkpoint.
    fn free(self: Box<Self>, ctx: &mut GcContext<'_>);
}

/// Retirement of one dropped index: unreference its tuples step by step,
/// then give the node extents back to the pool.
pub struct DroppedIndexTask {
    /// Tuples owned by the retired structure. Empty when a secondary index
    /// is dropped (the primary still owns the tuples).
    tuples: Vec<TupleRef>,
    extents: Vec<Extent>,
}

impl DroppedIndexTask {
    pub fn new(tuples: Vec<TupleRef>, extents: Vec<Extent>) -> Self {
        Self { tuples, extents }
    }
}

impl GcTask for DroppedIndexTask {
    fn run_step(&mut self, ctx: &mut GcContext<'_>) -> bool {
        let n = self.tuples.len().min(GC_STEP_TUPLES);
        for tuple in self.tuples.drain(self.tuples.len() - n..) {
            if tuple.ref_dec() == 0 {
                drop_tuple(ctx.alloc, ctx.formats, ctx.generation, tuple);
            }
        }
        self.tuples.is_empty()
    }

    fn free(self: Box<Self>, ctx: &mut GcContext<'_>) {
        for extent in self.extents {
            ctx.extents.free(extent);
        }
    }
}

/// GC queues: pending tasks plus tasks finished during a checkpoint.
#[derive(Default)]
pub struct GcState {
    queue: VecDeque<Box<dyn GcTask>>,
    to_free: Vec<Box<dyn GcTask>>,
}

impl GcState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, task: Box<dyn GcTask>) {
        self.queue.push_back(task);
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn deferred_count(&self) -> usize {
        self.to_free.len()
    }

    /// Run one iteration of garbage collection. Returns true when there is
    /// nothing left to do and the worker may sleep.
    pub fn run_step(&mut self, ctx: &mut GcContext<'_>, checkpoint_in_flight: bool) -> bool {
        let Some(task) = self.queue.front_mut() else {
            return true;
        };
        if task.run_step(ctx) {
            let task = self.queue.pop_front().expect("front task exists");
            // The checkpoint writer may still read through the retired
            // structure; postpone the release until the checkpoint is done.
            if checkpoint_in_flight {
                self.to_free.push(task);
            } else {
                task.free(ctx);
            }
        }
        false
    }

    /// Release every task withheld during the checkpoint.
    pub fn drain_after_checkpoint(&mut self, ctx: &mut GcContext<'_>) {
        for task in self.to_free.drain(..) {
            task.free(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Quota, SlabArena, SlabCache, SLAB_SIZE};
    use std::sync::Arc;

    fn make_parts() -> (SmallAlloc, ExtentPool, FormatRegistry) {
        let quota = Arc::new(Quota::new(4 * SLAB_SIZE as u64));
        let arena = SlabArena::new(quota);
        let alloc = SmallAlloc::new(SlabCache::new(arena.clone()), 16, 1.5, 1024 * 1024);
        let pool = ExtentPool::new(SlabCache::new(arena));
        (alloc, pool, FormatRegistry::new())
    }

    #[test]
    fn test_idle_queue_reports_stop() {
        let (mut alloc, mut pool, mut formats) = make_parts();
        let mut gc = GcState::new();
        let mut ctx = GcContext {
            alloc: &mut alloc,
            extents: &mut pool,
            formats: &mut formats,
            generation: 0,
        };
        assert!(gc.run_step(&mut ctx, false));
    }

    #[test]
    fn test_extents_freed_immediately_without_checkpoint() {
        let (mut alloc, mut pool, mut formats) = make_parts();
        let extents = vec![pool.alloc().unwrap(), pool.alloc().unwrap()];
        assert_eq!(pool.used_bytes(), 2 * crate::extent::EXTENT_SIZE as u64);

        let mut gc = GcState::new();
        gc.schedule(Box::new(DroppedIndexTask::new(Vec::new(), extents)));

        let mut ctx = GcContext {
            alloc: &mut alloc,
            extents: &mut pool,
            formats: &mut formats,
            generation: 0,
        };
        assert!(!gc.run_step(&mut ctx, false));
        assert!(gc.run_step(&mut ctx, false));
        assert_eq!(ctx.extents.used_bytes(), 0);
    }

    #[test]
    fn test_release_deferred_across_checkpoint() {
        let (mut alloc, mut pool, mut formats) = make_parts();
        let extents = vec![pool.alloc().unwrap()];

        let mut gc = GcState::new();
        gc.schedule(Box::new(DroppedIndexTask::new(Vec::new(), extents)));

        let mut ctx = GcContext {
            alloc: &mut alloc,
            extents: &mut pool,
            formats: &mut formats,
            generation: 0,
        };
        gc.run_step(&mut ctx, true);
        assert_eq!(gc.deferred_count(), 1);
        assert_eq!(ctx.extents.used_bytes(), crate::extent::EXTENT_SIZE as u64);

        gc.drain_after_checkpoint(&mut ctx);
        assert_eq!(gc.deferred_count(), 0);
        assert_eq!(ctx.extents.used_bytes(), 0);
    }
}
