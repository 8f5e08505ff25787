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

//! Small-object allocator over the tuple slab cache.
//!
//! Objects are grouped into size classes growing geometrically from the
//! configured minimum (rounded up to 16 bytes). Each class bump-allocates
//! slots out of 16 MiB arena slabs and recycles freed slots through a
//! per-class free list.
//!
//! The allocator has two free modes. In *immediate* mode a freed slot is
//! recycled at once. In *delayed* mode - entered for the duration of a
//! checkpoint - frees are queued and the slots stay intact until the
//! allocator returns to immediate mode, at which point the queue drains in
//! bulk. Callers that know an object cannot be visible to the running
//! snapshot free it with `free` even in delayed mode.

use std::ptr::NonNull;

use crate::arena::{SlabCache, SlabPtr, SLAB_SIZE};

/// Granularity of size classes and slot alignment.
pub const OBJSIZE_ALIGN: usize = 16;

/// Free-mode of the allocator; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeMode {
    Immediate,
    Delayed,
}

fn round_up(size: usize) -> usize {
    (size + OBJSIZE_ALIGN - 1) & !(OBJSIZE_ALIGN - 1)
}

/// Geometric size-class table: `classes[i]` is the slot size of class `i`.
fn build_classes(objsize_min: usize, factor: f64, objsize_max: usize) -> Vec<usize> {
    let mut classes = Vec::new();
    let mut size = round_up(objsize_min.max(OBJSIZE_ALIGN));
    while size < objsize_max {
        classes.push(size);
        let grown = (size as f64 * factor) as usize;
        size = round_up(grown.max(size + OBJSIZE_ALIGN));
    }
    classes.push(round_up(objsize_max));
    classes
}

struct SizeClass {
    /// Slot size of this class.
    size: usize,
    /// Recycled slots.
    free: Vec<NonNull<u8>>,
    /// Slab currently being bump-allocated, with the next free offset.
    bump: Option<(SlabPtr, usize)>,
    /// All slabs owned by this class.
    slabs: Vec<SlabPtr>,
}

impl SizeClass {
    fn new(size: usize) -> Self {
        Self {
            size,
            free: Vec::new(),
            bump: None,
            slabs: Vec::new(),
        }
    }

    fn alloc(&mut self, cache: &mut SlabCache) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.free.pop() {
            return Some(ptr);
        }
        if let Some((slab, offset)) = self.bump {
            if offset + self.size <= SLAB_SIZE {
                self.bump = Some((slab, offset + self.size));
                return NonNull::new(unsafe { slab.as_ptr().add(offset) });
            }
        }
        let slab = cache.alloc_slab()?;
        self.slabs.push(slab);
        self.bump = Some((slab, self.size));
        NonNull::new(slab.as_ptr())
    }
}

/// Allocator statistics, by class and in total.
#[derive(Debug, Clone, Default)]
pub struct SmallStats {
    /// Bytes handed out to live objects.
    pub used: u64,
    /// Bytes held in slabs by the allocator.
    pub total: u64,
    /// Objects sitting on the delayed-free queue.
    pub delayed: usize,
}

/// Size-class allocator with a snapshot-aware delayed-free queue.
pub struct SmallAlloc {
    cache: SlabCache,
    classes: Vec<SizeClass>,
    mode: FreeMode,
    delayed: Vec<(NonNull<u8>, usize)>,
    used: u64,
}

impl SmallAlloc {
    pub fn new(cache: SlabCache, objsize_min: usize, factor: f64, objsize_max: usize) -> Self {
        let classes = build_classes(objsize_min, factor, objsize_max)
            .into_iter()
            .map(SizeClass::new)
            .collect();
        Self {
            cache,
            classes,
            mode: FreeMode::Immediate,
            delayed: Vec::new(),
            used: 0,
        }
    }

    fn class_for(&self, size: usize) -> Option<usize> {
        let idx = self.classes.partition_point(|c| c.size < size);
        (idx < self.classes.len()).then_some(idx)
    }

    /// Allocate `size` bytes. `None` means the arena quota is exhausted.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let idx = self.class_for(size)?;
        let ptr = self.classes[idx].alloc(&mut self.cache)?;
        self.used += self.classes[idx].size as u64;
        Some(ptr)
    }

    /// Release a slot immediately, regardless of mode.
    pub fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        let idx = self.class_for(size).expect("freeing an object of unknown size class");
        self.used -= self.classes[idx].size as u64;
        self.classes[idx].free.push(ptr);
    }

    /// Release a slot, honoring the current free mode. In delayed mode the
    /// slot is queued and its bytes stay readable until the queue drains.
    pub fn free_delayed(&mut self, ptr: NonNull<u8>, size: usize) {
        match self.mode {
            FreeMode::Immediate => self.free(ptr, size),
            FreeMode::Delayed => self.delayed.push((ptr, size)),
        }
    }

    pub fn free_mode(&self) -> FreeMode {
        self.mode
    }

    /// Switch free mode. Leaving delayed mode drains the queue in bulk.
    pub fn set_free_mode(&mut self, mode: FreeMode) {
        if self.mode == FreeMode::Delayed && mode == FreeMode::Immediate {
            let delayed = std::mem::take(&mut self.delayed);
            for (ptr, size) in delayed {
                self.free(ptr, size);
            }
        }
        self.mode = mode;
    }

    pub fn stats(&self) -> SmallStats {
        SmallStats {
            used: self.used,
            total: self.cache.held_bytes(),
            delayed: self.delayed.len(),
        }
    }
}

// Slot pointers are handed to the database task only; the allocator itself
// never runs on the writer thread.
unsafe impl Send for SmallAlloc {}
