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

//! Extent pool for index internals.
//!
//! Index structures allocate their node memory in fixed 16 KiB extents
//! carved out of arena slabs. Rebalancing must not fail once it has started
//! mutating the index, so callers compute their worst-case extent demand,
//! call `reserve`, and only then mutate: after a successful `reserve(n)` the
//! next `n` `alloc` calls are guaranteed to succeed from the reserved list
//! without consulting the underlying pool.

use std::ptr::NonNull;

use crate::arena::{SlabCache, SLAB_SIZE};

/// Size of one index extent.
pub const EXTENT_SIZE: usize = 16 * 1024;

const EXTENTS_PER_SLAB: usize = SLAB_SIZE / EXTENT_SIZE;

/// A 16 KiB block owned by an index (or by a GC task holding a retired
/// index's memory until it may be released).
#[derive(Debug)]
pub struct Extent(pub(crate) NonNull<u8>);

// Extents are opaque blocks; only one owner touches them at a time.
unsafe impl Send for Extent {}

/// Fixed-size extent pool with a pre-reservation list.
pub struct ExtentPool {
    cache: SlabCache,
    free: Vec<NonNull<u8>>,
    reserved: Vec<NonNull<u8>>,
    used_extents: u64,
}

impl ExtentPool {
    pub fn new(cache: SlabCache) -> Self {
        Self {
            cache,
            free: Vec::new(),
            reserved: Vec::new(),
            used_extents: 0,
        }
    }

    fn refill(&mut self) -> bool {
        let Some(slab) = self.cache.alloc_slab() else {
            return false;
        };
        for i in 0..EXTENTS_PER_SLAB {
            let ptr = unsafe { slab.as_ptr().add(i * EXTENT_SIZE) };
            self.free.push(NonNull::new(ptr).expect("offset into a non-null slab"));
        }
        true
    }

    /// Move extents onto the reserved list until it holds at least `n`.
    /// Returns false when the pool cannot grow; the caller may run GC and
    /// retry.
    pub fn reserve(&mut self, n: usize) -> bool {
        while self.reserved.len() < n {
            if let Some(ptr) = self.free.pop() {
                self.reserved.push(ptr);
                continue;
            }
            if !self.refill() {
                return false;
            }
        }
        true
    }

    /// Allocate one extent, preferring the reserved list.
    pub fn alloc(&mut self) -> Option<Extent> {
        let ptr = self
            .reserved
            .pop()
            .or_else(|| self.free.pop())
            .or_else(|| {
                if self.refill() {
                    self.free.pop()
                } else {
                    None
                }
            })?;
        self.used_extents += 1;
        Some(Extent(ptr))
    }

    /// Return an extent to the underlying pool.
    pub fn free(&mut self, extent: Extent) {
        debug_assert!(self.used_extents > 0);
        self.used_extents -= 1;
        self.free.push(extent.0);
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_extents * EXTENT_SIZE as u64
    }
}

unsafe impl Send for ExtentPool {}
