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

//! Byte quota and the slab arena.
//!
//! The quota is a plain byte counter fronting the arena; it owns no policy.
//! The arena hands out fixed 16 MiB slabs carved from the global allocator.
//! Slabs returned by a consumer go on a free list and are reused before any
//! new quota is charged; backing memory is released only when the arena is
//! dropped. Two independent slab caches (tuple data and index extents) share
//! one arena, so the arena interior sits behind a mutex.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Size of one arena slab.
pub const SLAB_SIZE: usize = 16 * 1024 * 1024;

const SLAB_ALIGN: usize = 4096;

/// Byte-counting quota over the arena.
#[derive(Debug)]
pub struct Quota {
    limit: AtomicU64,
    used: AtomicU64,
}

impl Quota {
    pub fn new(limit: u64) -> Self {
        Self {
            limit: AtomicU64::new(limit),
            used: AtomicU64::new(0),
        }
    }

    pub fn total(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Charge `bytes` against the quota. Fails without side effects when the
    /// limit would be exceeded.
    pub fn charge(&self, bytes: u64) -> bool {
        loop {
            let used = self.used.load(Ordering::Relaxed);
            let Some(next) = used.checked_add(bytes) else {
                return false;
            };
            if next > self.limit.load(Ordering::Relaxed) {
                return false;
            }
            if self
                .used
                .compare_exchange_weak(used, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Raw slab pointer. Slab memory is plain bytes owned by the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabPtr(pub(crate) NonNull<u8>);

impl SlabPtr {
    pub(crate) fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

// Slab memory is handed out to exactly one consumer at a time; the arena
// itself never dereferences it.
unsafe impl Send for SlabPtr {}

struct ArenaInner {
    /// Every slab ever allocated, for deallocation on drop.
    blocks: Vec<SlabPtr>,
    /// Slabs returned by consumers, reused before charging new quota.
    free: Vec<SlabPtr>,
}

/// Arena of fixed-size slabs charged against a shared quota.
pub struct SlabArena {
    quota: Arc<Quota>,
    inner: Mutex<ArenaInner>,
}

impl SlabArena {
    pub fn new(quota: Arc<Quota>) -> Arc<Self> {
        Arc::new(Self {
            quota,
            inner: Mutex::new(ArenaInner {
                blocks: Vec::new(),
                free: Vec::new(),
            }),
        })
    }

    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// Pop a free slab or carve a new one. `None` means the quota is
    /// exhausted or the system allocator failed.
    pub fn alloc_slab(&self) -> Option<SlabPtr> {
        let mut inner = self.inner.lock();
        if let Some(slab) = inner.free.pop() {
            return Some(slab);
        }
        if !self.quota.charge(SLAB_SIZE as u64) {
            return None;
        }
        let layout = Layout::from_size_align(SLAB_SIZE, SLAB_ALIGN).expect("static slab layout");
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            self.quota.release(SLAB_SIZE as u64);
            return None;
        };
        let slab = SlabPtr(ptr);
        inner.blocks.push(slab);
        Some(slab)
    }

    /// Return a slab to the free list. The quota stays charged: the memory
    /// is retained for reuse, not returned to the system.
    pub fn free_slab(&self, slab: SlabPtr) {
        self.inner.lock().free.push(slab);
    }
}

impl Drop for SlabArena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let layout = Layout::from_size_align(SLAB_SIZE, SLAB_ALIGN).expect("static slab layout");
        let count = inner.blocks.len() as u64;
        for slab in inner.blocks.drain(..) {
            unsafe { dealloc(slab.as_ptr(), layout) };
        }
        self.quota.release(count * SLAB_SIZE as u64);
    }
}

unsafe impl Send for SlabArena {}
unsafe impl Sync for SlabArena {}

/// A per-consumer view over the shared arena, tracking how many slabs the
/// consumer holds.
pub struct SlabCache {
    arena: Arc<SlabArena>,
    held_slabs: u64,
}

impl SlabCache {
    pub fn new(arena: Arc<SlabArena>) -> Self {
        Self {
            arena,
            held_slabs: 0,
        }
    }

    pub fn alloc_slab(&mut self) -> Option<SlabPtr> {
        let slab = self.arena.alloc_slab()?;
        self.held_slabs += 1;
        Some(slab)
    }

    pub fn free_slab(&mut self, slab: SlabPtr) {
        debug_assert!(self.held_slabs > 0);
        self.held_slabs -= 1;
        self.arena.free_slab(slab);
    }

    pub fn held_bytes(&self) -> u64 {
        self.held_slabs * SLAB_SIZE as u64
    }
}
