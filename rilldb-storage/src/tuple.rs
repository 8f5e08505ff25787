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

//! Tuple layout and the tuple free discipline.
//!
//! A tuple lives in one small-allocator slot:
//!
//! ```text
//! [TupleHeader] [field map: u32 x field_count] [raw body bytes]
//! ```
//!
//! The header's generation stamp is the engine's snapshot generation at the
//! instant of allocation. A tuple whose generation is older than the current
//! one may still be read by an in-flight checkpoint, so its free must go
//! through the delayed queue; a tuple of the current generation was
//! allocated after the checkpoint began and can never be visible to it.
//!
//! Tuples are shared by the indexes of one space through a plain reference
//! count mutated only on the database task. The checkpoint writer thread
//! reads tuple bytes but never touches headers.

use std::ptr::NonNull;

use rilldb_core::tuple_format::{build_field_map, FormatId, FormatRegistry};
use rilldb_core::{Result, RillError};

use crate::small::{FreeMode, SmallAlloc};

/// Fixed tuple header. `data_offset` is the byte offset of the raw body from
/// the start of the header; the field map fills the gap.
#[repr(C)]
pub struct TupleHeader {
    pub generation: u32,
    pub refs: u32,
    pub bsize: u32,
    pub format_id: FormatId,
    pub data_offset: u16,
}

const HEADER_SIZE: usize = std::mem::size_of::<TupleHeader>();

/// Handle to an allocated tuple. Copyable; validity is governed by the
/// engine's refcount and delayed-free discipline, not by the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleRef(NonNull<TupleHeader>);

// Read-views hand TupleRefs to the checkpoint writer thread, which only
// reads payload bytes. Header mutation stays on the database task.
unsafe impl Send for TupleRef {}
unsafe impl Sync for TupleRef {}

impl TupleRef {
    fn header(&self) -> &TupleHeader {
        unsafe { self.0.as_ref() }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut TupleHeader {
        unsafe { &mut *self.0.as_ptr() }
    }

    pub fn generation(&self) -> u32 {
        self.header().generation
    }

    pub fn refs(&self) -> u32 {
        self.header().refs
    }

    pub fn bsize(&self) -> u32 {
        self.header().bsize
    }

    pub fn format_id(&self) -> FormatId {
        self.header().format_id
    }

    /// Total slot size of this tuple.
    pub fn total_size(&self) -> usize {
        self.header().data_offset as usize + self.header().bsize as usize
    }

    /// Raw serialized body.
    pub fn data(&self) -> &[u8] {
        let h = self.header();
        unsafe {
            let base = self.0.as_ptr().cast::<u8>();
            std::slice::from_raw_parts(base.add(h.data_offset as usize), h.bsize as usize)
        }
    }

    /// Number of entries in the field map.
    pub fn field_map_len(&self) -> usize {
        (self.header().data_offset as usize - HEADER_SIZE) / 4
    }

    /// Field-map entry `i`: offset of the i-th field inside the body.
    pub fn field_map_at(&self, i: usize) -> u32 {
        debug_assert!(i < self.field_map_len());
        unsafe {
            let base = self.0.as_ptr().cast::<u8>().add(HEADER_SIZE);
            let slot = base.add(i * 4).cast::<u32>();
            slot.read_unaligned()
        }
    }

    /// Stable identity of the tuple while it is allocated.
    pub(crate) fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    pub(crate) fn ref_inc(&self) {
        self.header_mut().refs += 1;
    }

    pub(crate) fn ref_dec(&self) -> u32 {
        let h = self.header_mut();
        debug_assert!(h.refs > 0);
        h.refs -= 1;
        h.refs
    }
}

/// Total slot size for a tuple with the given field map and body lengths.
pub fn tuple_total_size(field_map_len: usize, body_len: usize) -> usize {
    HEADER_SIZE + field_map_len * 4 + body_len
}

/// Build a tuple inside `slot`, which must span at least the total size.
///
/// Returns the tuple with a zero reference count; the caller owns the format
/// reference it retained for it.
pub(crate) fn init_tuple(
    slot: NonNull<u8>,
    generation: u32,
    format_id: FormatId,
    field_map: &[u32],
    body: &[u8],
) -> TupleRef {
    let data_offset = (HEADER_SIZE + field_map.len() * 4) as u16;
    unsafe {
        let header = slot.as_ptr().cast::<TupleHeader>();
        header.write(TupleHeader {
            generation,
            refs: 0,
            bsize: body.len() as u32,
            format_id,
            data_offset,
        });
        let map_base = slot.as_ptr().add(HEADER_SIZE).cast::<u32>();
        for (i, &off) in field_map.iter().enumerate() {
            map_base.add(i).write_unaligned(off);
        }
        let data = slot.as_ptr().add(data_offset as usize);
        std::ptr::copy_nonoverlapping(body.as_ptr(), data, body.len());
    }
    TupleRef(NonNull::new(slot.as_ptr().cast()).expect("slot is non-null"))
}

/// Validate a raw body against `max_tuple_size` and compute its field map.
/// The returned pair is (field map, total slot size).
pub(crate) fn prepare_tuple(body: &[u8], max_tuple_size: usize) -> Result<(Vec<u32>, usize)> {
    let field_map = build_field_map(body)?;
    let total = tuple_total_size(field_map.len(), body.len());
    if total > max_tuple_size {
        return Err(RillError::TupleTooLarge {
            size: total,
            max: max_tuple_size,
        });
    }
    Ok((field_map, total))
}

/// Release a tuple whose reference count has reached zero.
///
/// Invariant: the free is immediate iff the allocator is in immediate mode,
/// or the tuple carries the current generation, or its format is temporary;
/// otherwise the slot is queued until the checkpoint finishes.
pub(crate) fn drop_tuple(
    alloc: &mut SmallAlloc,
    formats: &mut FormatRegistry,
    current_generation: u32,
    tuple: TupleRef,
) {
    debug_assert_eq!(tuple.refs(), 0);
    let format_id = tuple.format_id();
    formats.release(format_id);
    let total = tuple.total_size();
    let ptr = NonNull::new(tuple.0.as_ptr().cast::<u8>()).expect("tuple slot is non-null");
    if alloc.free_mode() != FreeMode::Delayed
        || tuple.generation() == current_generation
        || formats.is_temporary(format_id)
    {
        alloc.free(ptr, total);
    } else {
        alloc.free_delayed(ptr, total);
    }
}

/// Header of a tuple-associated auxiliary chunk.
#[repr(C)]
struct ChunkHeader {
    data_sz: u32,
}

const CHUNK_HEADER_SIZE: usize = std::mem::size_of::<ChunkHeader>();

/// Handle to a tuple-associated auxiliary chunk.
#[derive(Debug, Clone, Copy)]
pub struct TupleChunk(NonNull<u8>);

impl TupleChunk {
    pub fn data(&self) -> &[u8] {
        unsafe {
            let slot = self.0.as_ptr().sub(CHUNK_HEADER_SIZE);
            let data_sz = slot.cast::<ChunkHeader>().read().data_sz as usize;
            std::slice::from_raw_parts(self.0.as_ptr(), data_sz)
        }
    }
}

unsafe impl Send for TupleChunk {}

/// Allocate an auxiliary chunk holding a copy of `data`. Chunks are freed
/// immediately; they never enter a read-view.
pub(crate) fn make_chunk(alloc: &mut SmallAlloc, data: &[u8]) -> Option<TupleChunk> {
    let total = CHUNK_HEADER_SIZE + data.len();
    let slot = alloc.alloc(total)?;
    unsafe {
        slot.as_ptr().cast::<ChunkHeader>().write(ChunkHeader {
            data_sz: data.len() as u32,
        });
        let dst = slot.as_ptr().add(CHUNK_HEADER_SIZE);
        std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        NonNull::new(dst).map(TupleChunk)
    }
}

/// Free a chunk previously returned by `make_chunk`.
pub(crate) fn drop_chunk(alloc: &mut SmallAlloc, chunk: TupleChunk) {
    unsafe {
        let slot = chunk.0.as_ptr().sub(CHUNK_HEADER_SIZE);
        let data_sz = slot.cast::<ChunkHeader>().read().data_sz as usize;
        let ptr = NonNull::new(slot).expect("chunk slot is non-null");
        alloc.free(ptr, CHUNK_HEADER_SIZE + data_sz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Quota, SlabArena, SlabCache, SLAB_SIZE};
    use rilldb_core::tuple_format::encode_fields;
    use std::sync::Arc;

    fn make_alloc() -> SmallAlloc {
        let quota = Arc::new(Quota::new(2 * SLAB_SIZE as u64));
        let arena = SlabArena::new(quota);
        SmallAlloc::new(SlabCache::new(arena), 16, 1.5, 1024 * 1024)
    }

    fn new_tuple(alloc: &mut SmallAlloc, formats: &mut FormatRegistry, generation: u32) -> TupleRef {
        let body = encode_fields(&[b"key".as_slice(), b"value".as_slice()]);
        let (map, total) = prepare_tuple(&body, 1024 * 1024).unwrap();
        let slot = alloc.alloc(total).unwrap();
        let fmt = formats.register(false);
        formats.retain(fmt);
        init_tuple(slot, generation, fmt, &map, &body)
    }

    #[test]
    fn test_tuple_layout_roundtrip() {
        let mut alloc = make_alloc();
        let mut formats = FormatRegistry::new();
        let body = encode_fields(&[b"alpha".as_slice(), b"beta".as_slice()]);
        let (map, total) = prepare_tuple(&body, 1024 * 1024).unwrap();
        let slot = alloc.alloc(total).unwrap();
        let fmt = formats.register(false);
        formats.retain(fmt);
        let t = init_tuple(slot, 7, fmt, &map, &body);

        assert_eq!(t.generation(), 7);
        assert_eq!(t.refs(), 0);
        assert_eq!(t.data(), &body[..]);
        assert_eq!(t.field_map_at(0), map[0]);
        assert_eq!(t.field_map_at(1), map[1]);
        assert_eq!(t.total_size(), total);
    }

    #[test]
    fn test_too_large_tuple_rejected() {
        let big = [0u8; 4096];
        let body = encode_fields(&[big.as_slice()]);
        let err = prepare_tuple(&body, 1024).unwrap_err();
        assert!(matches!(err, RillError::TupleTooLarge { .. }));
    }

    #[test]
    fn test_drop_current_generation_is_immediate() {
        let mut alloc = make_alloc();
        let mut formats = FormatRegistry::new();
        let t = new_tuple(&mut alloc, &mut formats, 3);

        alloc.set_free_mode(FreeMode::Delayed);
        // Same generation as "current": freed at once even in delayed mode.
        drop_tuple(&mut alloc, &mut formats, 3, t);
        assert_eq!(alloc.stats().delayed, 0);
        alloc.set_free_mode(FreeMode::Immediate);
    }

    #[test]
    fn test_drop_old_generation_is_delayed() {
        let mut alloc = make_alloc();
        let mut formats = FormatRegistry::new();
        let t = new_tuple(&mut alloc, &mut formats, 3);

        alloc.set_free_mode(FreeMode::Delayed);
        drop_tuple(&mut alloc, &mut formats, 4, t);
        assert_eq!(alloc.stats().delayed, 1);
        // Bytes stay readable until the queue drains.
        assert_eq!(t.generation(), 3);
        alloc.set_free_mode(FreeMode::Immediate);
        assert_eq!(alloc.stats().delayed, 0);
    }

    #[test]
    fn test_refcount() {
        let mut alloc = make_alloc();
        let mut formats = FormatRegistry::new();
        let t = new_tuple(&mut alloc, &mut formats, 0);
        t.ref_inc();
        t.ref_inc();
        assert_eq!(t.refs(), 2);
        assert_eq!(t.ref_dec(), 1);
        assert_eq!(t.ref_dec(), 0);
        drop_tuple(&mut alloc, &mut formats, 0, t);
    }

    #[test]
    fn test_chunk_roundtrip() {
        let mut alloc = make_alloc();
        let data = b"auxiliary payload";
        let chunk = make_chunk(&mut alloc, data).unwrap();
        assert_eq!(chunk.data(), data);
        drop_chunk(&mut alloc, chunk);
        assert_eq!(alloc.stats().used, 0);
    }
}
