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

//! Index definitions and the in-memory ordered index.
//!
//! The `Index` trait is the contract the engine consumes; `MemIndex` is the
//! ordered reference implementation. Its snapshot iterator captures the full
//! ordered set of tuple handles at creation time, so the traversal is stable
//! against later mutation and safe to drain from the checkpoint writer
//! thread: the delayed-free discipline keeps every captured tuple's bytes
//! alive until the checkpoint finishes.

use std::collections::BTreeMap;

use rilldb_core::tuple_format::field_at;
use rilldb_core::{Result, RillError};

use crate::extent::{Extent, ExtentPool};
use crate::tuple::TupleRef;

/// Entries per extent of node storage held by a `MemIndex`.
const ENTRIES_PER_EXTENT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Tree,
    Hash,
}

/// One key part: which tuple field it indexes and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPartDef {
    pub field_no: u32,
    pub collation: u32,
    pub path: Option<String>,
}

impl KeyPartDef {
    pub fn field(field_no: u32) -> Self {
        Self {
            field_no,
            collation: 0,
            path: None,
        }
    }
}

/// Definition of one index of a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub index_id: u32,
    pub space_id: u32,
    pub name: String,
    pub index_type: IndexType,
    pub unique: bool,
    /// Backing function id for functional indexes, 0 for none.
    pub func_id: u32,
    pub parts: Vec<KeyPartDef>,
}

impl IndexDef {
    /// Whether changing this definition to `new` requires rebuilding the
    /// index from scratch. An alter that only renames, or that relaxes
    /// uniqueness, can reuse the existing structure.
    pub fn change_requires_rebuild(&self, new: &IndexDef) -> bool {
        if self.index_type != new.index_type {
            return true;
        }
        if !self.unique && new.unique {
            return true;
        }
        if self.func_id != new.func_id {
            return true;
        }
        if self.parts.len() != new.parts.len() {
            return true;
        }
        self.parts.iter().zip(&new.parts).any(|(old, new)| {
            old.field_no != new.field_no
                || old.collation != new.collation
                || old.path != new.path
        })
    }
}

/// Duplicate handling for `Index::replace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupPolicy {
    /// A conflicting tuple under the new key is an error.
    Insert,
    /// A conflicting tuple is displaced and returned.
    Replace,
}

/// Stable read-view over one index, drained by the checkpoint writer.
pub trait SnapshotIterator: Send {
    /// Next raw tuple body, or `None` at the end of the view.
    fn next(&mut self) -> Option<&[u8]>;
}

/// The index contract the engine consumes. Implementations allocate node
/// memory in extents from the pool handed to each mutating call; after an
/// `ExtentPool::reserve` covering the worst case, mutation cannot fail for
/// lack of memory.
pub trait Index: Send {
    fn def(&self) -> &IndexDef;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a tuple during bulk build. Duplicate detection is deferred to
    /// `end_build`.
    fn build_next(&mut self, pool: &mut ExtentPool, tuple: TupleRef) -> Result<()>;

    /// Finish a bulk build, surfacing duplicate keys.
    fn end_build(&mut self) -> Result<()>;

    /// Replace `old` with `new`; either may be absent (pure insert / pure
    /// delete). Returns the displaced tuple, if any.
    fn replace(
        &mut self,
        pool: &mut ExtentPool,
        old: Option<TupleRef>,
        new: Option<TupleRef>,
        dup: DupPolicy,
    ) -> Result<Option<TupleRef>>;

    fn get(&self, key: &[u8]) -> Option<TupleRef>;

    /// All tuples in index order. Used for bulk-building secondary keys.
    fn all(&self) -> Vec<TupleRef>;

    fn create_snapshot_iterator(&self) -> Box<dyn SnapshotIterator>;

    /// Hand over the node extents, e.g. to a GC task retiring this index.
    fn take_extents(&mut self) -> Vec<Extent>;
}

/// Extract the key of `tuple` under `def`: the indexed fields, each
/// length-prefixed so composite keys compare unambiguously.
pub fn extract_key(def: &IndexDef, tuple: TupleRef) -> Result<Vec<u8>> {
    let body = tuple.data();
    let mut key = Vec::new();
    for part in &def.parts {
        if part.field_no as usize >= tuple.field_map_len() {
            return Err(RillError::Format(format!(
                "tuple has no field {} required by index '{}'",
                part.field_no, def.name
            )));
        }
        let offset = tuple.field_map_at(part.field_no as usize);
        let field = field_at(body, offset)?;
        key.extend_from_slice(&(field.len() as u32).to_le_bytes());
        key.extend_from_slice(field);
    }
    Ok(key)
}

/// Encode a lookup key from its part values, matching `extract_key`.
pub fn key_from_parts(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::new();
    for part in parts {
        key.extend_from_slice(&(part.len() as u32).to_le_bytes());
        key.extend_from_slice(part);
    }
    key
}

/// Ordered in-memory index.
pub struct MemIndex {
    def: IndexDef,
    map: BTreeMap<Vec<u8>, TupleRef>,
    /// Pending bulk-build entries; `Some` between construction in a
    /// recovering space and `end_build`.
    build: Option<Vec<(Vec<u8>, TupleRef)>>,
    extents: Vec<Extent>,
}

impl MemIndex {
    /// Map key for `tuple`. Non-unique indexes extend the part key with the
    /// tuple identity so equal key values do not collide.
    fn entry_key(&self, tuple: TupleRef) -> Result<Vec<u8>> {
        let mut key = extract_key(&self.def, tuple)?;
        if !self.def.unique {
            key.extend_from_slice(&(tuple.addr() as u64).to_le_bytes());
        }
        Ok(key)
    }

    pub fn new(def: IndexDef) -> Self {
        Self {
            def,
            map: BTreeMap::new(),
            build: None,
            extents: Vec::new(),
        }
    }

    /// A new index in bulk-build mode, accepting `build_next` appends.
    pub fn for_build(def: IndexDef) -> Self {
        let mut index = Self::new(def);
        index.build = Some(Vec::new());
        index
    }

    fn grow_extents(&mut self, pool: &mut ExtentPool) -> Result<()> {
        while self.map.len() > self.extents.len() * ENTRIES_PER_EXTENT {
            let extent = pool.alloc().ok_or(RillError::OutOfMemory {
                requested: crate::extent::EXTENT_SIZE,
                what: "index extent",
            })?;
            self.extents.push(extent);
        }
        Ok(())
    }

    fn shrink_extents(&mut self, pool: &mut ExtentPool) {
        while self.extents.len() > 1
            && self.map.len() + ENTRIES_PER_EXTENT <= (self.extents.len() - 1) * ENTRIES_PER_EXTENT
        {
            if let Some(extent) = self.extents.pop() {
                pool.free(extent);
            }
        }
    }
}

impl Index for MemIndex {
    fn def(&self) -> &IndexDef {
        &self.def
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn build_next(&mut self, pool: &mut ExtentPool, tuple: TupleRef) -> Result<()> {
        let key = self.entry_key(tuple)?;
        let build = self
            .build
            .as_mut()
            .expect("build_next on an index not in build mode");
        build.push((key, tuple));
        if build.len() > self.extents.len() * ENTRIES_PER_EXTENT {
            let extent = pool.alloc().ok_or(RillError::OutOfMemory {
                requested: crate::extent::EXTENT_SIZE,
                what: "index extent",
            })?;
            self.extents.push(extent);
        }
        Ok(())
    }

    fn end_build(&mut self) -> Result<()> {
        let Some(mut build) = self.build.take() else {
            return Ok(());
        };
        build.sort_by(|a, b| a.0.cmp(&b.0));
        if self.def.unique {
            for pair in build.windows(2) {
                if pair[0].0 == pair[1].0 {
                    return Err(RillError::DuplicateKey {
                        space_id: self.def.space_id,
                        index_id: self.def.index_id,
                    });
                }
            }
        }
        self.map.extend(build);
        Ok(())
    }

    fn replace(
        &mut self,
        pool: &mut ExtentPool,
        old: Option<TupleRef>,
        new: Option<TupleRef>,
        dup: DupPolicy,
    ) -> Result<Option<TupleRef>> {
        debug_assert!(self.build.is_none(), "replace on an index in build mode");
        let mut displaced = None;

        if let Some(new) = new {
            let new_key = self.entry_key(new)?;
            if let Some(&existing) = self.map.get(&new_key) {
                let replaces_old = old.is_some_and(|o| o == existing);
                if dup == DupPolicy::Insert && !replaces_old {
                    return Err(RillError::DuplicateKey {
                        space_id: self.def.space_id,
                        index_id: self.def.index_id,
                    });
                }
                displaced = Some(existing);
            }
            if let Some(old) = old {
                let old_key = self.entry_key(old)?;
                if old_key != new_key {
                    self.map.remove(&old_key);
                }
            }
            self.map.insert(new_key, new);
            self.grow_extents(pool)?;
        } else if let Some(old) = old {
            let old_key = self.entry_key(old)?;
            displaced = self.map.remove(&old_key);
            self.shrink_extents(pool);
        }

        Ok(displaced)
    }

    fn get(&self, key: &[u8]) -> Option<TupleRef> {
        self.map.get(key).copied()
    }

    fn all(&self) -> Vec<TupleRef> {
        self.map.values().copied().collect()
    }

    fn create_snapshot_iterator(&self) -> Box<dyn SnapshotIterator> {
        Box::new(MemSnapshotIterator {
            tuples: self.map.values().copied().collect(),
            pos: 0,
        })
    }

    fn take_extents(&mut self) -> Vec<Extent> {
        std::mem::take(&mut self.extents)
    }
}

struct MemSnapshotIterator {
    tuples: Vec<TupleRef>,
    pos: usize,
}

impl SnapshotIterator for MemSnapshotIterator {
    fn next(&mut self) -> Option<&[u8]> {
        if self.pos >= self.tuples.len() {
            return None;
        }
        let i = self.pos;
        self.pos += 1;
        Some(self.tuples[i].data())
    }
}
