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

//! Spaces: named tuple collections with one primary and optional secondary
//! indexes.
//!
//! The replace behavior of a space tracks its recovery progress. A space
//! created during snapshot replay starts with no built keys and bulk-appends
//! into the primary; after replay the primary is finalized and WAL rows go
//! through the primary key only; once secondary keys are built in bulk the
//! space replaces through all keys. The mode also drives statement rollback,
//! which must revert exactly the indexes a replace touched.

use rilldb_core::tuple_format::FormatId;
use rilldb_core::Result;
use tracing::info;

use crate::extent::ExtentPool;
use crate::index::{DupPolicy, Index, IndexDef};
use crate::tuple::TupleRef;

/// Which indexes a replace goes through; see the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// Snapshot replay: bulk-append into the primary, no checks.
    NoneBuilt,
    /// WAL replay: primary key only.
    PrimaryOnly,
    /// Normal operation: all keys.
    AllKeys,
}

/// A named collection of tuples. Index 0 is the primary.
pub struct Space {
    pub id: u32,
    pub group_id: u32,
    pub name: String,
    pub format: FormatId,
    /// False for spaces owned by another engine; their rows may never enter
    /// this engine's snapshots.
    pub is_memory: bool,
    /// Temporary spaces are excluded from checkpoints.
    pub is_temporary: bool,
    pub replace_mode: ReplaceMode,
    bsize: u64,
    indexes: Vec<Box<dyn Index>>,
}

impl Space {
    pub fn new(
        id: u32,
        group_id: u32,
        name: String,
        format: FormatId,
        is_temporary: bool,
        replace_mode: ReplaceMode,
        indexes: Vec<Box<dyn Index>>,
    ) -> Self {
        Self {
            id,
            group_id,
            name,
            format,
            is_memory: true,
            is_temporary,
            replace_mode,
            bsize: 0,
            indexes,
        }
    }

    pub fn primary(&self) -> Option<&dyn Index> {
        self.indexes.first().map(|i| i.as_ref())
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    pub fn index(&self, index_id: usize) -> Option<&dyn Index> {
        self.indexes.get(index_id).map(|i| i.as_ref())
    }

    pub fn index_mut(&mut self, index_id: usize) -> Option<&mut Box<dyn Index>> {
        self.indexes.get_mut(index_id)
    }

    /// Detach a secondary index for retirement. The primary cannot be
    /// removed this way.
    pub fn remove_index(&mut self, index_id: usize) -> Option<Box<dyn Index>> {
        if index_id == 0 || index_id >= self.indexes.len() {
            return None;
        }
        Some(self.indexes.remove(index_id))
    }

    /// Total payload bytes of live tuples.
    pub fn bsize(&self) -> u64 {
        self.bsize
    }

    pub fn update_bsize(&mut self, old: Option<TupleRef>, new: Option<TupleRef>) {
        if let Some(old) = old {
            self.bsize -= u64::from(old.bsize());
        }
        if let Some(new) = new {
            self.bsize += u64::from(new.bsize());
        }
    }

    /// Replace `old` with `new` through the indexes selected by the current
    /// replace mode. Returns the tuple displaced from the primary key.
    pub fn replace(
        &mut self,
        pool: &mut ExtentPool,
        old: Option<TupleRef>,
        new: Option<TupleRef>,
        dup: DupPolicy,
    ) -> Result<Option<TupleRef>> {
        match self.replace_mode {
            ReplaceMode::NoneBuilt => {
                let tuple = new.expect("bulk build appends tuples, never deletes");
                debug_assert!(old.is_none());
                self.indexes[0].build_next(pool, tuple)?;
                self.update_bsize(None, Some(tuple));
                Ok(None)
            }
            ReplaceMode::PrimaryOnly => {
                let displaced = self.indexes[0].replace(pool, old, new, dup)?;
                self.update_bsize(old.or(displaced), new);
                Ok(displaced)
            }
            ReplaceMode::AllKeys => {
                let displaced = self.indexes[0].replace(pool, old, new, dup)?;
                let effective_old = old.or(displaced);
                for i in 1..self.indexes.len() {
                    match self.indexes[i].replace(pool, effective_old, new, dup) {
                        Ok(_) => {}
                        Err(err) => {
                            // Undo the partial replace, most recent first.
                            for j in (0..i).rev() {
                                self.indexes[j]
                                    .replace(pool, new, effective_old, DupPolicy::Replace)
                                    .expect("restoring a displaced tuple cannot conflict");
                            }
                            return Err(err);
                        }
                    }
                }
                self.update_bsize(effective_old, new);
                Ok(displaced)
            }
        }
    }

    /// Finish the primary-key bulk build and enable WAL replay through it.
    pub fn end_build_primary_key(&mut self) -> Result<()> {
        if self.replace_mode != ReplaceMode::NoneBuilt {
            return Ok(());
        }
        self.indexes[0].end_build()?;
        self.replace_mode = ReplaceMode::PrimaryOnly;
        Ok(())
    }

    /// Bulk-build every secondary key from the primary and enable all keys.
    pub fn build_secondary_keys(&mut self, pool: &mut ExtentPool) -> Result<()> {
        if self.replace_mode == ReplaceMode::AllKeys {
            return Ok(());
        }
        self.end_build_primary_key()?;
        if self.indexes.len() > 1 {
            let tuples = self.indexes[0].all();
            if !tuples.is_empty() {
                info!(space = %self.name, "building secondary indexes");
            }
            for i in 1..self.indexes.len() {
                for &tuple in &tuples {
                    self.indexes[i].build_next(pool, tuple)?;
                }
                self.indexes[i].end_build()?;
            }
            if !tuples.is_empty() {
                info!(space = %self.name, "secondary index build done");
            }
        }
        self.replace_mode = ReplaceMode::AllKeys;
        Ok(())
    }

    /// Look up a tuple by primary key.
    pub fn get(&self, key: &[u8]) -> Option<TupleRef> {
        self.indexes.first().and_then(|pk| pk.get(key))
    }

    /// Revert one statement's effect on this space's indexes. The number of
    /// indexes to revert follows the replace mode; rolling back during
    /// snapshot recovery is a logic error, and a failed revert leaves the
    /// database inconsistent, so both terminate the process.
    pub fn rollback_statement(&mut self, pool: &mut ExtentPool, old: Option<TupleRef>, new: Option<TupleRef>) {
        let index_count = match self.replace_mode {
            ReplaceMode::AllKeys => self.indexes.len(),
            ReplaceMode::PrimaryOnly => 1,
            ReplaceMode::NoneBuilt => {
                panic!("transaction rolled back during snapshot recovery")
            }
        };
        for i in (0..index_count).rev() {
            if self.indexes[i]
                .replace(pool, new, old, DupPolicy::Replace)
                .is_err()
            {
                panic!("failed to rollback change in space '{}'", self.name);
            }
        }
        self.update_bsize(new, old);
    }
}

impl Space {
    /// Rows of this space belong in a checkpoint iff it is a memory-engine,
    /// non-temporary space with a built primary index.
    pub fn wants_checkpoint(&self) -> bool {
        self.is_memory && !self.is_temporary && self.primary().is_some()
    }
}

pub use crate::index::MemIndex;

/// Convenience constructor for a space whose indexes are `MemIndex`es.
pub fn new_mem_space(
    id: u32,
    group_id: u32,
    name: impl Into<String>,
    format: FormatId,
    is_temporary: bool,
    replace_mode: ReplaceMode,
    defs: Vec<IndexDef>,
) -> Space {
    let indexes: Vec<Box<dyn Index>> = defs
        .into_iter()
        .enumerate()
        .map(|(nth, def)| {
            // The primary is built in bulk only during snapshot replay;
            // secondaries stay in build mode until the bulk build after
            // recovery.
            let in_build = if nth == 0 {
                replace_mode == ReplaceMode::NoneBuilt
            } else {
                replace_mode != ReplaceMode::AllKeys
            };
            let index: Box<dyn Index> = if in_build {
                Box::new(MemIndex::for_build(def))
            } else {
                Box::new(MemIndex::new(def))
            };
            index
        })
        .collect();
    Space::new(id, group_id, name.into(), format, is_temporary, replace_mode, indexes)
}
