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

//! The storage engine facade.
//!
//! The engine owns the whole memory stack (quota, arena, slab caches, the
//! small-object allocator and the extent pool), the space registry, the
//! snapshot directory, the GC queues and the lifecycle state. All mutation
//! happens on the single database task; the only other thread is the
//! checkpoint (or join) writer, which reads through captured read views.
//!
//! Teardown runs in reverse construction order: an in-flight checkpoint is
//! cancelled first, then spaces and GC queues go, then the allocators, and
//! the arena releases its memory last.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rilldb_core::tuple_format::FormatId;
use rilldb_core::{FormatRegistry, Result, RillError, SnapRow, VClock};
use tracing::info;

use crate::arena::{Quota, SlabArena, SlabCache};
use crate::checkpoint::Checkpoint;
use crate::extent::{ExtentPool, EXTENT_SIZE};
use crate::gc::{DroppedIndexTask, GcContext, GcState, GcTask};
use crate::index::{DupPolicy, IndexDef};
use crate::recovery::EngineState;
use crate::small::SmallAlloc;
use crate::snap::{SnapCursor, SnapDir, SnapOpts};
use crate::space::{new_mem_space, ReplaceMode, Space};
use crate::tuple::{drop_tuple, init_tuple, prepare_tuple, TupleChunk, TupleRef};
use crate::txn::{Stmt, Txn};

/// Lowest allowed minimum object size.
const OBJSIZE_MIN: usize = 16;

/// Worst-case extent demand of one index replace.
const RESERVE_EXTENTS_REPLACE: usize = 16;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding snapshot files.
    pub snap_dir: PathBuf,
    /// Disaster-recovery mode: enable all keys during snapshot read and
    /// drop rows that fail to apply.
    pub force_recovery: bool,
    /// Upper bound of the tuple arena, in bytes.
    pub arena_max_size: u64,
    /// Minimum object size of the allocator, rounded up to 16.
    pub objsize_min: usize,
    /// Growth factor between allocator size classes.
    pub alloc_factor: f64,
    /// Advisory: exclude tuple memory from core dumps.
    pub dontdump: bool,
    /// Byte-rate limit for snapshot writes, bytes per second.
    pub snap_io_rate_limit: Option<u64>,
    /// Maximum total size of one tuple.
    pub max_tuple_size: usize,
}

impl EngineConfig {
    pub fn new(snap_dir: impl Into<PathBuf>) -> Self {
        Self {
            snap_dir: snap_dir.into(),
            force_recovery: false,
            arena_max_size: 256 * 1024 * 1024,
            objsize_min: OBJSIZE_MIN,
            alloc_factor: 1.05,
            dontdump: false,
            snap_io_rate_limit: None,
            max_tuple_size: 1024 * 1024,
        }
    }
}

/// Engine memory usage, split by consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStat {
    /// Bytes used by tuple data.
    pub data: u64,
    /// Bytes used by index extents.
    pub index: u64,
}

/// The outer garbage collector's view of available checkpoints.
pub trait GcRegistry {
    fn add_checkpoint(&mut self, vclock: &VClock);
}

/// Registry that ignores every checkpoint.
pub struct NoopGcRegistry;

impl GcRegistry for NoopGcRegistry {
    fn add_checkpoint(&mut self, _vclock: &VClock) {}
}

/// Row consumer for replication initial join.
pub trait RowSink {
    fn write_row(&mut self, row: &SnapRow) -> Result<()>;
}

/// The engine-level operations the surrounding database dispatches through.
pub trait Engine {
    fn shutdown(&mut self);
    fn create_space(
        &mut self,
        id: u32,
        group_id: u32,
        name: &str,
        is_temporary: bool,
        index_defs: Vec<IndexDef>,
    ) -> Result<()>;
    fn join(&mut self, vclock: &VClock, sink: &mut (dyn RowSink + Send)) -> Result<()>;
    fn begin(&mut self, txn: &mut Txn);
    fn rollback_statement(&mut self, stmt: &Stmt);
    fn bootstrap(&mut self) -> Result<()>;
    fn begin_initial_recovery(&mut self, vclock: &VClock) -> Result<()>;
    fn begin_final_recovery(&mut self) -> Result<()>;
    fn end_recovery(&mut self) -> Result<()>;
    fn begin_checkpoint(&mut self) -> Result<()>;
    fn wait_checkpoint(&mut self, vclock: &VClock) -> Result<()>;
    fn commit_checkpoint(&mut self, vclock: &VClock);
    fn abort_checkpoint(&mut self);
    fn collect_garbage(&mut self, vclock: &VClock) -> Result<()>;
    fn backup(&mut self, vclock: &VClock, cb: &mut dyn FnMut(&Path) -> Result<()>) -> Result<()>;
    fn memory_stat(&self) -> MemoryStat;
}

/// The in-memory storage engine.
///
/// Field order mirrors teardown order: spaces and GC queues (holding tuple
/// and extent handles) drop before the allocators, and the arena drops last.
pub struct StorageEngine {
    pub(crate) cfg: EngineConfig,
    pub(crate) state: EngineState,
    /// Snapshot generation, bumped once at every checkpoint begin.
    pub(crate) generation: u32,
    pub(crate) formats: FormatRegistry,
    pub(crate) spaces: BTreeMap<u32, Space>,
    pub(crate) gc: GcState,
    pub(crate) checkpoint: Option<Checkpoint>,
    pub(crate) snap_dir: SnapDir,
    pub(crate) alloc: SmallAlloc,
    pub(crate) extents: ExtentPool,
    pub(crate) arena: Arc<SlabArena>,
}

impl StorageEngine {
    pub fn new(cfg: EngineConfig) -> Result<Self> {
        Self::new_with_registry(cfg, &mut NoopGcRegistry)
    }

    /// Create the engine and apprise `registry` of every checkpoint already
    /// present in the snapshot directory.
    pub fn new_with_registry(cfg: EngineConfig, registry: &mut dyn GcRegistry) -> Result<Self> {
        let opts = SnapOpts {
            rate_limit: cfg.snap_io_rate_limit,
            ..SnapOpts::default()
        };
        let snap_dir = SnapDir::new(&cfg.snap_dir, opts)?;
        for vclock in snap_dir.checkpoints() {
            registry.add_checkpoint(vclock);
        }

        let objsize_min = cfg.objsize_min.max(OBJSIZE_MIN);
        let quota = Arc::new(Quota::new(cfg.arena_max_size));
        let arena = SlabArena::new(quota);
        let alloc = SmallAlloc::new(
            SlabCache::new(arena.clone()),
            objsize_min,
            cfg.alloc_factor,
            cfg.max_tuple_size,
        );
        let extents = ExtentPool::new(SlabCache::new(arena.clone()));

        Ok(Self {
            cfg,
            state: EngineState::Initialized,
            generation: 0,
            formats: FormatRegistry::new(),
            spaces: BTreeMap::new(),
            gc: GcState::new(),
            checkpoint: None,
            snap_dir,
            alloc,
            extents,
            arena,
        })
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn space(&self, id: u32) -> Option<&Space> {
        self.spaces.get(&id)
    }

    pub fn space_mut(&mut self, id: u32) -> Option<&mut Space> {
        self.spaces.get_mut(&id)
    }

    /// Checkpoints known to the snapshot directory, oldest first.
    pub fn checkpoints(&self) -> &[VClock] {
        self.snap_dir.checkpoints()
    }

    // ------------------------------------------------------------------
    // Tuple factory
    // ------------------------------------------------------------------

    /// Build a tuple from a raw body, stamped with the current snapshot
    /// generation. On arena exhaustion, runs GC one step at a time and
    /// retries until GC has nothing left.
    pub fn make_tuple(&mut self, format: FormatId, body: &[u8]) -> Result<TupleRef> {
        let (field_map, total) = prepare_tuple(body, self.cfg.max_tuple_size)?;
        let slot = loop {
            if let Some(slot) = self.alloc.alloc(total) {
                break slot;
            }
            if self.run_gc_step() {
                return Err(RillError::OutOfMemory {
                    requested: total,
                    what: "tuple",
                });
            }
        };
        self.formats.retain(format);
        Ok(init_tuple(slot, self.generation, format, &field_map, body))
    }

    /// Release a tuple reference, freeing the tuple when it was the last.
    pub fn tuple_unref(&mut self, tuple: TupleRef) {
        if tuple.ref_dec() == 0 {
            drop_tuple(&mut self.alloc, &mut self.formats, self.generation, tuple);
        }
    }

    /// Allocate a tuple-associated auxiliary chunk holding `data`.
    pub fn make_chunk(&mut self, data: &[u8]) -> Result<TupleChunk> {
        crate::tuple::make_chunk(&mut self.alloc, data).ok_or(RillError::OutOfMemory {
            requested: data.len(),
            what: "tuple chunk",
        })
    }

    pub fn drop_chunk(&mut self, chunk: TupleChunk) {
        crate::tuple::drop_chunk(&mut self.alloc, chunk);
    }

    // ------------------------------------------------------------------
    // Data manipulation
    // ------------------------------------------------------------------

    /// Ensure at least `n` index extents are reserved, with GC retries.
    pub fn reserve_index_extents(&mut self, n: usize) -> Result<()> {
        loop {
            if self.extents.reserve(n) {
                return Ok(());
            }
            if self.run_gc_step() {
                return Err(RillError::OutOfMemory {
                    requested: EXTENT_SIZE,
                    what: "index extent",
                });
            }
        }
    }

    /// Insert (or replace) a tuple built from `body` into a space.
    pub fn execute_replace(
        &mut self,
        txn: &mut Txn,
        space_id: u32,
        body: &[u8],
        dup: DupPolicy,
    ) -> Result<()> {
        let format = self
            .spaces
            .get(&space_id)
            .ok_or(RillError::SpaceNotFound(space_id))?
            .format;
        let new = self.make_tuple(format, body)?;
        if let Err(err) = self.reserve_index_extents(RESERVE_EXTENTS_REPLACE) {
            self.drop_unreferenced(new);
            return Err(err);
        }

        let Self {
            spaces, extents, ..
        } = self;
        let space = spaces.get_mut(&space_id).expect("space looked up above");
        match space.replace(extents, None, Some(new), dup) {
            Ok(displaced) => {
                new.ref_inc();
                txn.push(Stmt {
                    space_id,
                    old: displaced,
                    new: Some(new),
                });
                Ok(())
            }
            Err(err) => {
                self.drop_unreferenced(new);
                Err(err)
            }
        }
    }

    /// Delete by primary key. Returns whether a tuple was removed.
    pub fn execute_delete(&mut self, txn: &mut Txn, space_id: u32, key: &[u8]) -> Result<bool> {
        self.reserve_index_extents(RESERVE_EXTENTS_REPLACE)?;
        let Self {
            spaces, extents, ..
        } = self;
        let space = spaces
            .get_mut(&space_id)
            .ok_or(RillError::SpaceNotFound(space_id))?;
        let Some(old) = space.get(key) else {
            return Ok(false);
        };
        space.replace(extents, Some(old), None, DupPolicy::Replace)?;
        txn.push(Stmt {
            space_id,
            old: Some(old),
            new: None,
        });
        Ok(true)
    }

    /// Commit: release the statements' displaced tuples.
    pub fn commit(&mut self, txn: &mut Txn) {
        for stmt in txn.take_stmts() {
            if let Some(old) = stmt.old {
                self.tuple_unref(old);
            }
        }
    }

    /// Roll every statement back, most recent first.
    pub fn rollback(&mut self, txn: &mut Txn) {
        let stmts = txn.take_stmts();
        for stmt in stmts.iter().rev() {
            self.rollback_statement(stmt);
        }
    }

    /// Revert a single statement: restore `old` over `new` in the affected
    /// indexes, fix byte accounting, retain old and release new.
    pub fn rollback_statement(&mut self, stmt: &Stmt) {
        if stmt.old.is_none() && stmt.new.is_none() {
            return;
        }
        let Self {
            spaces, extents, ..
        } = self;
        let space = spaces
            .get_mut(&stmt.space_id)
            .expect("statement references a live space");
        space.rollback_statement(extents, stmt.old, stmt.new);
        if let Some(new) = stmt.new {
            self.tuple_unref(new);
        }
    }

    /// Look up a tuple body by primary key.
    pub fn get(&self, space_id: u32, key: &[u8]) -> Option<&[u8]> {
        let tuple = self.spaces.get(&space_id)?.get(key)?;
        // `tuple` is a `Copy` handle (`TupleRef`) into memory owned by `self`,
        // not by this local; the returned slice's real lifetime is `self`'s.
        let data = tuple.data();
        Some(unsafe { std::slice::from_raw_parts(data.as_ptr(), data.len()) })
    }

    fn drop_unreferenced(&mut self, tuple: TupleRef) {
        debug_assert_eq!(tuple.refs(), 0);
        drop_tuple(&mut self.alloc, &mut self.formats, self.generation, tuple);
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// Run one GC iteration. Returns true when there is nothing to do.
    pub fn run_gc_step(&mut self) -> bool {
        let in_flight = self.checkpoint.is_some();
        let Self {
            gc,
            alloc,
            extents,
            formats,
            generation,
            ..
        } = self;
        let mut ctx = GcContext {
            alloc,
            extents,
            formats,
            generation: *generation,
        };
        gc.run_step(&mut ctx, in_flight)
    }

    pub fn schedule_gc(&mut self, task: Box<dyn GcTask>) {
        self.gc.schedule(task);
    }

    pub(crate) fn gc_drain_after_checkpoint(&mut self) {
        let Self {
            gc,
            alloc,
            extents,
            formats,
            generation,
            ..
        } = self;
        let mut ctx = GcContext {
            alloc,
            extents,
            formats,
            generation: *generation,
        };
        gc.drain_after_checkpoint(&mut ctx);
    }

    /// Retire a secondary index; its memory is reclaimed cooperatively and
    /// released only once no checkpoint can be reading it.
    pub fn drop_index(&mut self, space_id: u32, index_id: usize) -> Result<()> {
        let space = self
            .spaces
            .get_mut(&space_id)
            .ok_or(RillError::SpaceNotFound(space_id))?;
        let mut index = space.remove_index(index_id).ok_or(RillError::Cfg {
            param: "index_id",
            reason: format!("space {space_id} has no droppable index {index_id}"),
        })?;
        let extents = index.take_extents();
        self.schedule_gc(Box::new(DroppedIndexTask::new(Vec::new(), extents)));
        Ok(())
    }

    /// Retire a whole space: its tuples are unreferenced step by step, its
    /// extents released after any in-flight checkpoint.
    pub fn drop_space(&mut self, space_id: u32) -> Result<()> {
        let mut space = self
            .spaces
            .remove(&space_id)
            .ok_or(RillError::SpaceNotFound(space_id))?;
        let tuples = space.primary().map(|pk| pk.all()).unwrap_or_default();
        let mut extents = Vec::new();
        for i in 0..space.index_count() {
            if let Some(index) = space.index_mut(i) {
                extents.append(&mut index.take_extents());
            }
        }
        self.schedule_gc(Box::new(DroppedIndexTask::new(tuples, extents)));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle and maintenance
    // ------------------------------------------------------------------

    pub fn create_space(
        &mut self,
        id: u32,
        group_id: u32,
        name: &str,
        is_temporary: bool,
        index_defs: Vec<IndexDef>,
    ) -> Result<()> {
        if self.spaces.contains_key(&id) {
            return Err(RillError::Cfg {
                param: "space_id",
                reason: format!("space {id} already exists"),
            });
        }
        let mode = match self.state {
            EngineState::InitialRecovery => ReplaceMode::NoneBuilt,
            EngineState::FinalRecovery => ReplaceMode::PrimaryOnly,
            EngineState::Initialized | EngineState::Ok => ReplaceMode::AllKeys,
        };
        let format = self.formats.register(is_temporary);
        let space = new_mem_space(id, group_id, name, format, is_temporary, mode, index_defs);
        self.spaces.insert(id, space);
        Ok(())
    }

    /// Memory-engine transactions must not yield until they resolve.
    pub fn begin(&mut self, txn: &mut Txn) {
        txn.can_yield = false;
    }

    /// Stream the snapshot at `vclock` to a replica sink, from a worker
    /// thread joined by the caller.
    pub fn join(&self, vclock: &VClock, sink: &mut (dyn RowSink + Send)) -> Result<()> {
        let path = self.snap_dir.format_filename(vclock.sum(), false);
        let joined = std::thread::scope(|scope| {
            scope
                .spawn(|| -> Result<()> {
                    let mut cursor = SnapCursor::open(&path)?;
                    while let Some(row) = cursor.next_row()? {
                        sink.write_row(&row)?;
                    }
                    if !cursor.is_eof() {
                        panic!("snapshot `{}' has no EOF marker", path.display());
                    }
                    Ok(())
                })
                .join()
        });
        match joined {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Hand the backup callback the snapshot file at `vclock`.
    pub fn backup(
        &self,
        vclock: &VClock,
        cb: &mut dyn FnMut(&Path) -> Result<()>,
    ) -> Result<()> {
        let path = self.snap_dir.format_filename(vclock.sum(), false);
        cb(&path)
    }

    /// Remove snapshots older than `vclock`.
    pub fn collect_garbage(&mut self, vclock: &VClock) -> Result<()> {
        self.snap_dir.collect_garbage(vclock.sum())
    }

    pub fn memory_stat(&self) -> MemoryStat {
        MemoryStat {
            data: self.alloc.stats().used,
            index: self.extents.used_bytes(),
        }
    }

    /// Detailed allocator statistics, including the delayed-free queue.
    pub fn allocator_stats(&self) -> crate::small::SmallStats {
        self.alloc.stats()
    }

    /// Grow the arena quota. Shrinking at runtime is not supported.
    pub fn set_memory(&mut self, size: u64) -> Result<()> {
        let quota = self.arena.quota();
        if size < quota.total() {
            return Err(RillError::Cfg {
                param: "arena_max_size",
                reason: "cannot decrease memory size at runtime".into(),
            });
        }
        quota.set_total(size);
        Ok(())
    }

    pub fn set_snap_io_rate_limit(&mut self, bytes_per_sec: Option<u64>) {
        self.cfg.snap_io_rate_limit = bytes_per_sec;
        self.snap_dir.opts.rate_limit = bytes_per_sec;
    }

    pub fn set_max_tuple_size(&mut self, max: usize) {
        self.cfg.max_tuple_size = max;
    }

    /// Cancel an in-flight checkpoint; the rest of teardown happens in
    /// field drop order.
    pub fn shutdown(&mut self) {
        if let Some(ckpt) = self.checkpoint.take() {
            info!("cancelling in-flight checkpoint on shutdown");
            ckpt.cancel();
        }
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Engine for StorageEngine {
    fn shutdown(&mut self) {
        StorageEngine::shutdown(self);
    }

    fn create_space(
        &mut self,
        id: u32,
        group_id: u32,
        name: &str,
        is_temporary: bool,
        index_defs: Vec<IndexDef>,
    ) -> Result<()> {
        StorageEngine::create_space(self, id, group_id, name, is_temporary, index_defs)
    }

    fn join(&mut self, vclock: &VClock, sink: &mut (dyn RowSink + Send)) -> Result<()> {
        StorageEngine::join(self, vclock, sink)
    }

    fn begin(&mut self, txn: &mut Txn) {
        StorageEngine::begin(self, txn);
    }

    fn rollback_statement(&mut self, stmt: &Stmt) {
        StorageEngine::rollback_statement(self, stmt);
    }

    fn bootstrap(&mut self) -> Result<()> {
        StorageEngine::bootstrap(self)
    }

    fn begin_initial_recovery(&mut self, vclock: &VClock) -> Result<()> {
        StorageEngine::begin_initial_recovery(self, vclock)
    }

    fn begin_final_recovery(&mut self) -> Result<()> {
        StorageEngine::begin_final_recovery(self)
    }

    fn end_recovery(&mut self) -> Result<()> {
        StorageEngine::end_recovery(self)
    }

    fn begin_checkpoint(&mut self) -> Result<()> {
        StorageEngine::begin_checkpoint(self)
    }

    fn wait_checkpoint(&mut self, vclock: &VClock) -> Result<()> {
        StorageEngine::wait_checkpoint(self, vclock)
    }

    fn commit_checkpoint(&mut self, vclock: &VClock) {
        StorageEngine::commit_checkpoint(self, vclock);
    }

    fn abort_checkpoint(&mut self) {
        StorageEngine::abort_checkpoint(self);
    }

    fn collect_garbage(&mut self, vclock: &VClock) -> Result<()> {
        StorageEngine::collect_garbage(self, vclock)
    }

    fn backup(&mut self, vclock: &VClock, cb: &mut dyn FnMut(&Path) -> Result<()>) -> Result<()> {
        StorageEngine::backup(self, vclock, cb)
    }

    fn memory_stat(&self) -> MemoryStat {
        StorageEngine::memory_stat(self)
    }
}
