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

//! RillDB Storage
//!
//! The in-memory storage engine: tuple memory management with a
//! snapshot-versioned delayed-free discipline, copy-on-write read views
//! feeding a checkpoint writer thread, a recovery state machine, and
//! cooperative reclamation of retired index memory.
//!
//! # Architecture
//!
//! ```text
//! Quota ── SlabArena (16 MiB slabs)
//!            ├── SlabCache ── SmallAlloc (tuples, delayed-free aware)
//!            └── SlabCache ── ExtentPool (16 KiB index extents, reservable)
//!
//! StorageEngine
//!   ├── spaces: primary + secondary MemIndexes over refcounted tuples
//!   ├── checkpoint: read views -> writer thread -> .snap.inprogress
//!   ├── recovery: Initialized -> (InitialRecovery | Ok) -> FinalRecovery -> Ok
//!   └── gc: queue of retirement tasks, deferred past in-flight checkpoints
//! ```

pub mod arena;
pub mod checkpoint;
pub mod engine;
pub mod extent;
pub mod gc;
pub mod index;
pub mod recovery;
pub mod small;
pub mod snap;
pub mod space;
pub mod tuple;
pub mod txn;

pub use engine::{
    Engine, EngineConfig, GcRegistry, MemoryStat, NoopGcRegistry, RowSink, StorageEngine,
};
pub use gc::{DroppedIndexTask, GcTask};
pub use index::{key_from_parts, DupPolicy, IndexDef, IndexType, KeyPartDef};
pub use recovery::EngineState;
pub use small::{FreeMode, SmallStats};
pub use space::ReplaceMode;
pub use tuple::{TupleChunk, TupleRef};
pub use txn::{Stmt, Txn};
