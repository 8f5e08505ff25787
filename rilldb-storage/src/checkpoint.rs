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

//! Checkpointing: a consistent point-in-time snapshot concurrent with live
//! writes.
//!
//! `begin_checkpoint` captures a read-view iterator per space, bumps the
//! snapshot generation and switches the allocator to delayed-free mode; from
//! that instant, tuples visible to the read views cannot be reclaimed. The
//! file itself is produced by a dedicated OS thread that only drains the
//! iterators - it never touches indexes or the allocator. `commit` leaves
//! delayed mode, renames the `.inprogress` file into place and releases the
//! GC work withheld during the write; `abort` leaves delayed mode and
//! unlinks the partial file.
//!
//! When the target vector clock matches an existing snapshot the checkpoint
//! is "touch-only": the writer refreshes the file's mtime instead of
//! rewriting identical content.

use std::path::PathBuf;
use std::thread::JoinHandle;

use rilldb_core::{Result, SnapRow, VClock, VClockOrder};
use tracing::{error, info, warn};

use crate::engine::StorageEngine;
use crate::index::SnapshotIterator;
use crate::small::FreeMode;
use crate::snap::{touch_snapshot, SnapOpts, SnapWriter};

/// One space's contribution to a checkpoint.
pub(crate) struct CheckpointEntry {
    pub space_id: u32,
    pub group_id: u32,
    pub iter: Box<dyn SnapshotIterator>,
}

/// A checkpoint in flight.
pub(crate) struct Checkpoint {
    /// Read views captured at begin; moved into the writer thread by
    /// `wait`.
    entries: Option<Vec<CheckpointEntry>>,
    pub vclock: VClock,
    pub touch: bool,
    pub waiting_for_worker: bool,
    dir_path: PathBuf,
    opts: SnapOpts,
    worker: Option<JoinHandle<Result<bool>>>,
}

impl Checkpoint {
    pub fn new(dir_path: PathBuf, opts: SnapOpts) -> Self {
        Self {
            entries: Some(Vec::new()),
            vclock: VClock::new(),
            touch: false,
            waiting_for_worker: false,
            dir_path,
            opts,
            worker: None,
        }
    }

    pub fn add_entry(&mut self, entry: CheckpointEntry) {
        self.entries
            .as_mut()
            .expect("read views already handed to the worker")
            .push(entry);
    }

    fn filename(&self, inprogress: bool) -> PathBuf {
        let suffix = if inprogress { ".snap.inprogress" } else { ".snap" };
        self.dir_path
            .join(format!("{:020}{}", self.vclock.sum(), suffix))
    }

    pub fn inprogress_path(&self) -> PathBuf {
        self.filename(true)
    }

    pub fn final_path(&self) -> PathBuf {
        self.filename(false)
    }

    /// Start the writer thread over the captured read views.
    pub fn start_worker(&mut self) {
        let entries = self
            .entries
            .take()
            .expect("worker started twice for one checkpoint");
        let final_path = self.final_path();
        let inprogress = self.inprogress_path();
        let vclock = self.vclock.clone();
        let opts = self.opts.clone();
        let touch = self.touch;
        self.worker = Some(std::thread::spawn(move || {
            write_snapshot(entries, final_path, inprogress, vclock, opts, touch)
        }));
    }

    /// Join the writer. Updates the touch flag: a failed touch falls back to
    /// a full write.
    pub fn join_worker(&mut self) -> Result<()> {
        let worker = self.worker.take().expect("no worker to join");
        match worker.join() {
            Ok(Ok(touched)) => {
                self.touch = touched;
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Shutdown-time teardown: wait for the writer if it is still running,
    /// then drop the read views.
    pub fn cancel(mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.join_worker() {
                error!(error = %err, "checkpoint worker failed during shutdown");
            }
        }
    }
}

/// Body of the writer thread. Returns whether the checkpoint ended up
/// touch-only.
fn write_snapshot(
    mut entries: Vec<CheckpointEntry>,
    final_path: PathBuf,
    inprogress: PathBuf,
    vclock: VClock,
    opts: SnapOpts,
    touch: bool,
) -> Result<bool> {
    if touch {
        match touch_snapshot(&final_path) {
            Ok(()) => return Ok(true),
            Err(err) => {
                // Existing file was not touchable; write a fresh one.
                warn!(error = %err, "failed to touch existing snapshot, rewriting");
            }
        }
    }

    info!(file = %inprogress.display(), "saving snapshot");
    let mut writer = SnapWriter::create(&inprogress, &vclock, &opts)?;
    for entry in &mut entries {
        while let Some(data) = entry.iter.next() {
            let row = SnapRow::insert(entry.space_id, entry.group_id, data.to_vec());
            writer.write_row(row, &opts)?;
        }
    }
    writer.finish()?;
    info!("snapshot done");
    Ok(false)
}

impl StorageEngine {
    /// Capture read views of every checkpointed space, advance the snapshot
    /// generation and enter delayed-free mode.
    pub fn begin_checkpoint(&mut self) -> Result<()> {
        assert!(self.checkpoint.is_none(), "checkpoint already in progress");
        let mut opts = self.snap_dir.opts.clone();
        opts.rate_limit = self.cfg.snap_io_rate_limit;
        let mut ckpt = Checkpoint::new(self.snap_dir.path().to_path_buf(), opts);
        for space in self.spaces.values() {
            if !space.wants_checkpoint() {
                continue;
            }
            let pk = space.primary().expect("checkpointed space has a primary");
            ckpt.add_entry(CheckpointEntry {
                space_id: space.id,
                group_id: space.group_id,
                iter: pk.create_snapshot_iterator(),
            });
        }
        self.checkpoint = Some(ckpt);

        // The generation bump is the commit point of the copy-on-write
        // view: tuples allocated from here on are invisible to it.
        self.generation += 1;
        self.alloc.set_free_mode(FreeMode::Delayed);
        Ok(())
    }

    /// Run the writer thread for the given target vector clock and block
    /// until it joins.
    pub fn wait_checkpoint(&mut self, vclock: &VClock) -> Result<()> {
        let touch = self
            .snap_dir
            .last_vclock()
            .is_some_and(|last| last.compare(vclock) == VClockOrder::Equal);
        let ckpt = self.checkpoint.as_mut().expect("no checkpoint in progress");
        ckpt.touch = touch;
        ckpt.vclock = vclock.clone();

        ckpt.start_worker();
        ckpt.waiting_for_worker = true;
        let result = ckpt.join_worker();
        ckpt.waiting_for_worker = false;
        if let Err(err) = &result {
            error!(error = %err, "checkpoint writer failed");
        }
        result
    }

    /// Publish the written snapshot and release everything withheld during
    /// the write window.
    pub fn commit_checkpoint(&mut self, vclock: &VClock) {
        let ckpt = self.checkpoint.take().expect("no checkpoint in progress");
        assert!(!ckpt.waiting_for_worker);

        self.alloc.set_free_mode(FreeMode::Immediate);

        if !ckpt.touch {
            let from = ckpt.inprogress_path();
            let to = ckpt.final_path();
            // The file is known to exist and the directory is writable; a
            // rename that fails here loses a durable snapshot.
            if let Err(err) = std::fs::rename(&from, &to) {
                panic!("can't rename `{}': {err}", from.display());
            }
        }

        let registered = self
            .snap_dir
            .last_vclock()
            .is_some_and(|last| last.compare(vclock) == VClockOrder::Equal);
        if !registered {
            self.snap_dir.add_vclock(ckpt.vclock.clone());
        }
        drop(ckpt);

        self.gc_drain_after_checkpoint();
    }

    /// Abandon the checkpoint: leave delayed mode and remove the partial
    /// file.
    pub fn abort_checkpoint(&mut self) {
        let mut ckpt = self.checkpoint.take().expect("no checkpoint in progress");
        if ckpt.waiting_for_worker {
            if let Err(err) = ckpt.join_worker() {
                error!(error = %err, "checkpoint writer failed during abort");
            }
            ckpt.waiting_for_worker = false;
        }

        self.alloc.set_free_mode(FreeMode::Immediate);

        // Best effort: the file may not exist if the writer never started.
        let _ = std::fs::remove_file(ckpt.inprogress_path());
    }
}
