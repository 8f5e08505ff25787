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

//! The recovery state machine.
//!
//! The engine moves strictly through
//! `Initialized -> (InitialRecovery | Ok) -> FinalRecovery -> Ok`.
//!
//! The fast path reads the snapshot in key order, bulk-appending into each
//! primary key, replays the WAL through primary keys only and bulk-builds
//! secondary keys at the end. Under force recovery all keys are enabled from
//! the start instead, so duplicate-key corruption in the snapshot surfaces
//! as per-row drops (with a logged warning) rather than a failed bulk build.

use rilldb_core::{Result, RillError, SnapRow, VClock};
use tracing::{error, info};

use crate::engine::StorageEngine;
use crate::index::DupPolicy;
use crate::snap::{build_image, SnapCursor};
use crate::txn::Txn;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initialized,
    InitialRecovery,
    FinalRecovery,
    Ok,
}

/// The embedded bootstrap image: a well-formed empty snapshot stream.
pub fn bootstrap_image() -> Result<Vec<u8>> {
    build_image(&VClock::new(), &[])
}

impl StorageEngine {
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Initialize an empty data directory from the embedded bootstrap
    /// image.
    pub fn bootstrap(&mut self) -> Result<()> {
        assert_eq!(self.state, EngineState::Initialized);
        self.state = EngineState::Ok;

        info!("initializing an empty data directory");
        let image = bootstrap_image()?;
        let mut cursor = SnapCursor::from_image(&image, "bootstrap")?;
        while let Some(row) = cursor.next_row()? {
            self.apply_snapshot_row(&row)?;
        }
        Ok(())
    }

    /// Enter recovery towards the given vector clock.
    pub fn begin_initial_recovery(&mut self, _vclock: &VClock) -> Result<()> {
        assert_eq!(self.state, EngineState::Initialized);
        // Fast start bulk-builds primary keys from the key-ordered
        // snapshot. Force recovery enables all keys up front instead, to
        // detect and discard duplicates in the snapshot.
        self.state = if self.cfg.force_recovery {
            EngineState::Ok
        } else {
            EngineState::InitialRecovery
        };
        Ok(())
    }

    /// Replay the snapshot at `vclock` into the engine.
    ///
    /// Panics if the snapshot has no EOF marker: such a file was cut short
    /// and must not be trusted.
    pub fn recover_snapshot(&mut self, vclock: &VClock) -> Result<()> {
        info!("recovery start");
        let signature = vclock.sum();
        let filename = self.snap_dir.format_filename(signature, false);
        info!(file = %filename.display(), "recovering from snapshot");

        let mut cursor = SnapCursor::open(&filename)?;
        let mut row_count: u64 = 0;
        while let Some(mut row) = cursor.next_row()? {
            // Replayed rows carry the snapshot signature as their LSN.
            row.lsn = signature as u64;
            if let Err(err) = self.apply_snapshot_row(&row) {
                if !self.cfg.force_recovery {
                    return Err(err);
                }
                error!(error = %err, "can't apply row, skipping");
            }
            row_count += 1;
            if row_count % 100_000 == 0 {
                info!(rows = row_count, "rows processed");
                std::thread::yield_now();
            }
        }
        if !cursor.is_eof() {
            panic!("snapshot `{}' has no EOF marker", filename.display());
        }
        Ok(())
    }

    /// Validate and apply one snapshot (or bootstrap) row.
    pub(crate) fn apply_snapshot_row(&mut self, row: &SnapRow) -> Result<()> {
        let request = row.decode_dml()?;
        let space = self
            .spaces
            .get(&request.space_id)
            .ok_or(RillError::SpaceNotFound(request.space_id))?;
        // A snapshot of this engine must contain only its own spaces.
        if !space.is_memory {
            return Err(RillError::CrossEngineRow {
                space_id: request.space_id,
            });
        }
        let mut txn = Txn::begin();
        self.begin(&mut txn);
        if let Err(err) = self.execute_replace(
            &mut txn,
            request.space_id,
            &request.tuple,
            DupPolicy::Insert,
        ) {
            self.rollback(&mut txn);
            return Err(err);
        }
        self.commit(&mut txn);
        Ok(())
    }

    /// End of the fast path: the primary keys are loaded.
    pub fn begin_final_recovery(&mut self) -> Result<()> {
        if self.state == EngineState::Ok {
            return Ok(());
        }
        assert_eq!(self.state, EngineState::InitialRecovery);

        for space in self.spaces.values_mut() {
            space.end_build_primary_key()?;
        }

        if self.cfg.force_recovery {
            // Disaster recovery: build secondary keys before the WAL is
            // read, so duplicates in unique keys surface immediately.
            self.state = EngineState::Ok;
            self.build_all_secondary_keys()?;
        } else {
            // Fast path: play out the WAL through primary keys only.
            self.state = EngineState::FinalRecovery;
        }
        Ok(())
    }

    /// WAL replay is finished: bulk-build secondary keys and go live.
    pub fn end_recovery(&mut self) -> Result<()> {
        if self.state != EngineState::Ok {
            assert_eq!(self.state, EngineState::FinalRecovery);
            self.state = EngineState::Ok;
            self.build_all_secondary_keys()?;
        }
        self.snap_dir.collect_inprogress()?;
        Ok(())
    }

    fn build_all_secondary_keys(&mut self) -> Result<()> {
        let Self {
            spaces, extents, ..
        } = self;
        for space in spaces.values_mut() {
            space.build_secondary_keys(extents)?;
        }
        Ok(())
    }
}
