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

//! Vector clocks.
//!
//! A vector clock maps a replica id to the LSN of the last row applied from
//! that replica. Snapshot files are identified by their vector clock; the
//! scalar `sum()` of all components is used as the on-disk signature and
//! filename stem.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Relative ordering of two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VClockOrder {
    Equal,
    /// Every component is <= the other's, at least one strictly.
    Less,
    /// Every component is >= the other's, at least one strictly.
    Greater,
    /// Components diverge in both directions.
    Incomparable,
}

/// A vector clock: replica id -> last applied LSN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VClock {
    lsns: BTreeMap<u32, u64>,
}

impl VClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// LSN recorded for `replica_id`, 0 if none.
    pub fn get(&self, replica_id: u32) -> u64 {
        self.lsns.get(&replica_id).copied().unwrap_or(0)
    }

    /// Advance the component for `replica_id` to `lsn`.
    ///
    /// Components never move backwards; a smaller `lsn` is ignored.
    pub fn follow(&mut self, replica_id: u32, lsn: u64) {
        let entry = self.lsns.entry(replica_id).or_insert(0);
        if lsn > *entry {
            *entry = lsn;
        }
    }

    /// Scalar signature: the sum of all components.
    pub fn sum(&self) -> i64 {
        self.lsns.values().map(|&l| l as i64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lsns.is_empty()
    }

    pub fn compare(&self, other: &VClock) -> VClockOrder {
        let mut less = false;
        let mut greater = false;
        let ids = self.lsns.keys().chain(other.lsns.keys());
        for &id in ids {
            let a = self.get(id);
            let b = other.get(id);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }
        match (less, greater) {
            (false, false) => VClockOrder::Equal,
            (true, false) => VClockOrder::Less,
            (false, true) => VClockOrder::Greater,
            (true, true) => VClockOrder::Incomparable,
        }
    }
}
