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

//! Snapshot row model.
//!
//! A snapshot file is a stream of framed rows. Every row in a snapshot is an
//! INSERT with `replica_id = 0`, `sync = 0` and a dense 1-based LSN; the body
//! is a two-element map of space id and raw tuple bytes.

use serde::{Deserialize, Serialize};

use crate::error::{Result, RillError};

/// Row type tag for insert rows, the only type a snapshot may contain.
pub const ROW_TYPE_INSERT: u8 = 2;

/// Two-element row body: target space and raw tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowBody {
    pub space_id: u32,
    pub tuple: Vec<u8>,
}

/// One row of a snapshot stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapRow {
    pub row_type: u8,
    pub replica_id: u32,
    pub group_id: u32,
    pub lsn: u64,
    pub sync: u64,
    /// Timestamp in seconds, captured once per snapshot file.
    pub tm: f64,
    pub body: RowBody,
}

impl SnapRow {
    pub fn insert(space_id: u32, group_id: u32, tuple: Vec<u8>) -> Self {
        Self {
            row_type: ROW_TYPE_INSERT,
            replica_id: 0,
            group_id,
            lsn: 0,
            sync: 0,
            tm: 0.0,
            body: RowBody { space_id, tuple },
        }
    }

    /// Decode the row into a DML request, rejecting non-insert rows.
    pub fn decode_dml(&self) -> Result<DmlRequest> {
        if self.row_type != ROW_TYPE_INSERT {
            return Err(RillError::UnknownRequestType(self.row_type));
        }
        Ok(DmlRequest {
            space_id: self.body.space_id,
            tuple: self.body.tuple.clone(),
        })
    }
}

/// A decoded data-manipulation request from recovery or join.
#[derive(Debug, Clone)]
pub struct DmlRequest {
    pub space_id: u32,
    pub tuple: Vec<u8>,
}
