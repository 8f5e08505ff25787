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

//! Error types for RillDB.
//!
//! Non-fatal errors propagate through `Result`. Fatal invariant violations
//! (a snapshot missing its EOF marker during recovery, a failed rename at
//! checkpoint commit, a failed statement rollback) terminate the process at
//! the call site instead of surfacing here.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RillError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory: failed to allocate {requested} bytes for {what}")]
    OutOfMemory { requested: usize, what: &'static str },

    #[error("tuple size {size} exceeds the allowed maximum {max}")]
    TupleTooLarge { size: usize, max: usize },

    #[error("invalid tuple data: {0}")]
    Format(String),

    #[error("unknown request type {0}")]
    UnknownRequestType(u8),

    #[error("snapshot row targets space {space_id} of a different engine")]
    CrossEngineRow { space_id: u32 },

    #[error("space {0} does not exist")]
    SpaceNotFound(u32),

    #[error("duplicate key in space {space_id}, index {index_id}")]
    DuplicateKey { space_id: u32, index_id: u32 },

    #[error("snapshot is corrupted: {0}")]
    CorruptSnapshot(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration for '{param}': {reason}")]
    Cfg {
        param: &'static str,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, RillError>;
