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

//! Tuple formats and the raw tuple body codec.
//!
//! A tuple body is a serialized array of fields:
//!
//! ```text
//! [field_count: u32 le] ([field_len: u32 le] [field bytes...])*
//! ```
//!
//! The field map built from a body is a vector of byte offsets, one per
//! field, pointing at each field's length prefix. Indexes use the map for
//! O(1) access to key parts without rescanning the body.
//!
//! A format carries a reference count: it must outlive every tuple stamped
//! with its id, so the tuple factory retains the format per live tuple and
//! releases it on tuple drop.

use std::collections::HashMap;

use crate::error::{Result, RillError};

/// Identifier of a registered tuple format.
pub type FormatId = u16;

/// Metadata describing how tuples of one space are laid out.
#[derive(Debug)]
pub struct TupleFormat {
    pub id: FormatId,
    /// Temporary formats describe tuples that never reach a snapshot; the
    /// allocator may free them immediately even in delayed mode.
    pub is_temporary: bool,
    refs: u64,
}

impl TupleFormat {
    pub fn refs(&self) -> u64 {
        self.refs
    }
}

/// Registry of live tuple formats, keyed by id.
#[derive(Debug, Default)]
pub struct FormatRegistry {
    formats: HashMap<FormatId, TupleFormat>,
    next_id: FormatId,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, is_temporary: bool) -> FormatId {
        let id = self.next_id;
        self.next_id += 1;
        self.formats.insert(
            id,
            TupleFormat {
                id,
                is_temporary,
                refs: 0,
            },
        );
        id
    }

    pub fn get(&self, id: FormatId) -> Option<&TupleFormat> {
        self.formats.get(&id)
    }

    pub fn retain(&mut self, id: FormatId) {
        if let Some(f) = self.formats.get_mut(&id) {
            f.refs += 1;
        }
    }

    pub fn release(&mut self, id: FormatId) {
        if let Some(f) = self.formats.get_mut(&id) {
            debug_assert!(f.refs > 0);
            f.refs = f.refs.saturating_sub(1);
        }
    }

    pub fn is_temporary(&self, id: FormatId) -> bool {
        self.formats.get(&id).is_some_and(|f| f.is_temporary)
    }
}

/// Serialize a field list into a raw tuple body.
pub fn encode_fields(fields: &[&[u8]]) -> Vec<u8> {
    let total: usize = 4 + fields.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut body = Vec::with_capacity(total);
    body.extend_from_slice(&(fields.len() as u32).to_le_bytes());
    for field in fields {
        body.extend_from_slice(&(field.len() as u32).to_le_bytes());
        body.extend_from_slice(field);
    }
    body
}

fn read_u32(body: &[u8], at: usize) -> Result<u32> {
    let end = at
        .checked_add(4)
        .filter(|&e| e <= body.len())
        .ok_or_else(|| RillError::Format(format!("truncated tuple body at offset {at}")))?;
    Ok(u32::from_le_bytes(body[at..end].try_into().unwrap()))
}

/// Validate a raw body and return the per-field offsets of its length
/// prefixes.
pub fn build_field_map(body: &[u8]) -> Result<Vec<u32>> {
    let count = read_u32(body, 0)? as usize;
    let mut map = Vec::with_capacity(count);
    let mut at = 4usize;
    for _ in 0..count {
        map.push(at as u32);
        let len = read_u32(body, at)? as usize;
        at = at
            .checked_add(4 + len)
            .filter(|&e| e <= body.len())
            .ok_or_else(|| {
                RillError::Format(format!("field at offset {at} overruns tuple body"))
            })?;
    }
    if at != body.len() {
        return Err(RillError::Format(format!(
            "{} trailing bytes after the last field",
            body.len() - at
        )));
    }
    Ok(map)
}

/// Number of fields in a raw body.
pub fn field_count(body: &[u8]) -> Result<u32> {
    read_u32(body, 0)
}

/// The field whose length prefix sits at `offset` (as recorded in a field
/// map built from the same body).
pub fn field_at(body: &[u8], offset: u32) -> Result<&[u8]> {
    let at = offset as usize;
    let len = read_u32(body, at)? as usize;
    let start = at + 4;
    body.get(start..start + len)
        .ok_or_else(|| RillError::Format(format!("field at offset {at} overruns tuple body")))
}
