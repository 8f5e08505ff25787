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

//! Minimal transaction record.
//!
//! The transaction manager proper is an external collaborator; the engine
//! only needs the per-statement (old, new) tuple pairs to commit reference
//! counts or roll a statement back. Statements hold a reference on both
//! tuples until the transaction resolves.

use crate::tuple::TupleRef;

/// One executed statement: the displaced and the inserted tuple.
#[derive(Debug, Clone, Copy)]
pub struct Stmt {
    pub space_id: u32,
    pub old: Option<TupleRef>,
    pub new: Option<TupleRef>,
}

/// An open transaction on the database task.
#[derive(Debug, Default)]
pub struct Txn {
    stmts: Vec<Stmt>,
    /// Memory-engine transactions must not yield between their first
    /// statement and commit.
    pub can_yield: bool,
}

impl Txn {
    pub fn begin() -> Self {
        Self {
            stmts: Vec::new(),
            can_yield: true,
        }
    }

    pub fn push(&mut self, stmt: Stmt) {
        self.stmts.push(stmt);
    }

    pub fn stmts(&self) -> &[Stmt] {
        &self.stmts
    }

    /// Drain statements for commit, oldest first.
    pub fn take_stmts(&mut self) -> Vec<Stmt> {
        std::mem::take(&mut self.stmts)
    }
}
