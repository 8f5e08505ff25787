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

//! RillDB Core
//!
//! Fundamental types shared by every RillDB layer: the error enum, vector
//! clocks identifying snapshots, tuple formats with the raw body codec, and
//! the snapshot row model.

pub mod error;
pub mod row;
pub mod tuple_format;
pub mod vclock;

pub use error::{Result, RillError};
pub use row::{DmlRequest, RowBody, SnapRow, ROW_TYPE_INSERT};
pub use tuple_format::{FormatId, FormatRegistry, TupleFormat};
pub use vclock::{VClock, VClockOrder};
