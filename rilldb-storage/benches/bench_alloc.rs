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

//! Allocator throughput: size-class alloc/free and the delayed-free drain.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rilldb_storage::arena::{Quota, SlabArena, SlabCache};
use rilldb_storage::small::{FreeMode, SmallAlloc};

fn make_alloc() -> SmallAlloc {
    let quota = Arc::new(Quota::new(256 * 1024 * 1024));
    let arena = SlabArena::new(quota);
    SmallAlloc::new(SlabCache::new(arena), 16, 1.05, 1024 * 1024)
}

fn bench_alloc_free(c: &mut Criterion) {
    let mut alloc = make_alloc();
    c.bench_function("alloc_free_128", |b| {
        b.iter(|| {
            let ptr = alloc.alloc(black_box(128)).unwrap();
            alloc.free(ptr, 128);
        })
    });
}

fn bench_delayed_drain(c: &mut Criterion) {
    c.bench_function("delayed_drain_1k", |b| {
        let mut alloc = make_alloc();
        b.iter(|| {
            alloc.set_free_mode(FreeMode::Delayed);
            for _ in 0..1024 {
                let ptr = alloc.alloc(black_box(64)).unwrap();
                alloc.free_delayed(ptr, 64);
            }
            alloc.set_free_mode(FreeMode::Immediate);
        })
    });
}

criterion_group!(benches, bench_alloc_free, bench_delayed_drain);
criterion_main!(benches);
