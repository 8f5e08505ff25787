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

//! End-to-end engine scenarios: checkpoint consistency against concurrent
//! writes, recovery round-trips, abort paths, and GC deferral.

use std::path::Path;

use rilldb_core::tuple_format::encode_fields;
use rilldb_core::{RillError, SnapRow, VClock};
use rilldb_storage::snap::{SnapCursor, SnapOpts, SnapWriter};
use rilldb_storage::{
    key_from_parts, DupPolicy, EngineConfig, EngineState, GcRegistry, IndexDef, IndexType,
    KeyPartDef, RowSink, StorageEngine, Txn,
};
use tempfile::TempDir;

const SPACE: u32 = 512;

fn vclock(lsn: u64) -> VClock {
    let mut v = VClock::new();
    v.follow(1, lsn);
    v
}

fn pk_def() -> IndexDef {
    IndexDef {
        index_id: 0,
        space_id: SPACE,
        name: "primary".into(),
        index_type: IndexType::Tree,
        unique: true,
        func_id: 0,
        parts: vec![KeyPartDef::field(0)],
    }
}

fn secondary_def() -> IndexDef {
    IndexDef {
        index_id: 1,
        space_id: SPACE,
        name: "by_value".into(),
        index_type: IndexType::Tree,
        unique: false,
        func_id: 0,
        parts: vec![KeyPartDef::field(1)],
    }
}

fn new_engine(dir: &Path) -> StorageEngine {
    StorageEngine::new(EngineConfig::new(dir)).unwrap()
}

fn body(key: &[u8], value: &[u8]) -> Vec<u8> {
    encode_fields(&[key, value])
}

fn key(k: &[u8]) -> Vec<u8> {
    key_from_parts(&[k])
}

fn insert(engine: &mut StorageEngine, k: &[u8], v: &[u8]) {
    let mut txn = Txn::begin();
    engine.begin(&mut txn);
    engine
        .execute_replace(&mut txn, SPACE, &body(k, v), DupPolicy::Insert)
        .unwrap();
    engine.commit(&mut txn);
}

fn delete(engine: &mut StorageEngine, k: &[u8]) {
    let mut txn = Txn::begin();
    engine.begin(&mut txn);
    assert!(engine.execute_delete(&mut txn, SPACE, &key(k)).unwrap());
    engine.commit(&mut txn);
}

fn checkpoint(engine: &mut StorageEngine, v: &VClock) {
    engine.begin_checkpoint().unwrap();
    engine.wait_checkpoint(v).unwrap();
    engine.commit_checkpoint(v);
}

fn snapshot_keys(path: &Path) -> Vec<Vec<u8>> {
    let mut cursor = SnapCursor::open(path).unwrap();
    let mut keys = Vec::new();
    while let Some(row) = cursor.next_row().unwrap() {
        let map = rilldb_core::tuple_format::build_field_map(&row.body.tuple).unwrap();
        keys.push(
            rilldb_core::tuple_format::field_at(&row.body.tuple, map[0])
                .unwrap()
                .to_vec(),
        );
    }
    assert!(cursor.is_eof());
    keys
}

fn snap_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_bootstrap_checkpoint_recover_cycle() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);

    {
        let mut engine = new_engine(tmp.path());
        engine.bootstrap().unwrap();
        assert_eq!(engine.state(), EngineState::Ok);

        engine
            .create_space(SPACE, 0, "items", false, vec![pk_def()])
            .unwrap();
        insert(&mut engine, b"1", b"one");
        insert(&mut engine, b"2", b"two");

        checkpoint(&mut engine, &v1);
        assert_eq!(engine.checkpoints().len(), 1);
    }

    // Restart: the snapshot directory is rescanned and replayed.
    let mut engine = new_engine(tmp.path());
    assert_eq!(engine.checkpoints().len(), 1);
    engine.begin_initial_recovery(&v1).unwrap();
    assert_eq!(engine.state(), EngineState::InitialRecovery);
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    engine.recover_snapshot(&v1).unwrap();
    engine.begin_final_recovery().unwrap();
    assert_eq!(engine.state(), EngineState::FinalRecovery);
    engine.end_recovery().unwrap();
    assert_eq!(engine.state(), EngineState::Ok);

    assert_eq!(engine.get(SPACE, &key(b"1")), Some(&body(b"1", b"one")[..]));
    assert_eq!(engine.get(SPACE, &key(b"2")), Some(&body(b"2", b"two")[..]));
}

#[test]
fn test_checkpoint_is_isolated_from_concurrent_writes() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    insert(&mut engine, b"1", b"one");
    insert(&mut engine, b"2", b"two");

    engine.begin_checkpoint().unwrap();

    // Writes after begin: invisible to the checkpoint.
    insert(&mut engine, b"3", b"three");
    delete(&mut engine, b"1");

    // Tuple 1 is gone from the live set but its memory is withheld for the
    // in-flight snapshot.
    assert_eq!(engine.allocator_stats().delayed, 1);
    assert!(engine.get(SPACE, &key(b"1")).is_none());

    engine.wait_checkpoint(&v1).unwrap();
    engine.commit_checkpoint(&v1);

    // The snapshot holds exactly the set live at begin.
    let path = tmp.path().join(format!("{:020}.snap", v1.sum()));
    let mut keys = snapshot_keys(&path);
    keys.sort();
    assert_eq!(keys, vec![b"1".to_vec(), b"2".to_vec()]);

    // The live set reflects the concurrent writes, and the delayed frees
    // have drained.
    assert!(engine.get(SPACE, &key(b"1")).is_none());
    assert!(engine.get(SPACE, &key(b"2")).is_some());
    assert!(engine.get(SPACE, &key(b"3")).is_some());
    assert_eq!(engine.allocator_stats().delayed, 0);
}

#[test]
fn test_recovery_replays_snapshot_plus_wal() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);

    {
        let mut engine = new_engine(tmp.path());
        engine.bootstrap().unwrap();
        engine
            .create_space(SPACE, 0, "items", false, vec![pk_def()])
            .unwrap();
        insert(&mut engine, b"1", b"one");
        insert(&mut engine, b"2", b"two");
        checkpoint(&mut engine, &v1);
    }

    let mut engine = new_engine(tmp.path());
    engine.begin_initial_recovery(&v1).unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    engine.recover_snapshot(&v1).unwrap();
    engine.begin_final_recovery().unwrap();

    // "WAL": replay the post-checkpoint writes through the primary key.
    insert(&mut engine, b"3", b"three");
    delete(&mut engine, b"1");
    engine.end_recovery().unwrap();

    assert!(engine.get(SPACE, &key(b"1")).is_none());
    assert_eq!(engine.get(SPACE, &key(b"2")), Some(&body(b"2", b"two")[..]));
    assert_eq!(
        engine.get(SPACE, &key(b"3")),
        Some(&body(b"3", b"three")[..])
    );
}

#[test]
fn test_duplicate_signature_checkpoint_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    insert(&mut engine, b"1", b"one");

    checkpoint(&mut engine, &v1);
    // Same target signature again: the second pass only touches the file.
    checkpoint(&mut engine, &v1);

    let files = snap_files(tmp.path());
    assert_eq!(files, vec![format!("{:020}.snap", v1.sum())]);
    assert_eq!(engine.checkpoints().len(), 1);
}

#[test]
fn test_force_recovery_drops_duplicate_rows() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);
    let snap_path = tmp.path().join(format!("{:020}.snap", v1.sum()));

    // A snapshot with two rows sharing one primary key.
    {
        let opts = SnapOpts::default();
        let mut writer = SnapWriter::create(&snap_path, &v1, &opts).unwrap();
        writer
            .write_row(SnapRow::insert(SPACE, 0, body(b"1", b"one")), &opts)
            .unwrap();
        writer
            .write_row(SnapRow::insert(SPACE, 0, body(b"1", b"dup")), &opts)
            .unwrap();
        writer.finish().unwrap();
    }

    // Without force recovery the duplicate aborts startup at the primary
    // key build.
    {
        let mut engine = new_engine(tmp.path());
        engine.begin_initial_recovery(&v1).unwrap();
        engine
            .create_space(SPACE, 0, "items", false, vec![pk_def()])
            .unwrap();
        engine.recover_snapshot(&v1).unwrap();
        let err = engine.begin_final_recovery().unwrap_err();
        assert!(matches!(err, RillError::DuplicateKey { .. }));
    }

    // With force recovery the duplicate row is dropped with a warning.
    {
        let mut cfg = EngineConfig::new(tmp.path());
        cfg.force_recovery = true;
        let mut engine = StorageEngine::new(cfg).unwrap();
        engine.begin_initial_recovery(&v1).unwrap();
        assert_eq!(engine.state(), EngineState::Ok);
        engine
            .create_space(SPACE, 0, "items", false, vec![pk_def()])
            .unwrap();
        engine.recover_snapshot(&v1).unwrap();
        engine.begin_final_recovery().unwrap();
        engine.end_recovery().unwrap();

        assert_eq!(engine.get(SPACE, &key(b"1")), Some(&body(b"1", b"one")[..]));
    }
}

#[test]
fn test_abort_checkpoint_cleans_up() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    insert(&mut engine, b"1", b"one");

    engine.begin_checkpoint().unwrap();
    engine.wait_checkpoint(&v1).unwrap();
    engine.abort_checkpoint();

    assert!(snap_files(tmp.path()).is_empty());

    // The allocator is back in immediate mode: a delete frees at once.
    delete(&mut engine, b"1");
    assert_eq!(engine.allocator_stats().delayed, 0);

    // A subsequent checkpoint succeeds.
    insert(&mut engine, b"2", b"two");
    let v2 = vclock(2);
    checkpoint(&mut engine, &v2);
    assert_eq!(snap_files(tmp.path()), vec![format!("{:020}.snap", v2.sum())]);
}

#[test]
fn test_index_drop_deferred_past_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def(), secondary_def()])
        .unwrap();
    insert(&mut engine, b"1", b"one");
    insert(&mut engine, b"2", b"two");

    let with_secondary = engine.memory_stat().index;
    assert!(with_secondary > 0);

    engine.begin_checkpoint().unwrap();
    engine.drop_index(SPACE, 1).unwrap();
    // Drain the GC queue; the release itself must wait for the commit.
    while !engine.run_gc_step() {}
    assert_eq!(engine.memory_stat().index, with_secondary);

    engine.wait_checkpoint(&v1).unwrap();
    engine.commit_checkpoint(&v1);
    assert!(engine.memory_stat().index < with_secondary);
}

#[test]
fn test_space_drop_reclaims_tuple_memory() {
    let tmp = TempDir::new().unwrap();

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    for i in 0..100u32 {
        insert(&mut engine, &i.to_le_bytes(), b"value");
    }
    assert!(engine.memory_stat().data > 0);

    engine.drop_space(SPACE).unwrap();
    while !engine.run_gc_step() {}
    assert_eq!(engine.memory_stat().data, 0);
    assert_eq!(engine.memory_stat().index, 0);
}

#[test]
fn test_rollback_restores_previous_tuple() {
    let tmp = TempDir::new().unwrap();

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    insert(&mut engine, b"1", b"one");

    let mut txn = Txn::begin();
    engine.begin(&mut txn);
    engine
        .execute_replace(&mut txn, SPACE, &body(b"1", b"changed"), DupPolicy::Replace)
        .unwrap();
    engine
        .execute_replace(&mut txn, SPACE, &body(b"9", b"nine"), DupPolicy::Insert)
        .unwrap();
    assert_eq!(
        engine.get(SPACE, &key(b"1")),
        Some(&body(b"1", b"changed")[..])
    );

    engine.rollback(&mut txn);
    assert_eq!(engine.get(SPACE, &key(b"1")), Some(&body(b"1", b"one")[..]));
    assert!(engine.get(SPACE, &key(b"9")).is_none());
}

#[test]
fn test_join_streams_snapshot_rows() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    insert(&mut engine, b"1", b"one");
    insert(&mut engine, b"2", b"two");
    checkpoint(&mut engine, &v1);

    struct Collect(Vec<SnapRow>);
    impl RowSink for Collect {
        fn write_row(&mut self, row: &SnapRow) -> rilldb_core::Result<()> {
            self.0.push(row.clone());
            Ok(())
        }
    }

    let mut sink = Collect(Vec::new());
    engine.join(&v1, &mut sink).unwrap();
    assert_eq!(sink.0.len(), 2);
    assert!(sink.0.iter().all(|r| r.body.space_id == SPACE));
    assert_eq!(
        sink.0.iter().map(|r| r.lsn).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[test]
fn test_backup_points_at_snapshot_file() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    checkpoint(&mut engine, &v1);

    let mut seen = Vec::new();
    engine
        .backup(&v1, &mut |path| {
            assert!(path.exists());
            seen.push(path.to_path_buf());
            Ok(())
        })
        .unwrap();
    assert_eq!(seen.len(), 1);
}

#[test]
fn test_collect_garbage_removes_old_snapshots() {
    let tmp = TempDir::new().unwrap();

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    insert(&mut engine, b"1", b"one");
    checkpoint(&mut engine, &vclock(1));
    insert(&mut engine, b"2", b"two");
    checkpoint(&mut engine, &vclock(2));

    engine.collect_garbage(&vclock(2)).unwrap();
    assert_eq!(engine.checkpoints().len(), 1);
    assert_eq!(snap_files(tmp.path()).len(), 1);
}

#[test]
fn test_startup_apprises_gc_registry() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);

    {
        let mut engine = new_engine(tmp.path());
        engine.bootstrap().unwrap();
        engine
            .create_space(SPACE, 0, "items", false, vec![pk_def()])
            .unwrap();
        checkpoint(&mut engine, &v1);
    }

    struct Collecting(Vec<i64>);
    impl GcRegistry for Collecting {
        fn add_checkpoint(&mut self, vclock: &VClock) {
            self.0.push(vclock.sum());
        }
    }

    let mut registry = Collecting(Vec::new());
    let _engine =
        StorageEngine::new_with_registry(EngineConfig::new(tmp.path()), &mut registry).unwrap();
    assert_eq!(registry.0, vec![v1.sum()]);
}

#[test]
#[should_panic(expected = "has no EOF marker")]
fn test_truncated_snapshot_aborts_recovery() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);
    let snap_path = tmp.path().join(format!("{:020}.snap", v1.sum()));

    {
        let opts = SnapOpts::default();
        let mut writer = SnapWriter::create(&snap_path, &v1, &opts).unwrap();
        writer
            .write_row(SnapRow::insert(SPACE, 0, body(b"1", b"one")), &opts)
            .unwrap();
        writer.finish().unwrap();
    }
    // Cut off the EOF marker.
    let len = std::fs::metadata(&snap_path).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&snap_path)
        .unwrap();
    file.set_len(len - 8).unwrap();

    let mut engine = new_engine(tmp.path());
    engine.begin_initial_recovery(&v1).unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    engine.recover_snapshot(&v1).unwrap();
}

#[test]
fn test_memory_stat_tracks_data_and_index() {
    let tmp = TempDir::new().unwrap();

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    let empty = engine.memory_stat();
    assert_eq!(empty.data, 0);

    insert(&mut engine, b"1", b"one");
    let one = engine.memory_stat();
    assert!(one.data > 0);
    assert!(one.index > 0);

    delete(&mut engine, b"1");
    assert_eq!(engine.memory_stat().data, 0);
}

#[test]
fn test_set_memory_grow_only() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = EngineConfig::new(tmp.path());
    cfg.arena_max_size = 64 * 1024 * 1024;
    let mut engine = StorageEngine::new(cfg).unwrap();

    assert!(engine.set_memory(128 * 1024 * 1024).is_ok());
    let err = engine.set_memory(32 * 1024 * 1024).unwrap_err();
    assert!(matches!(err, RillError::Cfg { .. }));
}

#[test]
fn test_temporary_space_excluded_from_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let v1 = vclock(1);

    let mut engine = new_engine(tmp.path());
    engine.bootstrap().unwrap();
    engine
        .create_space(SPACE, 0, "items", false, vec![pk_def()])
        .unwrap();
    let tmp_space = SPACE + 1;
    engine
        .create_space(
            tmp_space,
            0,
            "scratch",
            true,
            vec![IndexDef {
                space_id: tmp_space,
                ..pk_def()
            }],
        )
        .unwrap();

    insert(&mut engine, b"1", b"one");
    let mut txn = Txn::begin();
    engine.begin(&mut txn);
    engine
        .execute_replace(&mut txn, tmp_space, &body(b"t", b"tmp"), DupPolicy::Insert)
        .unwrap();
    engine.commit(&mut txn);

    checkpoint(&mut engine, &v1);

    let path = tmp.path().join(format!("{:020}.snap", v1.sum()));
    let mut cursor = SnapCursor::open(&path).unwrap();
    let mut spaces = Vec::new();
    while let Some(row) = cursor.next_row().unwrap() {
        spaces.push(row.body.space_id);
    }
    assert_eq!(spaces, vec![SPACE]);
}
