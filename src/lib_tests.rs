use super::{
    DbCreationPolicy, InitStatus, ModifierMethod, OperationResult, Origin, SetBehavior,
    SharedStorageDatabase, Site,
};
use crate::clock::{Clock, ManualClock};
use crate::config::SharedStorageConfig;
use crate::error::StorageResult;
use crate::store::schema::SchemaUpgrade;
use proptest::prelude::*;
use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn origin(s: &str) -> Origin {
    Origin::parse(s).expect("origin")
}

fn memory_engine() -> (SharedStorageDatabase, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let db = SharedStorageDatabase::with_clock(None, SharedStorageConfig::for_testing(), clock.clone())
        .expect("engine");
    (db, clock)
}

fn file_engine(path: &Path) -> SharedStorageDatabase {
    SharedStorageDatabase::new(Some(path.to_path_buf()), SharedStorageConfig::for_testing())
        .expect("engine")
}

/// Sum of every stored row's bytes for `origin`, stale rows included.
fn raw_bytes(db: &SharedStorageDatabase, origin: &Origin) -> i64 {
    db.db
        .conn()
        .expect("conn")
        .query_row(
            "SELECT COALESCE(SUM(LENGTH(key)+LENGTH(value)),0) FROM values_mapping WHERE context_origin=?1",
            [origin.as_str()],
            |row| row.get(0),
        )
        .expect("sum")
}

fn set_meta(path: &Path, version: i64, compatible: i64) {
    let conn = Connection::open(path).expect("raw open");
    conn.execute(
        "UPDATE meta SET value=?1 WHERE key='version'",
        [version],
    )
    .expect("version");
    conn.execute(
        "UPDATE meta SET value=?1 WHERE key='last_compatible_version'",
        [compatible],
    )
    .expect("compatible");
}

#[test]
fn in_memory_reads_stay_unattempted_until_first_write() {
    let (mut db, _clock) = memory_engine();
    let a = origin("https://a.test");
    assert_eq!(db.get(&a, "k").result, OperationResult::NotFound);
    assert_eq!(db.length(&a), 0);
    assert_eq!(db.bytes_used(&a), 0);
    assert_eq!(db.purge_stale(), OperationResult::Success);
    assert_eq!(db.db_status(), InitStatus::Unattempted);
    assert!(!db.is_open());

    assert_eq!(db.set(&a, "k", "v", SetBehavior::Default), OperationResult::Set);
    assert_eq!(db.db_status(), InitStatus::Success);
    assert!(db.is_open());
}

#[test]
fn cached_total_tracks_every_mutation() {
    let (mut db, clock) = memory_engine();
    let a = origin("https://a.test");
    db.set(&a, "k1", "value", SetBehavior::Default);
    db.append(&a, "k1", "++");
    db.set(&a, "k2", "x", SetBehavior::Default);
    db.set(&a, "k2", "longer", SetBehavior::Default);
    db.delete(&a, "k1");
    clock.advance(31 * DAY);
    db.append(&a, "k2", "fresh");
    assert_eq!(db.bytes_used_include_expired(&a), raw_bytes(&db, &a));
    assert_eq!(db.bytes_used_include_expired(&a), 2 * (2 + 5));
}

#[test]
fn quota_purges_expired_rows_before_rejecting() {
    let (mut db, clock) = memory_engine();
    let a = origin("https://a.test");
    // 2 * (1 + 49) fills the 100 byte quota exactly.
    let big = "x".repeat(49);
    assert_eq!(db.set(&a, "a", &big, SetBehavior::Default), OperationResult::Set);
    assert_eq!(db.set(&a, "b", "y", SetBehavior::Default), OperationResult::NoCapacity);

    clock.advance(31 * DAY);
    assert_eq!(db.bytes_used_include_expired(&a), 100);
    assert_eq!(db.set(&a, "b", "y", SetBehavior::Default), OperationResult::Set);
    assert_eq!(db.bytes_used_include_expired(&a), 4);
    assert_eq!(db.get(&a, "a").result, OperationResult::NotFound);
}

#[test]
fn failed_batch_rolls_back_earlier_methods() {
    let (mut db, _clock) = memory_engine();
    let a = origin("https://a.test");
    db.set(&a, "keep", "0123456789", SetBehavior::Default);

    let result = db.batch_update(
        &a,
        &[
            ModifierMethod::Set {
                key: "new".into(),
                value: "1".into(),
                ignore_if_present: false,
            },
            ModifierMethod::Append {
                key: "keep".into(),
                value: "y".repeat(45),
            },
            ModifierMethod::Delete { key: "keep".into() },
        ],
    );
    assert_eq!(result.overall_result, OperationResult::InvalidAppend);
    assert_eq!(
        result.inner_method_results,
        vec![OperationResult::Set, OperationResult::InvalidAppend]
    );
    assert_eq!(db.get(&a, "new").result, OperationResult::NotFound);
    assert_eq!(db.get(&a, "keep").value.as_deref(), Some("0123456789"));
    assert_eq!(db.bytes_used_include_expired(&a), raw_bytes(&db, &a));
    assert_eq!(db.db.transaction_depth(), 0);
}

#[test]
fn too_new_file_is_left_untouched() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("shared_storage.db");
    let a = origin("https://a.test");
    {
        let mut db = file_engine(&path);
        assert_eq!(db.set(&a, "k", "v", SetBehavior::Default), OperationResult::Set);
    }
    set_meta(&path, 9, 7);

    let mut db = file_engine(&path);
    assert_eq!(db.get(&a, "k").result, OperationResult::InitFailure);
    assert_eq!(db.db_status(), InitStatus::TooNew);
    assert_eq!(db.set(&a, "k2", "v", SetBehavior::Default), OperationResult::InitFailure);
    drop(db);

    let conn = Connection::open(&path).expect("raw open");
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM values_mapping", [], |row| row.get(0))
        .expect("count");
    assert_eq!(rows, 1);
}

#[test]
fn deprecated_version_is_razed_and_recreated() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("shared_storage.db");
    let a = origin("https://a.test");
    {
        let mut db = file_engine(&path);
        db.set(&a, "old", "v", SetBehavior::Default);
    }
    set_meta(&path, 0, 0);

    let mut db = file_engine(&path);
    assert_eq!(db.set(&a, "new", "v", SetBehavior::Default), OperationResult::Set);
    assert_eq!(db.db_status(), InitStatus::Success);
    assert_eq!(db.get(&a, "old").result, OperationResult::NotFound);
    assert_eq!(db.length(&a), 1);
}

#[test]
fn v5_file_is_upgraded_in_place() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("shared_storage.db");
    {
        let conn = Connection::open(&path).expect("raw open");
        conn.execute_batch(
            "CREATE TABLE meta(key TEXT NOT NULL PRIMARY KEY, value INTEGER NOT NULL);\
             INSERT INTO meta VALUES('version',5),('last_compatible_version',5);\
             CREATE TABLE values_mapping(context_origin TEXT NOT NULL,key BLOB NOT NULL,\
               value BLOB NOT NULL,last_used_time INTEGER NOT NULL,\
               PRIMARY KEY(context_origin,key)) WITHOUT ROWID;\
             CREATE TABLE per_origin_mapping(context_origin TEXT NOT NULL PRIMARY KEY,\
               creation_time INTEGER NOT NULL,length INTEGER NOT NULL,\
               num_bytes INTEGER NOT NULL) WITHOUT ROWID;\
             CREATE TABLE budget_mapping(id INTEGER NOT NULL PRIMARY KEY,\
               context_site TEXT NOT NULL,time_stamp INTEGER NOT NULL,bits_debit REAL NOT NULL);",
        )
        .expect("seed v5");
        let now = crate::clock::to_micros(ManualClock::default().now());
        conn.execute(
            "INSERT INTO values_mapping VALUES(?1,?2,?3,?4)",
            rusqlite::params![
                "https://a.test",
                crate::codec::encode("k"),
                crate::codec::encode("vv"),
                now
            ],
        )
        .expect("row");
        conn.execute(
            "INSERT INTO per_origin_mapping VALUES('https://a.test',?1,1,6)",
            [now],
        )
        .expect("account");
    }

    let clock = Arc::new(ManualClock::default());
    let mut db = SharedStorageDatabase::with_clock(
        Some(path.clone()),
        SharedStorageConfig::for_testing(),
        clock,
    )
    .expect("engine");
    let a = origin("https://a.test");
    assert_eq!(db.get(&a, "k").value.as_deref(), Some("vv"));
    assert_eq!(db.db_status(), InitStatus::Success);
    assert_eq!(db.bytes_used_include_expired(&a), 6);
    drop(db);

    let conn = Connection::open(&path).expect("raw open");
    let version: i64 = conn
        .query_row("SELECT value FROM meta WHERE key='version'", [], |row| row.get(0))
        .expect("version");
    assert_eq!(version, 6);
}

struct RefuseUpgrade;

impl SchemaUpgrade for RefuseUpgrade {
    fn upgrade(&self, _conn: &Connection, _from_version: i64) -> StorageResult<bool> {
        Ok(false)
    }
}

#[test]
fn failed_upgrade_razes_and_starts_over() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("shared_storage.db");
    let a = origin("https://a.test");
    {
        let mut db = file_engine(&path);
        db.set(&a, "k", "v", SetBehavior::Default);
    }
    set_meta(&path, 5, 5);

    let mut db = file_engine(&path).with_schema_upgrade(RefuseUpgrade);
    assert_eq!(db.get(&a, "k").result, OperationResult::NotFound);
    assert_eq!(db.db_status(), InitStatus::Success);
}

#[test]
fn garbage_file_is_destroyed_and_replaced() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("shared_storage.db");
    fs::write(&path, vec![0xab_u8; 4096]).expect("garbage");

    let mut db = file_engine(&path);
    let a = origin("https://a.test");
    assert_eq!(db.set(&a, "k", "v", SetBehavior::Default), OperationResult::Set);
    assert_eq!(db.get(&a, "k").value.as_deref(), Some("v"));
}

#[test]
fn corruption_after_init_destroys_and_reinitializes() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("shared_storage.db");
    let a = origin("https://a.test");
    let mut db = file_engine(&path);
    assert_eq!(db.set(&a, "k", "v", SetBehavior::Default), OperationResult::Set);
    assert_eq!(db.db_status(), InitStatus::Success);

    let size = fs::metadata(&path).expect("metadata").len() as usize;
    fs::write(&path, vec![0xab_u8; size.max(4096)]).expect("overwrite pages");

    assert_eq!(db.get(&a, "k").result, OperationResult::SqlError);
    assert_eq!(db.db_status(), InitStatus::Unattempted);
    assert!(!db.is_open());
    assert!(!path.exists());

    assert_eq!(db.set(&a, "k", "fresh", SetBehavior::Default), OperationResult::Set);
    assert_eq!(db.db_status(), InitStatus::Success);
    assert_eq!(db.get(&a, "k").value.as_deref(), Some("fresh"));
}

#[test]
fn destroy_resets_engine_for_reuse() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("nested").join("shared_storage.db");
    let a = origin("https://a.test");
    let mut db = file_engine(&path);
    db.set(&a, "k", "v", SetBehavior::Default);
    assert!(path.exists());

    assert!(db.destroy());
    assert!(!path.exists());
    assert!(!db.is_open());
    assert_eq!(db.db_status(), InitStatus::Unattempted);
    assert!(db.destroy());

    assert_eq!(db.get(&a, "k").result, OperationResult::NotFound);
    assert!(!path.exists());
    assert_eq!(db.set(&a, "k", "again", SetBehavior::Default), OperationResult::Set);
    assert_eq!(db.get(&a, "k").value.as_deref(), Some("again"));
}

#[test]
fn ignore_if_absent_read_does_not_create_file() {
    let dir = tempdir().expect("temp");
    let path = dir.path().join("shared_storage.db");
    let mut db = file_engine(&path);
    assert_eq!(db.lazy_init(DbCreationPolicy::IgnoreIfAbsent), InitStatus::Unattempted);
    assert!(!path.exists());
    assert_eq!(db.lazy_init(DbCreationPolicy::CreateIfAbsent), InitStatus::Success);
    assert!(path.exists());
}

#[test]
fn metadata_combines_counts_time_and_budget() {
    let (mut db, clock) = memory_engine();
    let created = clock.now();
    let a = origin("https://www.a.test");
    db.set(&a, "k1", "v1", SetBehavior::Default);
    clock.advance(DAY / 2);
    db.set(&a, "k2", "v2", SetBehavior::Default);
    db.make_budget_withdrawal(&a.site(), 2.5);

    let metadata = db.get_metadata(&a);
    assert_eq!(metadata.length, 2);
    assert_eq!(metadata.bytes_used, 16);
    assert_eq!(metadata.creation_time, Some(created));
    assert_eq!(metadata.time_result, OperationResult::Success);
    assert_eq!(metadata.remaining_budget, 7.5);
    assert_eq!(metadata.budget_result, OperationResult::Success);
}

#[test]
fn testing_overrides_move_timestamps() {
    let (mut db, clock) = memory_engine();
    let a = origin("https://a.test");
    db.set(&a, "k", "v", SetBehavior::Default);

    let past = clock.now() - 40 * DAY;
    assert!(db.override_last_used_time_for_testing(&a, "k", past));
    let read = db.get(&a, "k");
    assert_eq!(read.result, OperationResult::Expired);
    assert_eq!(read.last_used_time, Some(past));
    assert_eq!(db.bytes_used_include_expired(&a), 4);

    assert!(db.override_creation_time_for_testing(&a, past));
    assert_eq!(db.get_creation_time(&a).time, Some(past));

    // Unknown rows are not an error.
    assert!(db.override_last_used_time_for_testing(&a, "missing", past));
    let b = origin("https://b.test");
    assert!(db.override_creation_time_for_testing(&b, past));
    assert_eq!(db.get_creation_time(&b).result, OperationResult::NotFound);
}

#[test]
fn budget_counts_are_per_site() {
    let (mut db, _clock) = memory_engine();
    let site = Site::parse("https://a.example.com").expect("site");
    let other = Site::parse("https://other.test").expect("site");
    assert_eq!(db.total_num_budget_entries_for_testing(), 0);
    db.make_budget_withdrawal(&site, 1.0);
    db.make_budget_withdrawal(&site, 1.0);
    db.make_budget_withdrawal(&other, 1.0);
    assert_eq!(db.num_budget_entries_for_testing(&site), 2);
    assert_eq!(db.total_num_budget_entries_for_testing(), 3);

    let member = origin("https://b.example.com");
    assert_eq!(db.reset_budget_for_dev_tools(&member), OperationResult::Success);
    assert_eq!(db.num_budget_entries_for_testing(&site), 0);
    assert_eq!(db.total_num_budget_entries_for_testing(), 1);
}

#[derive(Debug, Clone)]
enum Op {
    Set(u8, String),
    Append(u8, String),
    Delete(u8),
    Advance(u8),
    Purge,
}

fn arb_op() -> impl Strategy<Value = Op> {
    let value = "[a-z]{0,30}";
    prop_oneof![
        4 => (0u8..6, value).prop_map(|(k, v)| Op::Set(k, v)),
        3 => (0u8..6, value).prop_map(|(k, v)| Op::Append(k, v)),
        2 => (0u8..6).prop_map(Op::Delete),
        2 => (0u8..20).prop_map(Op::Advance),
        1 => Just(Op::Purge),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn live_bytes_never_exceed_quota(ops in prop::collection::vec(arb_op(), 1..40)) {
        let (mut db, clock) = memory_engine();
        let a = origin("https://a.test");
        for op in ops {
            match op {
                Op::Set(k, v) => {
                    db.set(&a, &format!("key{k}"), &v, SetBehavior::Default);
                }
                Op::Append(k, v) => {
                    db.append(&a, &format!("key{k}"), &v);
                }
                Op::Delete(k) => {
                    db.delete(&a, &format!("key{k}"));
                }
                Op::Advance(days) => clock.advance(u32::from(days) * DAY),
                Op::Purge => {
                    prop_assert_eq!(db.purge_stale(), OperationResult::Success);
                }
            }
            let live = db.bytes_used(&a);
            let cached = db.bytes_used_include_expired(&a);
            prop_assert!(live <= 100, "live bytes {} over quota", live);
            prop_assert!(live <= cached);
            if db.db_status() == InitStatus::Success {
                prop_assert_eq!(cached, raw_bytes(&db, &a));
            }
        }
    }
}
