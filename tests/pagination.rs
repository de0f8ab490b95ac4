use ssdb::clock::ManualClock;
use ssdb::config::SharedStorageConfig;
use ssdb::paginate::EntriesBatch;
use ssdb::{KeyAndOrValue, OperationResult, Origin, SetBehavior, SharedStorageDatabase};
use std::sync::Arc;
use std::time::Duration;

fn origin(s: &str) -> Origin {
    Origin::parse(s).expect("origin")
}

fn open() -> (SharedStorageDatabase, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let db = SharedStorageDatabase::with_clock(None, SharedStorageConfig::for_testing(), clock.clone())
        .expect("open db");
    (db, clock)
}

fn fill(db: &mut SharedStorageDatabase, o: &Origin, count: usize) {
    for i in 0..count {
        assert_eq!(
            db.set(o, &format!("k{i:02}"), "v", SetBehavior::Default),
            OperationResult::Set
        );
    }
}

fn keys_of(batches: &[EntriesBatch]) -> Vec<String> {
    batches
        .iter()
        .flat_map(|b| b.entries.iter().map(|e| e.key.clone()))
        .collect()
}

#[test]
fn keys_arrive_in_bounded_sorted_batches() {
    let (mut db, _clock) = open();
    let o = origin("https://a.test");
    fill(&mut db, &o, 12);

    let mut batches: Vec<EntriesBatch> = Vec::new();
    assert_eq!(db.keys(&o, &mut batches), OperationResult::Success);
    let sizes: Vec<usize> = batches.iter().map(|b| b.entries.len()).collect();
    assert_eq!(sizes, vec![5, 5, 2]);
    let more: Vec<bool> = batches.iter().map(|b| b.has_more_entries).collect();
    assert_eq!(more, vec![true, true, false]);
    assert!(batches.iter().all(|b| b.success && b.total_queued_to_send == 12));
    assert!(batches.iter().flat_map(|b| &b.entries).all(|e| e.value.is_none()));

    let expected: Vec<String> = (0..12).map(|i| format!("k{i:02}")).collect();
    assert_eq!(keys_of(&batches), expected);
}

#[test]
fn exact_multiple_ends_without_empty_batch() {
    let (mut db, _clock) = open();
    let o = origin("https://a.test");
    fill(&mut db, &o, 10);

    let mut batches: Vec<EntriesBatch> = Vec::new();
    assert_eq!(db.entries(&o, &mut batches), OperationResult::Success);
    assert_eq!(batches.len(), 2);
    assert!(batches[0].has_more_entries);
    assert!(!batches[1].has_more_entries);
    assert_eq!(batches[1].entries.len(), 5);
    assert_eq!(
        batches[0].entries[0],
        KeyAndOrValue {
            key: "k00".into(),
            value: Some("v".into()),
        }
    );
}

#[test]
fn empty_origin_gets_single_empty_batch() {
    let (mut db, _clock) = open();
    let o = origin("https://a.test");

    // Before the store exists.
    let mut batches: Vec<EntriesBatch> = Vec::new();
    assert_eq!(db.keys(&o, &mut batches), OperationResult::Success);
    assert_eq!(batches.len(), 1);
    assert!(batches[0].success);
    assert!(batches[0].entries.is_empty());
    assert!(!batches[0].has_more_entries);
    assert_eq!(batches[0].total_queued_to_send, 0);

    // After another origin created it.
    db.set(&origin("https://b.test"), "k", "v", SetBehavior::Default);
    let mut batches: Vec<EntriesBatch> = Vec::new();
    assert_eq!(db.entries(&o, &mut batches), OperationResult::Success);
    assert_eq!(batches.len(), 1);
    assert!(batches[0].entries.is_empty());
}

#[test]
fn expired_rows_are_not_streamed() {
    let (mut db, clock) = open();
    let o = origin("https://a.test");
    db.set(&o, "old", "v", SetBehavior::Default);
    clock.advance(Duration::from_secs(31 * 24 * 60 * 60));
    db.set(&o, "new", "v", SetBehavior::Default);

    let mut batches: Vec<EntriesBatch> = Vec::new();
    assert_eq!(db.keys(&o, &mut batches), OperationResult::Success);
    assert_eq!(keys_of(&batches), vec!["new".to_string()]);
    assert_eq!(batches[0].total_queued_to_send, 1);
}

#[test]
fn channel_listener_receives_every_batch() {
    let (mut db, _clock) = open();
    let o = origin("https://a.test");
    fill(&mut db, &o, 7);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut listener = tx;
    assert_eq!(db.entries(&o, &mut listener), OperationResult::Success);
    drop(listener);

    let mut received = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        received.push(batch);
    }
    assert_eq!(received.len(), 2);
    assert_eq!(keys_of(&received).len(), 7);
}
