//! Checkpoint creation on the commit interval, `_last_checkpoint`, and recovery.

use std::collections::HashMap;
use std::sync::Arc;

use delta_table::log::LogStore;
use delta_table::snapshot::Snapshot;
use delta_table::{DeltaTable, InMemoryBackend, QueryOptions, StorageBackend};
use serde_json::json;
use test_utils::sequential_rows;

/// A table whose checkpoint interval is 4 commits.
async fn table_with_interval(storage: Arc<InMemoryBackend>) -> DeltaTable {
    DeltaTable::create("t")
        .with_configuration(HashMap::from([(
            "delta.checkpointInterval".to_string(),
            "4".to_string(),
        )]))
        .create(storage)
        .await
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn checkpoint_lands_on_the_interval() {
    let storage = Arc::new(InMemoryBackend::new());
    let table = table_with_interval(storage.clone()).await;
    // versions 0..=3: commit 3 is the interval boundary (3 % 4 == 3)
    for i in 0..4 {
        table.write(sequential_rows(i * 10, 2)).await.unwrap();
    }
    let listed = storage.list("t/_delta_log/").await.unwrap();
    assert!(listed
        .iter()
        .any(|p| p.ends_with("00000000000000000003.checkpoint.parquet")));

    let log = LogStore::new(storage.clone(), "t");
    let hint = log.read_last_checkpoint().await.unwrap().unwrap();
    assert_eq!(hint.version, 3);
    assert_eq!(hint.num_of_add_files, Some(4));
}

#[test_log::test(tokio::test)]
async fn snapshot_via_checkpoint_equals_full_replay() {
    let storage = Arc::new(InMemoryBackend::new());
    let table = table_with_interval(storage.clone()).await;
    for i in 0..6 {
        table.write(sequential_rows(i * 10, 2)).await.unwrap();
    }
    let log = LogStore::new(storage.clone(), "t");
    assert!(log.read_last_checkpoint().await.unwrap().is_some());

    let with_checkpoint = Snapshot::build(&log, None).await.unwrap();

    // removing the pointer forces a full replay; the result must be identical
    storage.delete("t/_delta_log/_last_checkpoint").await.unwrap();
    let via_replay = Snapshot::build(&log, None).await.unwrap();

    assert_eq!(with_checkpoint.version(), via_replay.version());
    let mut a: Vec<String> = with_checkpoint.files().map(|f| f.path.clone()).collect();
    let mut b: Vec<String> = via_replay.files().map(|f| f.path.clone()).collect();
    a.sort();
    b.sort();
    assert_eq!(a, b);
    assert_eq!(with_checkpoint.metadata(), via_replay.metadata());
    assert_eq!(with_checkpoint.protocol(), via_replay.protocol());
}

#[test_log::test(tokio::test)]
async fn broken_checkpoint_pointer_recovers_by_replay() {
    let storage = Arc::new(InMemoryBackend::new());
    let table = table_with_interval(storage.clone()).await;
    for i in 0..5 {
        table.write(sequential_rows(i * 10, 2)).await.unwrap();
    }
    // corrupt the checkpoint file itself; the pointer still names it
    storage
        .write(
            "t/_delta_log/00000000000000000003.checkpoint.parquet",
            bytes::Bytes::from_static(b"garbage"),
        )
        .await
        .unwrap();

    let reopened = DeltaTable::open(storage.clone(), "t").await.unwrap();
    assert_eq!(reopened.version().await, Some(4));
    let all = reopened
        .query_all(json!({}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 10);
}

#[test_log::test(tokio::test)]
async fn checkpoint_failure_does_not_fail_the_commit() {
    let storage = Arc::new(InMemoryBackend::new());
    let table = DeltaTable::create("t")
        .with_configuration(HashMap::from([(
            "delta.checkpointInterval".to_string(),
            "2".to_string(),
        )]))
        .create(storage.clone())
        .await
        .unwrap();
    table.write(sequential_rows(0, 2)).await.unwrap(); // v0
    table.write(sequential_rows(10, 2)).await.unwrap(); // v1, checkpoint at 1
    table.write(sequential_rows(20, 2)).await.unwrap(); // v2

    // v3 is a delete-everything commit (pure Removes, no data file writes); break plain
    // writes so its interval checkpoint cannot land
    storage.fail_next(delta_table::storage::memory::OpKind::Write, 2, "disk full");
    let deleted = table.delete(json!({})).await.unwrap();
    assert_eq!(deleted.version, Some(3));

    // the commit stands; the stale-but-valid older checkpoint still points at version 1
    let reopened = DeltaTable::open(storage.clone(), "t").await.unwrap();
    assert_eq!(reopened.version().await, Some(3));
    assert!(reopened
        .query_all(json!({}), QueryOptions::default())
        .await
        .unwrap()
        .is_empty());
    let hint = LogStore::new(storage.clone(), "t")
        .read_last_checkpoint()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hint.version, 1);
}
