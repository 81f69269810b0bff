//! Optimistic-concurrency behavior across independent table handles.

use delta_table::retry::{with_retry, RetryOptions};
use delta_table::{DeltaTable, Error};
use serde_json::json;
use test_utils::{rows, sequential_rows, setup_table};

#[tokio::test]
async fn conflicting_writers_serialize() {
    let (store, a) = setup_table("t").await;
    a.write(rows(&[json!({"_id": "seed"})])).await.unwrap();

    // both handles observe version 0
    let b = DeltaTable::open(store.clone(), "t").await.unwrap();
    assert_eq!(a.version().await, Some(0));
    assert_eq!(b.version().await, Some(0));

    let result = a.write(rows(&[json!({"_id": "x"})])).await.unwrap();
    assert_eq!(result.version, Some(1));

    let err = b.write(rows(&[json!({"_id": "y"})])).await.unwrap_err();
    let Error::Concurrency { expected, actual } = err else {
        panic!("expected a concurrency error, got {err:?}");
    };
    assert_eq!((expected, actual), (0, 1));

    // the loser refreshes and lands at the next version
    assert_eq!(b.refresh_version().await.unwrap(), Some(1));
    let result = b.write(rows(&[json!({"_id": "y"})])).await.unwrap();
    assert_eq!(result.version, Some(2));
}

#[tokio::test]
async fn failed_commit_leaves_no_partial_state() {
    let (store, a) = setup_table("t").await;
    a.write(sequential_rows(0, 2)).await.unwrap();
    let b = DeltaTable::open(store.clone(), "t").await.unwrap();
    a.write(sequential_rows(10, 2)).await.unwrap();
    b.write(sequential_rows(20, 2)).await.unwrap_err();

    // the losing write landed no commit; version 2 is free for the retry
    assert_eq!(
        DeltaTable::open(store.clone(), "t").await.unwrap().version().await,
        Some(1)
    );
}

#[tokio::test]
async fn with_retry_resolves_conflicts() {
    let (store, a) = setup_table("t").await;
    a.write(sequential_rows(0, 2)).await.unwrap();
    let b = DeltaTable::open(store.clone(), "t").await.unwrap();
    a.write(sequential_rows(10, 2)).await.unwrap();

    // b is stale; the retry helper refreshes between attempts
    let opts = RetryOptions {
        base_delay: std::time::Duration::from_millis(1),
        ..Default::default()
    };
    let version = with_retry(&opts, |attempt| {
        let b = b.clone();
        async move {
            if attempt > 1 {
                b.refresh_version().await?;
            }
            Ok(b.write(sequential_rows(20, 2)).await?.version)
        }
    })
    .await
    .unwrap();
    assert_eq!(version, Some(2));
}

#[tokio::test]
async fn queries_pin_their_snapshot() {
    let (store, a) = setup_table("t").await;
    a.write(sequential_rows(0, 3)).await.unwrap();

    let snapshot = std::sync::Arc::new(a.snapshot(None).await.unwrap());
    a.write(sequential_rows(3, 3)).await.unwrap();

    // the captured snapshot still sees only the first batch, and is restartable
    for _ in 0..2 {
        let pinned = a
            .query_all(
                json!({}),
                delta_table::QueryOptions {
                    snapshot: Some(snapshot.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(pinned.len(), 3);
    }
    let latest = a
        .query_all(json!({}), delta_table::QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(latest.len(), 6);

    // a second handle opened fresh sees the latest state too
    let b = DeltaTable::open(store, "t").await.unwrap();
    assert_eq!(b.version().await, Some(1));
}
