//! Compaction, deduplication, Z-order clustering and vacuum against live tables.

use std::time::Duration;

use delta_table::maintenance::{
    compact, dedup, vacuum, zorder, CompactionOptions, CompactionStrategy, DedupMode,
    DedupOptions, KeepStrategy, VacuumOptions, ZOrderOptions,
};
use delta_table::{QueryOptions, StorageBackend, Value};
use serde_json::json;
use test_utils::{assert_same_rows, rows, sequential_rows, setup_table};

#[tokio::test]
async fn compaction_preserves_the_row_multiset() {
    let (_store, table) = setup_table("t").await;
    let mut expected = Vec::new();
    for i in 0..10 {
        let batch = sequential_rows(i * 100, 3);
        expected.extend(batch.clone());
        table.write(batch).await.unwrap();
    }
    let version_before = table.version().await.unwrap();
    assert_eq!(table.snapshot(None).await.unwrap().file_count(), 10);

    let result = compact(
        &table.get_compaction_context(),
        CompactionOptions {
            target_file_bytes: 10 * 1024 * 1024,
            verify_integrity: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(result.files_compacted, 10);
    assert_eq!(result.files_created, 1);
    // exactly one commit
    assert_eq!(result.version, Some(version_before + 1));
    assert_eq!(table.version().await, Some(version_before + 1));

    let snapshot = table.snapshot(None).await.unwrap();
    assert!(snapshot.file_count() < 10);
    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_same_rows(&all, &expected);
}

#[tokio::test]
async fn compaction_dry_run_commits_nothing() {
    let (_store, table) = setup_table("t").await;
    for i in 0..4 {
        table.write(sequential_rows(i * 10, 2)).await.unwrap();
    }
    let before = table.version().await;
    let result = compact(
        &table.get_compaction_context(),
        CompactionOptions {
            dry_run: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(result.version.is_none());
    assert_eq!(result.plan.len(), 1);
    assert_eq!(result.plan[0].len(), 4);
    assert_eq!(table.version().await, before);
}

#[tokio::test]
async fn compaction_strategies_produce_plans() {
    let (_store, table) = setup_table("t").await;
    for i in 0..6 {
        table.write(sequential_rows(i * 10, 2)).await.unwrap();
    }
    for strategy in [
        CompactionStrategy::BinPacking,
        CompactionStrategy::Greedy,
        CompactionStrategy::SortBySize,
    ] {
        let result = compact(
            &table.get_compaction_context(),
            CompactionOptions {
                strategy,
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let planned: usize = result.plan.iter().map(|bin| bin.len()).sum();
        assert_eq!(planned, 6, "strategy {strategy} must cover all input files");
    }
}

#[tokio::test]
async fn compaction_never_mixes_partitions() {
    let storage = std::sync::Arc::new(delta_table::InMemoryBackend::new());
    let table = delta_table::DeltaTable::create("t")
        .with_partition_columns(["p"])
        .create(storage)
        .await
        .unwrap();
    for i in 0..3 {
        table
            .write(rows(&[
                json!({"_id": format!("a{i}"), "p": "x", "v": i}),
                json!({"_id": format!("b{i}"), "p": "y", "v": i}),
            ]))
            .await
            .unwrap();
    }
    let result = compact(&table.get_compaction_context(), CompactionOptions::default())
        .await
        .unwrap();
    assert_eq!(result.files_created, 2);
    let snapshot = table.snapshot(None).await.unwrap();
    for add in snapshot.files() {
        assert_eq!(add.partition_values.len(), 1);
    }
    let x = table.query_all(json!({"p": "x"}), QueryOptions::default()).await.unwrap();
    assert_eq!(x.len(), 3);
}

#[tokio::test]
async fn primary_key_dedup_keeps_latest_by_order_column() {
    let (_store, table) = setup_table("t").await;
    table
        .write(rows(&[
            json!({"id": "a", "rev": 1, "v": "old"}),
            json!({"id": "b", "rev": 1, "v": "only"}),
        ]))
        .await
        .unwrap();
    table
        .write(rows(&[json!({"id": "a", "rev": 3, "v": "new"})]))
        .await
        .unwrap();
    table
        .write(rows(&[json!({"id": "a", "rev": 2, "v": "mid"})]))
        .await
        .unwrap();

    let result = dedup(
        &table.get_compaction_context(),
        DedupOptions {
            mode: DedupMode::PrimaryKey {
                columns: vec!["id".to_string()],
                keep: KeepStrategy::Latest {
                    order_by: "rev".to_string(),
                },
            },
            dry_run: false,
        },
    )
    .await
    .unwrap();
    assert_eq!(result.rows_removed, 2);
    assert_eq!(result.groups_with_duplicates, 1);

    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_same_rows(
        &all,
        &rows(&[
            json!({"id": "a", "rev": 3, "v": "new"}),
            json!({"id": "b", "rev": 1, "v": "only"}),
        ]),
    );
}

#[tokio::test]
async fn exact_dedup_keeps_one_representative() {
    let (_store, table) = setup_table("t").await;
    table
        .write(rows(&[
            json!({"x": 1, "y": "a"}),
            json!({"x": 1, "y": "a"}),
            json!({"x": 1, "y": "b"}),
        ]))
        .await
        .unwrap();
    let result = dedup(
        &table.get_compaction_context(),
        DedupOptions {
            mode: DedupMode::ExactDuplicate,
            dry_run: false,
        },
    )
    .await
    .unwrap();
    assert_eq!(result.rows_removed, 1);
    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_same_rows(
        &all,
        &rows(&[json!({"x": 1, "y": "a"}), json!({"x": 1, "y": "b"})]),
    );
}

#[tokio::test]
async fn zorder_clusters_rows_into_key_ranges() {
    let (_store, table) = setup_table("t").await;
    // two interleaved dimensions across several files
    for i in 0..4 {
        let batch: Vec<_> = (0..25)
            .map(|j| {
                delta_table::row_from_json(&json!({
                    "_id": format!("{i}-{j}"),
                    "x": (i * 25 + j) % 10,
                    "y": (i * 7 + j * 3) % 10,
                }))
            })
            .collect();
        table.write(batch).await.unwrap();
    }
    let before: Vec<_> = table
        .query_all(json!({}), QueryOptions::default())
        .await
        .unwrap();

    let result = zorder(
        &table.get_compaction_context(),
        ZOrderOptions {
            columns: vec!["x".to_string(), "y".to_string()],
            target_rows_per_file: 25,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(result.rows_clustered, 100);
    assert_eq!(result.files_before, 4);
    assert_eq!(result.files_after, 4);

    // same data, re-laid-out
    let after = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_same_rows(&after, &before);

    // before clustering every file spanned the whole x range; now at least one file covers
    // a strictly narrower slice, which is what zone-map pruning feeds on
    let snapshot = table.snapshot(None).await.unwrap();
    let narrowed = snapshot.files().any(|add| {
        let stats = add.parsed_stats().unwrap();
        let min = stats.min_values["x"].as_i64().unwrap();
        let max = stats.max_values["x"].as_i64().unwrap();
        max - min < 9
    });
    assert!(narrowed, "no file ended up with a narrowed x-range");
}

#[tokio::test]
async fn vacuum_respects_retention_and_live_files() {
    let (store, table) = setup_table("t").await;
    table.write(sequential_rows(0, 4)).await.unwrap();
    table.delete(json!({"n": {"$lt": 2}})).await.unwrap();

    // default retention: the freshly removed file stays
    let result = vacuum(&table.get_compaction_context(), VacuumOptions::default())
        .await
        .unwrap();
    assert!(result.files_deleted.is_empty());

    // zero retention: the tombstoned file goes, live files stay
    tokio::time::sleep(Duration::from_millis(15)).await;
    let files_before = store
        .list("t/")
        .await
        .unwrap()
        .iter()
        .filter(|p| p.ends_with(".parquet") && !p.contains("_delta_log"))
        .count();
    let result = vacuum(
        &table.get_compaction_context(),
        VacuumOptions {
            retention_ms: Some(0),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(result.files_deleted.len(), 1);
    assert!(result.bytes_freed > 0);

    let files_after = store
        .list("t/")
        .await
        .unwrap()
        .iter()
        .filter(|p| p.ends_with(".parquet") && !p.contains("_delta_log"))
        .count();
    assert_eq!(files_after, files_before - 1);

    // the table still reads clean
    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|r| matches!(r.get("n"), Some(Value::I64(_)) | Some(Value::I32(_)))));
}

#[tokio::test]
async fn vacuum_dry_run_deletes_nothing() {
    let (store, table) = setup_table("t").await;
    table.write(sequential_rows(0, 2)).await.unwrap();
    table.delete(json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;

    let before = store.list("t/").await.unwrap().len();
    let result = vacuum(
        &table.get_compaction_context(),
        VacuumOptions {
            retention_ms: Some(0),
            dry_run: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(result.files_deleted.len(), 1);
    assert!(result.dry_run);
    assert_eq!(store.list("t/").await.unwrap().len(), before);
}

#[tokio::test]
async fn vacuum_is_idempotent() {
    let (_store, table) = setup_table("t").await;
    table.write(sequential_rows(0, 2)).await.unwrap();
    table.delete(json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;

    let opts = VacuumOptions {
        retention_ms: Some(0),
        ..Default::default()
    };
    let first = vacuum(&table.get_compaction_context(), opts.clone()).await.unwrap();
    assert_eq!(first.files_deleted.len(), 1);
    let second = vacuum(&table.get_compaction_context(), opts).await.unwrap();
    assert!(second.files_deleted.is_empty());
}
