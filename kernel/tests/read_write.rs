//! End-to-end write/query behavior: read-your-writes, filters, projections, time travel.

use delta_table::{ColumnMappingMode, DeltaTable, QueryOptions, StorageBackend, Value};
use serde_json::json;
use test_utils::{assert_same_rows, rows, sequential_rows, setup_table};

#[tokio::test]
async fn basic_read_your_writes() {
    let (_store, table) = setup_table("t").await;
    let result = table
        .write(rows(&[
            json!({"_id": "1", "n": "a", "v": 1}),
            json!({"_id": "2", "n": "b", "v": 2}),
        ]))
        .await
        .unwrap();
    assert_eq!(result.version, Some(0));
    assert_eq!(table.version().await, Some(0));

    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_same_rows(
        &all,
        &rows(&[
            json!({"_id": "1", "n": "a", "v": 1}),
            json!({"_id": "2", "n": "b", "v": 2}),
        ]),
    );
}

#[tokio::test]
async fn range_filter_with_projection() {
    let (_store, table) = setup_table("t").await;
    table
        .write(rows(&[
            json!({"_id": "1", "n": "a", "v": 1}),
            json!({"_id": "2", "n": "b", "v": 2}),
        ]))
        .await
        .unwrap();
    table
        .write(rows(&[json!({"_id": "3", "n": "c", "v": 3})]))
        .await
        .unwrap();

    let matched = table
        .query_all(
            json!({"v": {"$gte": 2, "$lte": 3}}),
            QueryOptions {
                projection: Some(json!(["_id", "v"])),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_same_rows(
        &matched,
        &rows(&[json!({"_id": "2", "v": 2}), json!({"_id": "3", "v": 3})]),
    );
}

#[tokio::test]
async fn time_travel_by_version() {
    let (_store, table) = setup_table("t").await;
    table
        .write(rows(&[
            json!({"_id": "1", "n": "a", "v": 1}),
            json!({"_id": "2", "n": "b", "v": 2}),
        ]))
        .await
        .unwrap();
    table
        .write(rows(&[json!({"_id": "3", "n": "c", "v": 3})]))
        .await
        .unwrap();

    let at_0 = table
        .query_all(
            json!({}),
            QueryOptions {
                version: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(at_0.len(), 2);

    let at_1 = table
        .query_all(
            json!({}),
            QueryOptions {
                version: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(at_1.len(), 3);

    // beyond the latest version is a validation error
    let err = table
        .query_all(
            json!({}),
            QueryOptions {
                version: Some(9),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn empty_write_is_a_noop() {
    let (store, table) = setup_table("t").await;
    let result = table.write(Vec::new()).await.unwrap();
    assert_eq!(result.version, None);
    assert_eq!(result.rows_written, 0);
    assert!(store.list("t/_delta_log/").await.unwrap().is_empty());

    table.write(sequential_rows(0, 3)).await.unwrap();
    let result = table.write(Vec::new()).await.unwrap();
    assert_eq!(result.version, Some(0));
    assert_eq!(table.version().await, Some(0));
}

#[tokio::test]
async fn version_filenames_are_dense() {
    let (store, table) = setup_table("t").await;
    for i in 0..4 {
        table.write(sequential_rows(i * 10, 2)).await.unwrap();
    }
    let mut commits: Vec<String> = store
        .list("t/_delta_log/")
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.ends_with(".json"))
        .collect();
    commits.sort();
    let expected: Vec<String> = (0..4)
        .map(|v| format!("t/{}", test_utils::delta_path_for_version(v, "json")))
        .collect();
    assert_eq!(commits, expected);
}

#[tokio::test]
async fn query_on_empty_table_returns_nothing() {
    let (_store, table) = setup_table("t").await;
    assert_eq!(table.version().await, None);
    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn snapshot_reads_are_deterministic() {
    let (_store, table) = setup_table("t").await;
    table.write(sequential_rows(0, 5)).await.unwrap();
    table.write(sequential_rows(5, 5)).await.unwrap();

    let a = table.snapshot(Some(1)).await.unwrap();
    let b = table.snapshot(Some(1)).await.unwrap();
    let paths_a: Vec<_> = a.files().map(|f| f.path.clone()).collect();
    let paths_b: Vec<_> = b.files().map(|f| f.path.clone()).collect();
    assert_eq!(paths_a, paths_b);
    assert_eq!(a.metadata(), b.metadata());
    assert_eq!(a.protocol(), b.protocol());
}

#[tokio::test]
async fn partitioned_writes_use_hive_paths() {
    let storage = std::sync::Arc::new(delta_table::InMemoryBackend::new());
    let table = DeltaTable::create("t")
        .with_partition_columns(["region"])
        .create(storage.clone())
        .await
        .unwrap();
    // no schema declared: creation is deferred to the first write
    table
        .write(rows(&[
            json!({"_id": "1", "region": "eu", "v": 1}),
            json!({"_id": "2", "region": "us", "v": 2}),
            json!({"_id": "3", "region": "eu", "v": 3}),
        ]))
        .await
        .unwrap();

    let snapshot = table.snapshot(None).await.unwrap();
    assert_eq!(snapshot.file_count(), 2);
    let mut prefixes: Vec<String> = snapshot
        .files()
        .map(|add| add.path.split('/').next().unwrap().to_string())
        .collect();
    prefixes.sort();
    assert_eq!(prefixes, vec!["region=eu", "region=us"]);

    // partition values come back typed on read
    let eu = table
        .query_all(json!({"region": "eu"}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(eu.len(), 2);
    assert!(eu.iter().all(|r| r.get("region") == Some(&Value::Str("eu".into()))));
}

#[tokio::test]
async fn unknown_filter_operators_are_ignored() {
    let (_store, table) = setup_table("t").await;
    table.write(sequential_rows(0, 3)).await.unwrap();
    let all = table
        .query_all(json!({"n": {"$brandNew": 1}}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn aggregation_over_table_rows() {
    let (_store, table) = setup_table("t").await;
    table
        .write(rows(&[
            json!({"dept": "a", "salary": 10}),
            json!({"dept": "a", "salary": 30}),
            json!({"dept": "b", "salary": 20}),
        ]))
        .await
        .unwrap();
    let result = table
        .aggregate(&[
            json!({"$group": {"_id": "$dept", "total": {"$sum": "$salary"}}}),
            json!({"$sort": {"_id": 1}}),
        ])
        .await
        .unwrap();
    assert_eq!(result.documents_processed, 3);
    assert_eq!(result.groups_created, Some(2));
    assert_eq!(
        delta_table::row_to_json(&result.documents[0]),
        json!({"_id": "a", "total": 40})
    );
}

#[tokio::test]
async fn history_surfaces_commit_info() {
    let (_store, table) = setup_table("t").await;
    table.write(sequential_rows(0, 1)).await.unwrap();
    table.write(sequential_rows(1, 1)).await.unwrap();
    let history = table.history(None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].version, 1);
    assert_eq!(history[0].operation.as_deref(), Some("WRITE"));
    assert_eq!(history[0].read_version, Some(0));
    assert_eq!(history[1].version, 0);
}

#[tokio::test]
async fn int32_widens_to_double_on_append() {
    let (_store, table) = setup_table("t").await;
    table.write(rows(&[json!({"_id": "1", "v": 1})])).await.unwrap();
    table.write(rows(&[json!({"_id": "2", "v": 2.5})])).await.unwrap();
    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    // the column widened; old and new values compare equal across widths
    let v1 = all
        .iter()
        .find(|r| r.get("_id") == Some(&Value::Str("1".into())))
        .unwrap();
    assert!(v1.get("v").unwrap().equals(&Value::F64(1.0)));
    let schema = table.snapshot(None).await.unwrap().schema().unwrap().unwrap();
    assert_eq!(
        schema.field("v").unwrap().data_type,
        delta_table::PrimitiveType::Double
    );
}

#[tokio::test]
async fn incompatible_append_is_rejected() {
    let (_store, table) = setup_table("t").await;
    table.write(rows(&[json!({"_id": "1", "v": 1})])).await.unwrap();
    let err = table
        .write(rows(&[json!({"_id": "2", "v": "nope"})]))
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(table.version().await, Some(0));
}

#[tokio::test]
async fn column_mapping_round_trips_logical_names() {
    let storage = std::sync::Arc::new(delta_table::InMemoryBackend::new());
    let schema = delta_table::Schema::new(vec![
        delta_table::SchemaField::nullable("_id", delta_table::PrimitiveType::String),
        delta_table::SchemaField::nullable("v", delta_table::PrimitiveType::Integer),
    ]);
    let table = DeltaTable::create("t")
        .with_schema(schema)
        .with_column_mapping(ColumnMappingMode::Name)
        .create(storage)
        .await
        .unwrap();
    assert_eq!(table.version().await, Some(0));

    table.write(rows(&[json!({"_id": "1", "v": 7})])).await.unwrap();
    let all = table
        .query_all(json!({"v": 7}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].contains_key("_id"));
    assert!(all[0].contains_key("v"));
}

#[tokio::test]
async fn nested_filters_and_variant_columns() {
    let (_store, table) = setup_table("t").await;
    table
        .write(rows(&[
            json!({"_id": "1", "payload": {"kind": "a", "n": 1}}),
            json!({"_id": "2", "payload": {"kind": "b", "n": 2}}),
        ]))
        .await
        .unwrap();
    let matched = table
        .query_all(json!({"payload.kind": "b"}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].get("_id"), Some(&Value::Str("2".into())));
}
