//! Update, delete and merge, with and without deletion vectors.

use std::sync::Arc;

use delta_table::{DeltaTable, InMemoryBackend, Mutation, QueryOptions, Value};
use serde_json::json;
use test_utils::{assert_same_rows, rows, setup_table};

#[tokio::test]
async fn update_rewrites_matching_rows() {
    let (_store, table) = setup_table("t").await;
    table
        .write(rows(&[
            json!({"_id": "1", "age": 30}),
            json!({"_id": "2", "age": 40}),
        ]))
        .await
        .unwrap();

    let result = table
        .update(json!({"_id": "1"}), Mutation::new().set("age", 31))
        .await
        .unwrap();
    assert_eq!(result.rows_updated, 1);
    assert_eq!(result.version, Some(1));

    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_same_rows(
        &all,
        &rows(&[json!({"_id": "1", "age": 31}), json!({"_id": "2", "age": 40})]),
    );
}

#[tokio::test]
async fn update_with_no_matches_is_a_noop() {
    let (_store, table) = setup_table("t").await;
    table.write(rows(&[json!({"_id": "1", "age": 30})])).await.unwrap();
    let result = table
        .update(json!({"_id": "zzz"}), Mutation::new().set("age", 99))
        .await
        .unwrap();
    assert_eq!(result.rows_updated, 0);
    assert_eq!(result.version, Some(0));
    assert_eq!(table.version().await, Some(0));
}

#[tokio::test]
async fn mutation_unset_removes_the_field() {
    let (_store, table) = setup_table("t").await;
    table
        .write(rows(&[json!({"_id": "1", "age": 30, "tmp": "x"})]))
        .await
        .unwrap();
    table
        .update(json!({"_id": "1"}), Mutation::new().unset("tmp"))
        .await
        .unwrap();
    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    // the column still exists in the schema, so the value reads back as null
    assert_eq!(all[0].get("tmp"), Some(&Value::Null));
}

#[tokio::test]
async fn delete_filters_rows_and_preserves_the_rest() {
    let (_store, table) = setup_table("t").await;
    table
        .write(rows(&[
            json!({"_id": "1", "v": 1}),
            json!({"_id": "2", "v": 2}),
            json!({"_id": "3", "v": 3}),
        ]))
        .await
        .unwrap();
    let result = table.delete(json!({"v": {"$gte": 2}})).await.unwrap();
    assert_eq!(result.rows_deleted, 2);
    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_same_rows(&all, &rows(&[json!({"_id": "1", "v": 1})]));
}

async fn dv_table() -> (Arc<InMemoryBackend>, DeltaTable) {
    let storage = Arc::new(InMemoryBackend::new());
    let table = DeltaTable::create("t")
        .with_deletion_vectors(true)
        .create(storage.clone())
        .await
        .unwrap();
    (storage, table)
}

#[tokio::test]
async fn dv_delete_keeps_the_file_and_masks_rows() {
    let (_store, table) = dv_table().await;
    table
        .write(rows(&[
            json!({"_id": "1", "v": 1}),
            json!({"_id": "2", "v": 2}),
            json!({"_id": "3", "v": 3}),
        ]))
        .await
        .unwrap();
    let before: Vec<String> = table
        .snapshot(None)
        .await
        .unwrap()
        .files()
        .map(|f| f.path.clone())
        .collect();

    let result = table.delete(json!({"v": 2})).await.unwrap();
    assert_eq!(result.rows_deleted, 1);

    let snapshot = table.snapshot(None).await.unwrap();
    let files: Vec<_> = snapshot.files().cloned().collect();
    // same physical file, now carrying a deletion vector
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, before[0]);
    let dv = files[0].deletion_vector.as_ref().unwrap();
    assert_eq!(dv.cardinality, 1);

    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_same_rows(
        &all,
        &rows(&[json!({"_id": "1", "v": 1}), json!({"_id": "3", "v": 3})]),
    );
}

#[tokio::test]
async fn dv_update_grows_the_vector_and_adds_new_rows() {
    let (_store, table) = dv_table().await;
    table
        .write(rows(&[
            json!({"_id": "1", "v": 1}),
            json!({"_id": "2", "v": 2}),
        ]))
        .await
        .unwrap();

    let result = table
        .update(json!({"_id": "2"}), Mutation::new().set("v", 20))
        .await
        .unwrap();
    assert_eq!(result.rows_updated, 1);

    let snapshot = table.snapshot(None).await.unwrap();
    // original file with a DV plus one new file holding the updated row, in one commit
    assert_eq!(snapshot.file_count(), 2);
    assert_eq!(snapshot.version(), Some(1));
    assert!(snapshot.files().any(|f| f.deletion_vector.is_some()));

    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_same_rows(
        &all,
        &rows(&[json!({"_id": "1", "v": 1}), json!({"_id": "2", "v": 20})]),
    );
}

#[tokio::test]
async fn dv_covering_every_row_removes_the_file() {
    let (_store, table) = dv_table().await;
    table
        .write(rows(&[json!({"_id": "1", "v": 1}), json!({"_id": "2", "v": 2})]))
        .await
        .unwrap();
    table.delete(json!({})).await.unwrap();
    let snapshot = table.snapshot(None).await.unwrap();
    assert_eq!(snapshot.file_count(), 0);
    assert!(table
        .query_all(json!({}), QueryOptions::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn merge_updates_deletes_and_inserts_in_one_commit() {
    let (_store, table) = setup_table("t").await;
    table
        .write(rows(&[
            json!({"_id": "1", "v": 1}),
            json!({"_id": "2", "v": 2}),
        ]))
        .await
        .unwrap();

    let incoming = rows(&[
        json!({"_id": "1", "v": 100}), // match -> update
        json!({"_id": "2"}),           // match -> delete
        json!({"_id": "9", "v": 9}),   // miss  -> insert
    ]);
    let result = table
        .merge(
            incoming,
            |existing, incoming| existing.get("_id") == incoming.get("_id"),
            |_existing, incoming| {
                if incoming.contains_key("v") {
                    Some(incoming.clone())
                } else {
                    None
                }
            },
            |incoming| Some(incoming.clone()),
        )
        .await
        .unwrap();
    assert_eq!(result.rows_updated, 1);
    assert_eq!(result.rows_deleted, 1);
    assert_eq!(result.rows_inserted, 1);
    assert_eq!(result.version, Some(1));

    let all = table.query_all(json!({}), QueryOptions::default()).await.unwrap();
    assert_same_rows(
        &all,
        &rows(&[json!({"_id": "1", "v": 100}), json!({"_id": "9", "v": 9})]),
    );
}

#[tokio::test]
async fn merge_on_miss_can_skip_rows() {
    let (_store, table) = setup_table("t").await;
    table.write(rows(&[json!({"_id": "1", "v": 1})])).await.unwrap();
    let result = table
        .merge(
            rows(&[json!({"_id": "neither", "v": 0})]),
            |existing, incoming| existing.get("_id") == incoming.get("_id"),
            |_, incoming| Some(incoming.clone()),
            |_| None,
        )
        .await
        .unwrap();
    assert_eq!(result.rows_inserted, 0);
    assert_eq!(result.version, Some(0));
}
