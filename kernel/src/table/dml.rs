//! Update, delete and merge.
//!
//! All three are Remove+Add rewrites committed atomically. When deletion vectors are enabled
//! (instance option plus table feature), update and delete mark rows in a DV instead of
//! rewriting untouched data; a file whose DV grows to cover every row degenerates to a plain
//! Remove.

use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::actions::{Action, Add, Remove};
use crate::cdc::CdcRecord;
use crate::dv::DeletionVector;
use crate::error::{DeltaResult, Error};
use crate::query::{to_zone_predicates, file_can_skip, Filter};
use crate::row::{Row, Value};
use crate::schema::Schema;
use crate::table::{read_file_rows, write, DeltaTable, TableState};
use crate::table_features::WriterFeature;
use crate::utils::{current_time_millis, current_time_nanos};
use crate::Version;

/// A field-by-field mutation: `Some(v)` sets the field, `None` removes it.
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    entries: IndexMap<String, Option<Value>>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(field.into(), Some(value.into()));
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.entries.insert(field.into(), None);
        self
    }

    /// Every present key of a JSON object sets that field (nulls set null). Removing a field
    /// needs the explicit [`Mutation::unset`].
    pub fn from_json(json: &JsonValue) -> DeltaResult<Self> {
        let JsonValue::Object(map) = json else {
            return Err(Error::validation("mutation must be a JSON object"));
        };
        let mut mutation = Mutation::new();
        for (key, value) in map {
            mutation
                .entries
                .insert(key.clone(), Some(Value::from_json(value)));
        }
        Ok(mutation)
    }

    pub fn apply(&self, row: &Row) -> Row {
        let mut out = row.clone();
        for (field, value) in &self.entries {
            match value {
                Some(value) => {
                    out.insert(field.clone(), value.clone());
                }
                None => {
                    out.shift_remove(field);
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub version: Option<Version>,
    pub rows_updated: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteResult {
    pub version: Option<Version>,
    pub rows_deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeResult {
    pub version: Option<Version>,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
}

impl DeltaTable {
    fn dv_write_enabled(&self, state: &TableState) -> bool {
        self.inner.opts.deletion_vectors
            && state
                .snapshot
                .protocol()
                .is_some_and(|p| p.has_writer_feature(&WriterFeature::DeletionVectors))
    }

    /// Rewrite (or DV-mark) every row matching `filter` with `mutation` applied.
    pub async fn update(&self, filter: JsonValue, mutation: Mutation) -> DeltaResult<UpdateResult> {
        let filter = Filter::parse(&filter)?;
        let mut state = self.inner.state.lock().await;
        let schema = state.snapshot.schema()?;
        let candidates = candidate_files(&state, &filter);
        if candidates.is_empty() {
            return Ok(UpdateResult {
                version: state.snapshot.version(),
                rows_updated: 0,
            });
        }
        let use_dv = self.dv_write_enabled(&state);
        let partition_columns = state.snapshot.properties().partition_columns;

        let mut actions: Vec<Action> = Vec::new();
        let mut cdc_pairs: Vec<(Row, Row)> = Vec::new();
        let mut rows_updated = 0u64;
        // with DVs, every file's updated rows gather into one new file
        let mut dv_updated_rows: Vec<Row> = Vec::new();
        let mut rewrite_counter = 0usize;

        for add in candidates {
            if use_dv {
                let mut dv = match &add.deletion_vector {
                    Some(descriptor) => {
                        DeletionVector::from_descriptor(
                            descriptor,
                            self.inner.storage.as_ref(),
                            &self.inner.table_root,
                        )
                        .await?
                    }
                    None => DeletionVector::new(),
                };
                // DV indices are physical file positions, so match against the unfiltered
                // row order
                let all_rows = read_all_physical(self, &add, &schema).await?;
                let mut touched = false;
                for (idx, row) in all_rows.iter().enumerate() {
                    if dv.contains(idx as u32) {
                        continue;
                    }
                    if filter.matches(row) {
                        dv.insert(idx as u32);
                        let after = mutation.apply(row);
                        cdc_pairs.push((row.clone(), after.clone()));
                        dv_updated_rows.push(after);
                        rows_updated += 1;
                        touched = true;
                    }
                }
                if !touched {
                    continue;
                }
                actions.push(Action::Remove(Remove::for_add(
                    &add,
                    current_time_millis(),
                    true,
                )));
                if dv.cardinality() < all_rows.len() as u64 {
                    let descriptor = dv
                        .into_descriptor(self.inner.storage.as_ref(), &self.inner.table_root)
                        .await?;
                    actions.push(Action::Add(Add {
                        deletion_vector: Some(descriptor),
                        ..add.clone()
                    }));
                }
                // a DV covering the whole file stays a bare Remove
            } else {
                let rows = read_file_rows(&self.inner, &add, &[], None, &schema).await?;
                let mut matched = false;
                let mut new_rows = Vec::with_capacity(rows.len());
                for row in rows {
                    if filter.matches(&row) {
                        let after = mutation.apply(&row);
                        cdc_pairs.push((row, after.clone()));
                        new_rows.push(after);
                        rows_updated += 1;
                        matched = true;
                    } else {
                        new_rows.push(row);
                    }
                }
                if !matched {
                    continue;
                }
                actions.push(Action::Remove(Remove::for_add(
                    &add,
                    current_time_millis(),
                    true,
                )));
                if !new_rows.is_empty() {
                    let (values, schema) = rewrite_target(&state, &add, &partition_columns)?;
                    let new_add = write::write_data_file(
                        &self.inner,
                        &schema,
                        &partition_columns,
                        &values,
                        new_rows,
                        rewrite_counter,
                        None,
                    )
                    .await?;
                    rewrite_counter += 1;
                    actions.push(Action::Add(new_add));
                }
            }
        }

        if rows_updated == 0 {
            return Ok(UpdateResult {
                version: state.snapshot.version(),
                rows_updated: 0,
            });
        }
        if use_dv && !dv_updated_rows.is_empty() {
            let schema = effective_schema(&state)?;
            for (values, group_rows) in
                write::group_by_partition(&dv_updated_rows, &partition_columns)?
            {
                let new_add = write::write_data_file(
                    &self.inner,
                    &schema,
                    &partition_columns,
                    &values,
                    group_rows,
                    rewrite_counter,
                    None,
                )
                .await?;
                rewrite_counter += 1;
                actions.push(Action::Add(new_add));
            }
        }

        let cdc_records = self.update_cdc_records(&mut state, cdc_pairs);
        let version = self
            .commit_actions(&mut state, "UPDATE", actions, true, cdc_records)
            .await?;
        Ok(UpdateResult {
            version: Some(version),
            rows_updated,
        })
    }

    /// Delete every row matching `filter`.
    pub async fn delete(&self, filter: JsonValue) -> DeltaResult<DeleteResult> {
        let filter = Filter::parse(&filter)?;
        let mut state = self.inner.state.lock().await;
        let schema = state.snapshot.schema()?;
        let candidates = candidate_files(&state, &filter);
        let use_dv = self.dv_write_enabled(&state);
        let partition_columns = state.snapshot.properties().partition_columns;

        let mut actions: Vec<Action> = Vec::new();
        let mut deleted_rows: Vec<Row> = Vec::new();
        let mut rewrite_counter = 0usize;

        for add in candidates {
            if use_dv {
                let mut dv = match &add.deletion_vector {
                    Some(descriptor) => {
                        DeletionVector::from_descriptor(
                            descriptor,
                            self.inner.storage.as_ref(),
                            &self.inner.table_root,
                        )
                        .await?
                    }
                    None => DeletionVector::new(),
                };
                let all_rows = read_all_physical(self, &add, &schema).await?;
                let mut touched = false;
                for (idx, row) in all_rows.iter().enumerate() {
                    if dv.contains(idx as u32) {
                        continue;
                    }
                    if filter.matches(row) {
                        dv.insert(idx as u32);
                        deleted_rows.push(row.clone());
                        touched = true;
                    }
                }
                if !touched {
                    continue;
                }
                actions.push(Action::Remove(Remove::for_add(
                    &add,
                    current_time_millis(),
                    true,
                )));
                if dv.cardinality() < all_rows.len() as u64 {
                    let descriptor = dv
                        .into_descriptor(self.inner.storage.as_ref(), &self.inner.table_root)
                        .await?;
                    actions.push(Action::Add(Add {
                        deletion_vector: Some(descriptor),
                        ..add.clone()
                    }));
                }
            } else {
                let rows = read_file_rows(&self.inner, &add, &[], None, &schema).await?;
                let (gone, kept): (Vec<Row>, Vec<Row>) =
                    rows.into_iter().partition(|row| filter.matches(row));
                if gone.is_empty() {
                    continue;
                }
                deleted_rows.extend(gone);
                actions.push(Action::Remove(Remove::for_add(
                    &add,
                    current_time_millis(),
                    true,
                )));
                if !kept.is_empty() {
                    let (values, schema) = rewrite_target(&state, &add, &partition_columns)?;
                    let new_add = write::write_data_file(
                        &self.inner,
                        &schema,
                        &partition_columns,
                        &values,
                        kept,
                        rewrite_counter,
                        None,
                    )
                    .await?;
                    rewrite_counter += 1;
                    actions.push(Action::Add(new_add));
                }
            }
        }

        if deleted_rows.is_empty() {
            return Ok(DeleteResult {
                version: state.snapshot.version(),
                rows_deleted: 0,
            });
        }
        let rows_deleted = deleted_rows.len() as u64;
        let cdc_records = self.delete_cdc_records(&mut state, deleted_rows);
        let version = self
            .commit_actions(&mut state, "DELETE", actions, true, cdc_records)
            .await?;
        Ok(DeleteResult {
            version: Some(version),
            rows_deleted,
        })
    }

    /// Upsert: join `incoming` against the live rows with `predicate`; `on_match` maps
    /// (existing, incoming) to a replacement (`None` deletes), `on_miss` maps unmatched
    /// incoming rows to inserts (`None` skips). One commit carries the whole batch.
    pub async fn merge<P, M, I>(
        &self,
        incoming: Vec<Row>,
        predicate: P,
        on_match: M,
        on_miss: I,
    ) -> DeltaResult<MergeResult>
    where
        P: Fn(&Row, &Row) -> bool,
        M: Fn(&Row, &Row) -> Option<Row>,
        I: Fn(&Row) -> Option<Row>,
    {
        let mut state = self.inner.state.lock().await;
        let schema = state.snapshot.schema()?;
        let partition_columns = state.snapshot.properties().partition_columns;
        let files: Vec<Add> = state.snapshot.files().cloned().collect();

        // (file index, rows) with matches resolved against each live row at most once
        let mut file_rows: Vec<Vec<Row>> = Vec::with_capacity(files.len());
        for add in &files {
            file_rows.push(read_file_rows(&self.inner, add, &[], None, &schema).await?);
        }

        let mut result = MergeResult::default();
        let mut touched = vec![false; files.len()];
        let mut consumed: Vec<Vec<bool>> =
            file_rows.iter().map(|rows| vec![false; rows.len()]).collect();
        let mut replacements: Vec<Vec<Option<Option<Row>>>> = file_rows
            .iter()
            .map(|rows| vec![None; rows.len()])
            .collect();
        let mut inserts: Vec<Row> = Vec::new();
        let mut cdc_pairs: Vec<(Row, Row)> = Vec::new();
        let mut cdc_deletes: Vec<Row> = Vec::new();
        let mut cdc_inserts: Vec<Row> = Vec::new();

        'incoming: for row in &incoming {
            for (file_idx, rows) in file_rows.iter().enumerate() {
                for (row_idx, existing) in rows.iter().enumerate() {
                    if consumed[file_idx][row_idx] || !predicate(existing, row) {
                        continue;
                    }
                    consumed[file_idx][row_idx] = true;
                    touched[file_idx] = true;
                    match on_match(existing, row) {
                        Some(replacement) => {
                            cdc_pairs.push((existing.clone(), replacement.clone()));
                            replacements[file_idx][row_idx] = Some(Some(replacement));
                            result.rows_updated += 1;
                        }
                        None => {
                            cdc_deletes.push(existing.clone());
                            replacements[file_idx][row_idx] = Some(None);
                            result.rows_deleted += 1;
                        }
                    }
                    continue 'incoming;
                }
            }
            if let Some(insert) = on_miss(row) {
                cdc_inserts.push(insert.clone());
                inserts.push(insert);
                result.rows_inserted += 1;
            }
        }

        if result.rows_updated == 0 && result.rows_deleted == 0 && inserts.is_empty() {
            result.version = state.snapshot.version();
            return Ok(result);
        }

        let mut actions: Vec<Action> = Vec::new();
        let mut rewrite_counter = 0usize;
        for (file_idx, add) in files.iter().enumerate() {
            if !touched[file_idx] {
                continue;
            }
            let mut new_rows = Vec::with_capacity(file_rows[file_idx].len());
            for (row_idx, row) in file_rows[file_idx].iter().enumerate() {
                match &replacements[file_idx][row_idx] {
                    Some(Some(replacement)) => new_rows.push(replacement.clone()),
                    Some(None) => {}
                    None => new_rows.push(row.clone()),
                }
            }
            actions.push(Action::Remove(Remove::for_add(
                add,
                current_time_millis(),
                true,
            )));
            if !new_rows.is_empty() {
                let (values, schema) = rewrite_target(&state, add, &partition_columns)?;
                let new_add = write::write_data_file(
                    &self.inner,
                    &schema,
                    &partition_columns,
                    &values,
                    new_rows,
                    rewrite_counter,
                    None,
                )
                .await?;
                rewrite_counter += 1;
                actions.push(Action::Add(new_add));
            }
        }
        if !inserts.is_empty() {
            for (counter, (values, group_rows)) in write::group_by_partition(&inserts, &partition_columns)?
                .into_iter()
                .enumerate()
            {
                let schema = merge_insert_schema(&state, &group_rows)?;
                let new_add = write::write_data_file(
                    &self.inner,
                    &schema,
                    &partition_columns,
                    &values,
                    group_rows,
                    rewrite_counter + counter,
                    None,
                )
                .await?;
                actions.push(Action::Add(new_add));
            }
        }

        let mut cdc_records = self.update_cdc_records(&mut state, cdc_pairs);
        cdc_records.extend(self.delete_cdc_records(&mut state, cdc_deletes));
        if state.snapshot.properties().enable_change_data_feed {
            let ts = current_time_nanos();
            let source = self.cdc_source();
            for row in cdc_inserts {
                let seq = state.cdc_seq;
                state.cdc_seq += 1;
                cdc_records.push(CdcRecord::insert(row, seq, ts, &source, 0));
            }
        }

        let version = self
            .commit_actions(&mut state, "MERGE", actions, true, cdc_records)
            .await?;
        result.version = Some(version);
        Ok(result)
    }

    fn update_cdc_records(
        &self,
        state: &mut TableState,
        pairs: Vec<(Row, Row)>,
    ) -> Vec<CdcRecord> {
        if !state.snapshot.properties().enable_change_data_feed {
            return Vec::new();
        }
        let ts = current_time_nanos();
        let source = self.cdc_source();
        let mut records = Vec::with_capacity(pairs.len() * 2);
        for (before, after) in pairs {
            let seq = state.cdc_seq;
            state.cdc_seq += 2;
            records.extend(CdcRecord::update_pair(before, after, seq, ts, &source, 0));
        }
        records
    }

    fn delete_cdc_records(&self, state: &mut TableState, rows: Vec<Row>) -> Vec<CdcRecord> {
        if !state.snapshot.properties().enable_change_data_feed {
            return Vec::new();
        }
        let ts = current_time_nanos();
        let source = self.cdc_source();
        rows.into_iter()
            .map(|row| {
                let seq = state.cdc_seq;
                state.cdc_seq += 1;
                CdcRecord::delete(row, seq, ts, &source, 0)
            })
            .collect()
    }
}

fn candidate_files(state: &TableState, filter: &Filter) -> Vec<Add> {
    let predicates = to_zone_predicates(filter);
    state
        .snapshot
        .files()
        .filter(|add| match add.parsed_stats() {
            Some(stats) => !file_can_skip(&predicates, &stats),
            None => true,
        })
        .cloned()
        .collect()
}

fn effective_schema(state: &TableState) -> DeltaResult<Schema> {
    state
        .snapshot
        .schema()?
        .ok_or_else(|| Error::validation("table has no schema yet"))
}

/// Partition values (typed) and full table schema for rewriting one file in place.
fn rewrite_target(
    state: &TableState,
    add: &Add,
    partition_columns: &[String],
) -> DeltaResult<(Vec<Value>, Schema)> {
    let schema = effective_schema(state)?;
    let values = partition_columns
        .iter()
        .map(|col| {
            let data_type = schema
                .field(col)
                .map(|f| f.data_type)
                .unwrap_or(crate::schema::PrimitiveType::String);
            crate::table::parse_partition_value(
                add.partition_values.get(col).and_then(|v| v.as_deref()),
                data_type,
            )
        })
        .collect();
    Ok((values, schema))
}

fn merge_insert_schema(state: &TableState, rows: &[Row]) -> DeltaResult<Schema> {
    match state.snapshot.schema()? {
        Some(schema) => {
            for row in rows {
                schema.validate_row(row)?;
            }
            Ok(schema)
        }
        None => {
            let mut builder = crate::schema::SchemaBuilder::new();
            for row in rows {
                builder.observe_row(row)?;
            }
            builder.finish()
        }
    }
}

/// Every physical row of a file, in file order, deletion vector *not* applied.
async fn read_all_physical(
    table: &DeltaTable,
    add: &Add,
    schema: &Option<Schema>,
) -> DeltaResult<Vec<Row>> {
    let stripped = Add {
        deletion_vector: None,
        ..add.clone()
    };
    read_file_rows(&table.inner, &stripped, &[], None, schema).await
}
