//! The capability object handed to maintenance operators.
//!
//! Maintenance never touches table internals directly: it reads files, consults snapshots
//! and commits Remove+Add batches through this context, which also hosts the file-content
//! cache maintenance can use to avoid re-reading inputs it just scanned.

use std::sync::Arc;

use crate::actions::{Action, Add};
use crate::error::DeltaResult;
use crate::row::Row;
use crate::snapshot::Snapshot;
use crate::storage::StorageBackend;
use crate::table::{read_file_rows, DeltaTable};
use crate::Version;

#[derive(Clone)]
pub struct MaintenanceContext {
    table: DeltaTable,
}

impl MaintenanceContext {
    pub(crate) fn new(table: DeltaTable) -> Self {
        MaintenanceContext { table }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        self.table.storage()
    }

    pub fn table_path(&self) -> &str {
        self.table.table_path()
    }

    pub async fn version(&self) -> Option<Version> {
        self.table.version().await
    }

    pub async fn snapshot(&self, version: Option<Version>) -> DeltaResult<Snapshot> {
        self.table.snapshot(version).await
    }

    /// Surviving rows of one live file (deletion vector applied, partition values
    /// re-injected), through the table's file-content cache.
    pub async fn read_file(&self, add: &Add) -> DeltaResult<Vec<Row>> {
        {
            let state = self.table.inner.state.lock().await;
            if let Some(rows) = state.file_cache.get(&add.path) {
                return Ok(rows.clone());
            }
        }
        let schema = {
            let state = self.table.inner.state.lock().await;
            state.snapshot.schema()?
        };
        let rows = read_file_rows(&self.table.inner, add, &[], None, &schema).await?;
        self.cache_file(&add.path, rows.clone()).await;
        Ok(rows)
    }

    pub async fn cache_file(&self, path: &str, rows: Vec<Row>) {
        self.table
            .inner
            .state
            .lock()
            .await
            .file_cache
            .insert(path.to_string(), rows);
    }

    pub async fn uncache_file(&self, path: &str) {
        self.table
            .inner
            .state
            .lock()
            .await
            .file_cache
            .remove(path);
    }

    /// Every live row in the table, per file.
    pub async fn query_all(&self) -> DeltaResult<Vec<(Add, Vec<Row>)>> {
        let files: Vec<Add> = {
            let state = self.table.inner.state.lock().await;
            state.snapshot.files().cloned().collect()
        };
        let mut out = Vec::with_capacity(files.len());
        for add in files {
            let rows = self.read_file(&add).await?;
            out.push((add, rows));
        }
        Ok(out)
    }

    /// Commit a maintenance action batch; evicts rewritten paths from the file cache.
    pub async fn commit(&self, operation: &str, actions: Vec<Action>) -> DeltaResult<Version> {
        let mut state = self.table.inner.state.lock().await;
        for action in &actions {
            if let Action::Remove(remove) = action {
                state.file_cache.remove(&remove.path);
            }
        }
        self.table
            .commit_actions(&mut state, operation, actions, true, Vec::new())
            .await
    }

    pub(crate) fn table(&self) -> &DeltaTable {
        &self.table
    }
}
