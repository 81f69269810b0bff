//! The transaction log store.
//!
//! All log artifacts live under `<table>/_delta_log/`. Commits are serialized by the storage
//! backend's conditional write on the commit file name: version V lands iff
//! `<V padded to 20 digits>.json` did not already exist. That single create-iff-absent is the
//! engine's only synchronization primitive; losing the race surfaces as a
//! [`Error::Concurrency`] the caller may retry after refreshing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::actions::{parse_actions, serialize_actions, Action};
use crate::error::{DeltaResult, Error};
use crate::path::{commit_path, last_checkpoint_path, log_dir, ParsedLogPath};
use crate::storage::StorageBackend;
use crate::utils::require;
use crate::Version;

pub mod checkpoint;

/// The `_last_checkpoint` pointer: `{"version": n, "size": k, "parts"?: t, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastCheckpointHint {
    pub version: Version,
    /// Total action count in the checkpoint.
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_in_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_of_add_files: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct LogStore {
    storage: Arc<dyn StorageBackend>,
    table_root: String,
}

impl LogStore {
    pub fn new(storage: Arc<dyn StorageBackend>, table_root: impl Into<String>) -> Self {
        LogStore {
            storage,
            table_root: table_root.into(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn table_root(&self) -> &str {
        &self.table_root
    }

    /// List and parse every file under `_delta_log/`, sorted by (version, commit-last) so a
    /// replay can scan it in order.
    pub async fn list_log_files(&self) -> DeltaResult<Vec<ParsedLogPath>> {
        let prefix = format!("{}/", log_dir(&self.table_root));
        let listed = self.storage.list(&prefix).await?;
        let root_prefix = if self.table_root.is_empty() {
            String::new()
        } else {
            format!("{}/", self.table_root.trim_end_matches('/'))
        };
        let mut parsed: Vec<ParsedLogPath> = listed
            .iter()
            .filter_map(|path| {
                let rel = path.strip_prefix(&root_prefix).unwrap_or(path);
                ParsedLogPath::try_parse(rel)
            })
            .collect();
        parsed.sort_by_key(|p| (p.version, p.is_commit()));
        Ok(parsed)
    }

    /// Newest committed version, or `None` for an empty log.
    pub async fn latest_version(&self) -> DeltaResult<Option<Version>> {
        Ok(self
            .list_log_files()
            .await?
            .iter()
            .filter(|p| p.is_commit())
            .map(|p| p.version)
            .max())
    }

    /// Read and parse one commit file.
    pub async fn read_commit(&self, version: Version) -> DeltaResult<Vec<Action>> {
        let path = commit_path(&self.table_root, version);
        let bytes = self.storage.read(&path).await?;
        let body = std::str::from_utf8(&bytes)
            .map_err(|_| Error::validation(format!("commit {version} is not valid utf-8")))?;
        parse_actions(body)
    }

    /// Attempt to commit `actions` as `version`. The write is create-iff-absent; on a
    /// version-mismatch the newest version is re-read so the caller learns how far behind it
    /// is.
    pub async fn try_commit(&self, version: Version, actions: &[Action]) -> DeltaResult<()> {
        require!(
            !actions.is_empty(),
            Error::validation("refusing to commit an empty action list")
        );
        let path = commit_path(&self.table_root, version);
        let body = serialize_actions(actions)?;
        match self
            .storage
            .write_conditional(&path, body.into_bytes().into(), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_version_mismatch() => {
                let actual = self.latest_version().await?.unwrap_or(version);
                Err(Error::Concurrency {
                    expected: version.saturating_sub(1),
                    actual,
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn read_last_checkpoint(&self) -> DeltaResult<Option<LastCheckpointHint>> {
        let path = last_checkpoint_path(&self.table_root);
        match self.storage.read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<LastCheckpointHint>(&bytes) {
                Ok(hint) => Ok(Some(hint)),
                Err(e) => {
                    tracing::warn!("ignoring corrupt _last_checkpoint: {e}");
                    Ok(None)
                }
            },
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Best-effort overwrite of `_last_checkpoint`; failures are logged, not surfaced.
    pub async fn write_last_checkpoint(&self, hint: &LastCheckpointHint) {
        let path = last_checkpoint_path(&self.table_root);
        let body = match serde_json::to_vec(hint) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("could not serialize _last_checkpoint: {e}");
                return;
            }
        };
        if let Err(e) = self.storage.write(&path, body.into()).await {
            tracing::warn!("could not update _last_checkpoint: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::CommitInfo;
    use crate::storage::InMemoryBackend;

    fn commit_info() -> Vec<Action> {
        vec![Action::CommitInfo(CommitInfo::new(0, "TEST"))]
    }

    #[tokio::test]
    async fn commits_are_serialized_by_the_conditional_write() {
        let storage = Arc::new(InMemoryBackend::new());
        let log = LogStore::new(storage, "table");
        log.try_commit(0, &commit_info()).await.unwrap();
        let err = log.try_commit(0, &commit_info()).await.unwrap_err();
        let Error::Concurrency { expected, actual } = err else {
            panic!("expected a concurrency error");
        };
        assert_eq!((expected, actual), (0, 0));
        log.try_commit(1, &commit_info()).await.unwrap();
        assert_eq!(log.latest_version().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn read_commit_round_trips() {
        let storage = Arc::new(InMemoryBackend::new());
        let log = LogStore::new(storage, "table");
        let actions = commit_info();
        log.try_commit(0, &actions).await.unwrap();
        assert_eq!(log.read_commit(0).await.unwrap(), actions);
    }

    #[tokio::test]
    async fn log_listing_orders_by_version() {
        let storage = Arc::new(InMemoryBackend::new());
        let log = LogStore::new(storage, "t");
        for v in [2, 0, 1] {
            log.try_commit(v, &commit_info()).await.unwrap();
        }
        let versions: Vec<_> = log
            .list_log_files()
            .await
            .unwrap()
            .iter()
            .map(|p| p.version)
            .collect();
        assert_eq!(versions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn corrupt_last_checkpoint_reads_as_absent() {
        let storage = Arc::new(InMemoryBackend::new());
        storage
            .write("t/_delta_log/_last_checkpoint", "not json".into())
            .await
            .unwrap();
        let log = LogStore::new(storage, "t");
        assert_eq!(log.read_last_checkpoint().await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_checkpoint_round_trips() {
        let storage = Arc::new(InMemoryBackend::new());
        let log = LogStore::new(storage, "t");
        let hint = LastCheckpointHint {
            version: 9,
            size: 14,
            parts: Some(2),
            size_in_bytes: Some(1234),
            num_of_add_files: Some(7),
        };
        log.write_last_checkpoint(&hint).await;
        assert_eq!(log.read_last_checkpoint().await.unwrap(), Some(hint));
    }
}
