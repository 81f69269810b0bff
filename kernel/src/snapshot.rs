//! Snapshots: the live state of a table at one version.
//!
//! Reconstruction is deterministic: the newest usable checkpoint at or below the target
//! version seeds the action set, then every commit file strictly after it (and at or below
//! the target) replays in version order. A checkpoint that turns out to be missing or corrupt
//! is abandoned in favor of full log replay from version zero.

use indexmap::IndexMap;

use crate::actions::{Action, Add, Metadata, Protocol, Remove};
use crate::error::{DeltaResult, Error};
use crate::log::checkpoint::read_checkpoint;
use crate::log::LogStore;
use crate::path::commit_path;
use crate::schema::Schema;
use crate::table_properties::TableProperties;
use crate::utils::require;
use crate::Version;

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// `None` only for a table whose log is still empty.
    version: Option<Version>,
    live: IndexMap<String, Add>,
    tombstones: IndexMap<String, Remove>,
    metadata: Option<Metadata>,
    protocol: Option<Protocol>,
}

impl Snapshot {
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// The surviving Add set, in first-added order.
    pub fn files(&self) -> impl Iterator<Item = &Add> {
        self.live.values()
    }

    pub fn file_count(&self) -> usize {
        self.live.len()
    }

    pub fn find_file(&self, path: &str) -> Option<&Add> {
        self.live.get(path)
    }

    /// Remove tombstones observed up to this version (newest per path).
    pub fn tombstones(&self) -> impl Iterator<Item = &Remove> {
        self.tombstones.values()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn protocol(&self) -> Option<&Protocol> {
        self.protocol.as_ref()
    }

    pub fn schema(&self) -> DeltaResult<Option<Schema>> {
        self.metadata
            .as_ref()
            .map(|m| m.parse_schema())
            .transpose()
    }

    pub fn properties(&self) -> TableProperties {
        self.metadata
            .as_ref()
            .map(|m| TableProperties::from(&m.configuration))
            .unwrap_or_default()
    }

    /// Apply one commit's actions on top of this snapshot.
    pub fn apply(&mut self, version: Version, actions: &[Action]) {
        for action in actions {
            match action {
                Action::Metadata(m) => self.metadata = Some(m.clone()),
                Action::Protocol(p) => self.protocol = Some(p.clone()),
                Action::Add(add) => {
                    self.tombstones.shift_remove(&add.path);
                    self.live.insert(add.path.clone(), add.clone());
                }
                Action::Remove(remove) => {
                    self.live.shift_remove(&remove.path);
                    self.tombstones.insert(remove.path.clone(), remove.clone());
                }
                Action::CommitInfo(_) => {} // surfaced by history, irrelevant to state
            }
        }
        self.version = Some(version);
    }

    /// The action set a checkpoint of this snapshot carries.
    pub fn checkpoint_actions(&self) -> Vec<Action> {
        let mut actions = Vec::with_capacity(2 + self.live.len() + self.tombstones.len());
        if let Some(protocol) = &self.protocol {
            actions.push(Action::Protocol(protocol.clone()));
        }
        if let Some(metadata) = &self.metadata {
            actions.push(Action::Metadata(metadata.clone()));
        }
        actions.extend(self.live.values().cloned().map(Action::Add));
        actions.extend(self.tombstones.values().cloned().map(Action::Remove));
        actions
    }

    /// Build the snapshot at `target` (or the latest version when `None`).
    pub async fn build(log: &LogStore, target: Option<Version>) -> DeltaResult<Snapshot> {
        let log_files = log.list_log_files().await?;
        let latest = log_files
            .iter()
            .filter(|p| p.is_commit())
            .map(|p| p.version)
            .max();
        let Some(latest) = latest else {
            require!(
                target.is_none(),
                Error::validation("cannot time-travel on a table with no commits")
            );
            return Ok(Snapshot::default());
        };
        let target = match target {
            Some(requested) => {
                require!(
                    requested <= latest,
                    Error::validation(format!(
                        "requested version {requested} is newer than latest version {latest}"
                    ))
                );
                requested
            }
            None => latest,
        };

        let mut snapshot = Snapshot::default();
        let mut baseline_version: Option<Version> = None;
        if let Some(hint) = log.read_last_checkpoint().await? {
            if hint.version <= target {
                match read_checkpoint(log, &hint).await {
                    Ok(actions) => {
                        snapshot.apply(hint.version, &actions);
                        baseline_version = Some(hint.version);
                    }
                    Err(e) => {
                        tracing::warn!(
                            version = hint.version,
                            "checkpoint unreadable, falling back to full log replay: {e}"
                        );
                    }
                }
            }
        }

        let replay_start = baseline_version.map(|v| v + 1).unwrap_or(0);
        let mut present: Vec<Version> = log_files
            .iter()
            .filter(|p| p.is_commit() && p.version >= replay_start && p.version <= target)
            .map(|p| p.version)
            .collect();
        present.sort_unstable();
        present.dedup();

        // the log must be dense over the replay range
        for (offset, version) in (replay_start..=target).enumerate() {
            if present.get(offset) != Some(&version) {
                return Err(Error::storage(
                    commit_path(log.table_root(), version),
                    "snapshot-replay",
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("log is missing version {version}"),
                    ),
                ));
            }
        }

        for version in replay_start..=target {
            let actions = match log.read_commit(version).await {
                Ok(actions) => actions,
                Err(err) if err.is_not_found() => {
                    // the listing said it was there; retry once against a fresh listing
                    log.list_log_files().await?;
                    log.read_commit(version).await.map_err(|err| {
                        if err.is_not_found() {
                            Error::storage(
                                commit_path(log.table_root(), version),
                                "snapshot-replay",
                                std::io::Error::new(
                                    std::io::ErrorKind::NotFound,
                                    "commit vanished during replay",
                                ),
                            )
                        } else {
                            err
                        }
                    })?
                }
                Err(err) => return Err(err),
            };
            snapshot.apply(version, &actions);
        }

        if let Some(protocol) = &snapshot.protocol {
            protocol.ensure_read_supported()?;
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::actions::CommitInfo;
    use crate::log::checkpoint::write_checkpoint;
    use crate::storage::InMemoryBackend;

    fn add(path: &str) -> Action {
        Action::Add(Add {
            path: path.to_string(),
            partition_values: HashMap::new(),
            size: 10,
            modification_time: 0,
            data_change: true,
            stats: None,
            tags: None,
            deletion_vector: None,
        })
    }

    fn remove(path: &str) -> Action {
        Action::Remove(Remove {
            path: path.to_string(),
            deletion_timestamp: Some(1),
            data_change: true,
            extended_file_metadata: None,
            partition_values: None,
            size: None,
            deletion_vector: None,
        })
    }

    fn test_log() -> LogStore {
        LogStore::new(Arc::new(InMemoryBackend::new()), "t")
    }

    #[tokio::test]
    async fn replay_applies_adds_and_removes_in_order() {
        let log = test_log();
        log.try_commit(0, &[Action::Protocol(Protocol::base()), add("a.parquet")])
            .await
            .unwrap();
        log.try_commit(1, &[add("b.parquet")]).await.unwrap();
        log.try_commit(2, &[remove("a.parquet"), add("c.parquet")])
            .await
            .unwrap();

        let snapshot = Snapshot::build(&log, None).await.unwrap();
        assert_eq!(snapshot.version(), Some(2));
        let files: Vec<_> = snapshot.files().map(|a| a.path.as_str()).collect();
        assert_eq!(files, vec!["b.parquet", "c.parquet"]);
        assert_eq!(snapshot.tombstones().count(), 1);
    }

    #[tokio::test]
    async fn time_travel_sees_exactly_older_state() {
        let log = test_log();
        log.try_commit(0, &[add("a.parquet")]).await.unwrap();
        log.try_commit(1, &[remove("a.parquet")]).await.unwrap();

        let v0 = Snapshot::build(&log, Some(0)).await.unwrap();
        assert_eq!(v0.file_count(), 1);
        let v1 = Snapshot::build(&log, Some(1)).await.unwrap();
        assert_eq!(v1.file_count(), 0);

        assert!(Snapshot::build(&log, Some(2)).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn empty_log_builds_an_empty_snapshot() {
        let log = test_log();
        let snapshot = Snapshot::build(&log, None).await.unwrap();
        assert_eq!(snapshot.version(), None);
        assert_eq!(snapshot.file_count(), 0);
        assert!(Snapshot::build(&log, Some(0)).await.is_err());
    }

    #[tokio::test]
    async fn checkpoint_baseline_equals_full_replay() {
        let log = test_log();
        log.try_commit(0, &[add("a.parquet"), add("b.parquet")])
            .await
            .unwrap();
        log.try_commit(1, &[remove("a.parquet")]).await.unwrap();

        let at_1 = Snapshot::build(&log, Some(1)).await.unwrap();
        let hint = write_checkpoint(&log, 1, &at_1.checkpoint_actions(), 1000)
            .await
            .unwrap();
        log.write_last_checkpoint(&hint).await;
        log.try_commit(2, &[add("c.parquet")]).await.unwrap();

        let with_checkpoint = Snapshot::build(&log, None).await.unwrap();
        let mut files: Vec<_> = with_checkpoint.files().map(|a| a.path.clone()).collect();
        files.sort();
        assert_eq!(files, vec!["b.parquet", "c.parquet"]);
        assert_eq!(with_checkpoint.version(), Some(2));
    }

    #[tokio::test]
    async fn corrupt_checkpoint_falls_back_to_replay() {
        let log = test_log();
        log.try_commit(0, &[add("a.parquet")]).await.unwrap();
        // _last_checkpoint names a checkpoint whose file does not exist
        log.write_last_checkpoint(&crate::log::LastCheckpointHint {
            version: 0,
            size: 1,
            parts: None,
            size_in_bytes: None,
            num_of_add_files: None,
        })
        .await;
        let snapshot = Snapshot::build(&log, None).await.unwrap();
        assert_eq!(snapshot.file_count(), 1);
    }

    #[tokio::test]
    async fn missing_commit_in_range_is_corruption() {
        let log = test_log();
        log.try_commit(0, &[add("a.parquet")]).await.unwrap();
        log.try_commit(1, &[add("b.parquet")]).await.unwrap();
        log.try_commit(2, &[add("c.parquet")]).await.unwrap();
        log.storage()
            .delete(&commit_path("t", 1))
            .await
            .unwrap();
        let err = Snapshot::build(&log, None).await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }

    #[tokio::test]
    async fn commit_info_does_not_disturb_state() {
        let log = test_log();
        log.try_commit(
            0,
            &[
                Action::CommitInfo(CommitInfo::new(0, "WRITE")),
                add("a.parquet"),
            ],
        )
        .await
        .unwrap();
        let snapshot = Snapshot::build(&log, None).await.unwrap();
        assert_eq!(snapshot.file_count(), 1);
    }
}
