//! In-memory storage backend.
//!
//! The test backbone of the crate, but also a perfectly good backend for ephemeral tables.
//! Carries a handful of testing hooks: operation history capture, whole-state
//! snapshot/restore, simulated latency, a per-object size limit, and one-shot fault
//! injection keyed by operation kind.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{DeltaResult, Error};
use crate::storage::{ObjectStat, StorageBackend};
use crate::utils::current_time_millis;

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    version: u64,
    last_modified: i64,
}

/// Operation kinds recorded by the history hook and targeted by fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    ReadRange,
    Write,
    Delete,
    Exists,
    List,
    Stat,
    GetVersion,
    WriteConditional,
}

/// One recorded backend operation.
#[derive(Debug, Clone)]
pub struct OpRecord {
    pub kind: OpKind,
    pub path: String,
}

#[derive(Debug, Default)]
struct Hooks {
    history: Vec<OpRecord>,
    capture_history: bool,
    latency: Option<Duration>,
    max_object_size: Option<usize>,
    /// (kind, remaining failures, message)
    fail: Option<(OpKind, usize, String)>,
}

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    objects: Mutex<BTreeMap<String, Entry>>,
    next_version: AtomicU64,
    hooks: Mutex<Hooks>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording every operation; see [`InMemoryBackend::take_history`].
    pub fn capture_history(&self) {
        self.hooks.lock().unwrap().capture_history = true;
    }

    pub fn take_history(&self) -> Vec<OpRecord> {
        std::mem::take(&mut self.hooks.lock().unwrap().history)
    }

    /// Sleep this long inside every operation.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.hooks.lock().unwrap().latency = latency;
    }

    /// Reject writes larger than this many bytes.
    pub fn set_max_object_size(&self, limit: Option<usize>) {
        self.hooks.lock().unwrap().max_object_size = limit;
    }

    /// Make the next `count` operations of `kind` fail with a storage error.
    pub fn fail_next(&self, kind: OpKind, count: usize, message: impl Into<String>) {
        self.hooks.lock().unwrap().fail = Some((kind, count, message.into()));
    }

    /// Clone the entire key-value state.
    pub fn snapshot_state(&self) -> BTreeMap<String, Bytes> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .map(|(k, e)| (k.clone(), e.data.clone()))
            .collect()
    }

    /// Replace the entire key-value state. Version tokens continue from the current counter,
    /// so restored objects never reuse a token handed out before the snapshot.
    pub fn restore_state(&self, state: BTreeMap<String, Bytes>) {
        let mut objects = self.objects.lock().unwrap();
        objects.clear();
        let now = current_time_millis();
        for (path, data) in state {
            let version = self.next_version.fetch_add(1, Ordering::SeqCst);
            objects.insert(
                path,
                Entry {
                    data,
                    version,
                    last_modified: now,
                },
            );
        }
    }

    async fn before_op(&self, kind: OpKind, path: &str) -> DeltaResult<()> {
        let latency = {
            let mut hooks = self.hooks.lock().unwrap();
            if hooks.capture_history {
                hooks.history.push(OpRecord {
                    kind,
                    path: path.to_string(),
                });
            }
            if let Some((fail_kind, remaining, message)) = &mut hooks.fail {
                if *fail_kind == kind && *remaining > 0 {
                    *remaining -= 1;
                    let message = message.clone();
                    return Err(Error::storage(
                        path,
                        format!("{kind:?}"),
                        std::io::Error::other(message),
                    ));
                }
            }
            hooks.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn check_size(&self, path: &str, data: &Bytes) -> DeltaResult<()> {
        if let Some(limit) = self.hooks.lock().unwrap().max_object_size {
            if data.len() > limit {
                return Err(Error::storage(
                    path,
                    "write",
                    std::io::Error::other(format!(
                        "object size {} exceeds limit {limit}",
                        data.len()
                    )),
                ));
            }
        }
        Ok(())
    }

    fn insert(&self, objects: &mut BTreeMap<String, Entry>, path: &str, data: Bytes) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        objects.insert(
            path.to_string(),
            Entry {
                data,
                version,
                last_modified: current_time_millis(),
            },
        );
        version
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn read(&self, path: &str) -> DeltaResult<Bytes> {
        self.before_op(OpKind::Read, path).await?;
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .map(|e| e.data.clone())
            .ok_or_else(|| Error::file_not_found(path, "read"))
    }

    async fn read_range(&self, path: &str, start: u64, end: u64) -> DeltaResult<Bytes> {
        self.before_op(OpKind::ReadRange, path).await?;
        let objects = self.objects.lock().unwrap();
        let entry = objects
            .get(path)
            .ok_or_else(|| Error::file_not_found(path, "read_range"))?;
        let len = entry.data.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len) as usize;
        Ok(entry.data.slice(start..end.max(start)))
    }

    async fn write(&self, path: &str, data: Bytes) -> DeltaResult<()> {
        self.before_op(OpKind::Write, path).await?;
        self.check_size(path, &data)?;
        let mut objects = self.objects.lock().unwrap();
        self.insert(&mut objects, path, data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> DeltaResult<()> {
        self.before_op(OpKind::Delete, path).await?;
        self.objects.lock().unwrap().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> DeltaResult<bool> {
        self.before_op(OpKind::Exists, path).await?;
        Ok(self.objects.lock().unwrap().contains_key(path))
    }

    async fn list(&self, prefix: &str) -> DeltaResult<Vec<String>> {
        self.before_op(OpKind::List, prefix).await?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn stat(&self, path: &str) -> DeltaResult<Option<ObjectStat>> {
        self.before_op(OpKind::Stat, path).await?;
        Ok(self.objects.lock().unwrap().get(path).map(|e| ObjectStat {
            size: e.data.len() as u64,
            last_modified: e.last_modified,
            version: Some(e.version.to_string()),
        }))
    }

    async fn get_version(&self, path: &str) -> DeltaResult<Option<String>> {
        self.before_op(OpKind::GetVersion, path).await?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(path)
            .map(|e| e.version.to_string()))
    }

    async fn write_conditional(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<&str>,
    ) -> DeltaResult<String> {
        self.before_op(OpKind::WriteConditional, path).await?;
        self.check_size(path, &data)?;
        let mut objects = self.objects.lock().unwrap();
        let actual = objects.get(path).map(|e| e.version.to_string());
        match (expected_version, actual.as_deref()) {
            (None, None) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            _ => {
                return Err(Error::VersionMismatch {
                    path: path.to_string(),
                    expected: expected_version.map(str::to_string),
                    actual,
                })
            }
        }
        let version = self.insert(&mut objects, path, data);
        Ok(version.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conditional_create_fails_when_present() {
        let store = InMemoryBackend::new();
        store
            .write_conditional("a", Bytes::from_static(b"1"), None)
            .await
            .unwrap();
        let err = store
            .write_conditional("a", Bytes::from_static(b"2"), None)
            .await
            .unwrap_err();
        assert!(err.is_version_mismatch());
        assert_eq!(store.read("a").await.unwrap(), Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn conditional_replace_requires_matching_token() {
        let store = InMemoryBackend::new();
        let v1 = store
            .write_conditional("a", Bytes::from_static(b"1"), None)
            .await
            .unwrap();
        let v2 = store
            .write_conditional("a", Bytes::from_static(b"2"), Some(&v1))
            .await
            .unwrap();
        assert_ne!(v1, v2);
        assert!(store
            .write_conditional("a", Bytes::from_static(b"3"), Some(&v1))
            .await
            .unwrap_err()
            .is_version_mismatch());
    }

    #[tokio::test]
    async fn version_token_changes_on_every_write() {
        let store = InMemoryBackend::new();
        store.write("a", Bytes::from_static(b"1")).await.unwrap();
        let v1 = store.get_version("a").await.unwrap().unwrap();
        store.write("a", Bytes::from_static(b"2")).await.unwrap();
        let v2 = store.get_version("a").await.unwrap().unwrap();
        assert_ne!(v1, v2);
        // stable between writes
        assert_eq!(store.get_version("a").await.unwrap().unwrap(), v2);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryBackend::new();
        store.delete("missing").await.unwrap();
        store.write("a", Bytes::from_static(b"1")).await.unwrap();
        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn read_range_is_exclusive_end() {
        let store = InMemoryBackend::new();
        store.write("a", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(
            store.read_range("a", 1, 3).await.unwrap(),
            Bytes::from_static(b"el")
        );
    }

    #[tokio::test]
    async fn fault_injection_and_history() {
        let store = InMemoryBackend::new();
        store.capture_history();
        store.fail_next(OpKind::Read, 1, "boom");
        store.write("a", Bytes::from_static(b"1")).await.unwrap();
        assert!(store.read("a").await.is_err());
        assert_eq!(store.read("a").await.unwrap(), Bytes::from_static(b"1"));
        let history = store.take_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].kind, OpKind::Write);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trips() {
        let store = InMemoryBackend::new();
        store.write("a", Bytes::from_static(b"1")).await.unwrap();
        let state = store.snapshot_state();
        store.write("a", Bytes::from_static(b"2")).await.unwrap();
        store.restore_state(state);
        assert_eq!(store.read("a").await.unwrap(), Bytes::from_static(b"1"));
    }
}
