//! Local-filesystem storage backend.
//!
//! Conditional create relies on `O_EXCL` (`create_new`), which is atomic on every platform we
//! care about. Conditional replace is a re-check + temp-file + rename; that is only safe for
//! writers within a single process, which is the deployment this backend targets. Cross-process
//! multi-writer setups need a backend whose compare-and-set is genuinely atomic.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{DeltaResult, Error};
use crate::storage::{ObjectStat, StorageBackend};

#[derive(Debug)]
pub struct FileSystemBackend {
    root: PathBuf,
}

impl FileSystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn version_token(meta: &std::fs::Metadata) -> String {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        format!("{mtime}-{}", meta.len())
    }

    async fn stat_inner(&self, path: &str) -> DeltaResult<Option<std::fs::Metadata>> {
        match tokio::fs::metadata(self.full_path(path)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(path, "stat", e)),
        }
    }

    async fn ensure_parent(&self, full: &Path, path: &str) -> DeltaResult<()> {
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(path, "mkdir", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileSystemBackend {
    async fn read(&self, path: &str) -> DeltaResult<Bytes> {
        match tokio::fs::read(self.full_path(path)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::file_not_found(path, "read"))
            }
            Err(e) => Err(Error::storage(path, "read", e)),
        }
    }

    async fn read_range(&self, path: &str, start: u64, end: u64) -> DeltaResult<Bytes> {
        // single read + slice: table data files are read whole anyway, and the local page
        // cache makes a positioned read a non-optimization here
        let data = self.read(path).await?;
        let len = data.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len) as usize;
        Ok(data.slice(start..end.max(start)))
    }

    async fn write(&self, path: &str, data: Bytes) -> DeltaResult<()> {
        let full = self.full_path(path);
        self.ensure_parent(&full, path).await?;
        tokio::fs::write(&full, &data)
            .await
            .map_err(|e| Error::storage(path, "write", e))
    }

    async fn delete(&self, path: &str) -> DeltaResult<()> {
        match tokio::fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(path, "delete", e)),
        }
    }

    async fn exists(&self, path: &str) -> DeltaResult<bool> {
        Ok(self.stat_inner(path).await?.is_some())
    }

    async fn list(&self, prefix: &str) -> DeltaResult<Vec<String>> {
        // walk from the deepest existing directory at or above the prefix
        let (dir, _) = match prefix.rfind('/') {
            Some(idx) => (self.root.join(&prefix[..idx]), &prefix[idx + 1..]),
            None => (self.root.clone(), prefix),
        };
        let mut results = Vec::new();
        let mut stack = vec![dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::storage(dir.display().to_string(), "list", e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::storage(prefix, "list", e))?
            {
                let entry_path = entry.path();
                if entry_path.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                if let Ok(rel) = entry_path.strip_prefix(&self.root) {
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    if rel.starts_with(prefix) {
                        results.push(rel);
                    }
                }
            }
        }
        Ok(results)
    }

    async fn stat(&self, path: &str) -> DeltaResult<Option<ObjectStat>> {
        Ok(self.stat_inner(path).await?.map(|meta| {
            let last_modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            ObjectStat {
                size: meta.len(),
                last_modified,
                version: Some(Self::version_token(&meta)),
            }
        }))
    }

    async fn get_version(&self, path: &str) -> DeltaResult<Option<String>> {
        Ok(self
            .stat_inner(path)
            .await?
            .map(|meta| Self::version_token(&meta)))
    }

    async fn write_conditional(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<&str>,
    ) -> DeltaResult<String> {
        let full = self.full_path(path);
        self.ensure_parent(&full, path).await?;
        match expected_version {
            None => {
                let mut options = tokio::fs::OpenOptions::new();
                options.write(true).create_new(true);
                match options.open(&full).await {
                    Ok(file) => {
                        let mut file = file;
                        use tokio::io::AsyncWriteExt;
                        file.write_all(&data)
                            .await
                            .map_err(|e| Error::storage(path, "write_conditional", e))?;
                        file.sync_all()
                            .await
                            .map_err(|e| Error::storage(path, "write_conditional", e))?;
                    }
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        return Err(Error::VersionMismatch {
                            path: path.to_string(),
                            expected: None,
                            actual: self.get_version(path).await?,
                        })
                    }
                    Err(e) => return Err(Error::storage(path, "write_conditional", e)),
                }
            }
            Some(expected) => {
                let actual = self.get_version(path).await?;
                if actual.as_deref() != Some(expected) {
                    return Err(Error::VersionMismatch {
                        path: path.to_string(),
                        expected: Some(expected.to_string()),
                        actual,
                    });
                }
                let tmp = full.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
                tokio::fs::write(&tmp, &data)
                    .await
                    .map_err(|e| Error::storage(path, "write_conditional", e))?;
                tokio::fs::rename(&tmp, &full)
                    .await
                    .map_err(|e| Error::storage(path, "write_conditional", e))?;
            }
        }
        self.get_version(path)
            .await?
            .ok_or_else(|| Error::internal("conditional write left no object behind"))
    }
}
