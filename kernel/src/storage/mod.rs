//! Abstract blob-store contract.
//!
//! The engine talks to storage exclusively through [`StorageBackend`]: opaque byte objects at
//! string paths, plus one synchronization primitive - [`StorageBackend::write_conditional`],
//! an atomic compare-and-set on a single object. Everything transactional in this crate hangs
//! off that one call; no in-process locking substitutes for it across processes.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DeltaResult;

pub mod fs;
pub mod memory;

pub use fs::FileSystemBackend;
pub use memory::InMemoryBackend;

/// Metadata for a stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectStat {
    pub size: u64,
    /// Milliseconds since the unix epoch.
    pub last_modified: i64,
    /// The backend's version token, when it can produce one without a second round trip.
    pub version: Option<String>,
}

#[async_trait]
pub trait StorageBackend: std::fmt::Debug + Send + Sync {
    /// Read the full object. Fails with `FileNotFound` if absent.
    async fn read(&self, path: &str) -> DeltaResult<Bytes>;

    /// Read the byte range `[start, end)`. Essential for columnar footer access.
    async fn read_range(&self, path: &str, start: u64, end: u64) -> DeltaResult<Bytes>;

    /// Idempotent overwrite.
    async fn write(&self, path: &str, data: Bytes) -> DeltaResult<()>;

    /// Idempotent delete; a missing object is not an error.
    async fn delete(&self, path: &str) -> DeltaResult<()>;

    async fn exists(&self, path: &str) -> DeltaResult<bool>;

    /// Every key under `prefix`. Order is unspecified but coverage is complete.
    async fn list(&self, prefix: &str) -> DeltaResult<Vec<String>>;

    async fn stat(&self, path: &str) -> DeltaResult<Option<ObjectStat>>;

    /// An opaque token that changes whenever the object's contents change and is stable
    /// between writes. `None` if the object is absent.
    async fn get_version(&self, path: &str) -> DeltaResult<Option<String>>;

    /// Atomically write iff the current version matches `expected_version` (`None` = iff the
    /// object is absent). Returns the new version token. Fails with `VersionMismatch`
    /// otherwise; that failure is not retryable at this layer.
    async fn write_conditional(
        &self,
        path: &str,
        data: Bytes,
        expected_version: Option<&str>,
    ) -> DeltaResult<String>;
}

/// Join two path segments with exactly one `/` between them.
pub fn join_path(base: &str, rel: &str) -> String {
    if base.is_empty() {
        return rel.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_normalizes_slashes() {
        assert_eq!(join_path("a/b", "c"), "a/b/c");
        assert_eq!(join_path("a/b/", "/c"), "a/b/c");
        assert_eq!(join_path("", "c"), "c");
    }
}
