//! Keys and metadata for cached entries.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::repo::{ContentKind, RepositoryIdentity};

/// Unique key of a cached file: (repository, branch, path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  pub repo: RepositoryIdentity,
  pub branch: String,
  pub path: String,
}

impl CacheKey {
  /// Build a key, normalizing the path to have no leading or doubled slashes.
  pub fn new(repo: RepositoryIdentity, branch: impl Into<String>, path: &str) -> Self {
    let path = path
      .split('/')
      .filter(|s| !s.is_empty())
      .collect::<Vec<_>>()
      .join("/");
    Self {
      repo,
      branch: branch.into(),
      path,
    }
  }

  /// Blob location relative to the cache root:
  /// `blobs/<repo-id>/<branch>/<path-hash>`.
  pub fn blob_path(&self) -> PathBuf {
    let branch: String = url::form_urlencoded::byte_serialize(self.branch.as_bytes()).collect();
    let path_hash = hex::encode(Sha256::digest(self.path.as_bytes()));
    PathBuf::from("blobs")
      .join(self.repo.partition_id())
      .join(branch)
      .join(path_hash)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}:{}", self.repo, self.branch, self.path)
  }
}

/// Which entries an aggregate operation covers.
#[derive(Debug, Clone, Copy)]
pub enum Partition<'a> {
  Repository(&'a RepositoryIdentity),
  All,
}

/// Index metadata for one cached file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
  pub key: CacheKey,
  pub size: u64,
  /// Hex SHA-256 of the content
  pub checksum: String,
  /// Unix milliseconds
  pub fetched_at: i64,
  /// Unix milliseconds
  pub last_accessed_at: i64,
  pub revalidation_tag: Option<String>,
  pub content_kind: ContentKind,
}

impl EntryMeta {
  pub fn fetched_at_utc(&self) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(self.fetched_at).unwrap_or_default()
  }
}

/// Content plus metadata returned by a cache read.
#[derive(Debug, Clone)]
pub struct CachedFile {
  pub content: Bytes,
  pub meta: EntryMeta,
}

/// Eviction candidate, as listed by LRU iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LruEntry {
  pub key: CacheKey,
  pub size: u64,
  pub last_accessed_at: i64,
  pub fetched_at: i64,
}

/// Result of reconciling the index against the blob directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  /// Index rows whose blob was missing or had the wrong size
  pub dropped_entries: u64,
  /// Blob files no index row referenced
  pub orphan_blobs: u64,
  /// Leftover partial writes
  pub stale_temp_files: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionStats {
  pub repository: String,
  pub entries: u64,
  pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub entries: u64,
  pub bytes: u64,
  pub partitions: Vec<PartitionStats>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn repo() -> RepositoryIdentity {
    RepositoryIdentity::parse("https://github.com/octo/docs").unwrap()
  }

  #[test]
  fn test_path_is_normalized() {
    let a = CacheKey::new(repo(), "main", "/docs//guide.md");
    let b = CacheKey::new(repo(), "main", "docs/guide.md");
    assert_eq!(a, b);
    assert_eq!(a.path, "docs/guide.md");
  }

  #[test]
  fn test_blob_path_layout() {
    let key = CacheKey::new(repo(), "feature/x", "README.md");
    let path = key.blob_path();
    let parts: Vec<_> = path.iter().map(|p| p.to_string_lossy().to_string()).collect();
    assert_eq!(parts[0], "blobs");
    assert_eq!(parts[1], repo().partition_id());
    assert_eq!(parts[2], "feature%2Fx");
    assert_eq!(parts[3].len(), 64);
  }
}
