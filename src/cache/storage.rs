//! Cache store: a SQLite index plus one blob file per cached entry.
//!
//! Layout under the cache root:
//!
//! ```text
//! index                                  SQLite metadata store
//! blobs/<repo-id>/<branch>/<path-hash>   content of one entry
//! tmp/                                   partial writes, renamed into blobs/
//! ```
//!
//! All index mutations go through one mutex-guarded connection, and a
//! write only becomes visible once its blob has been renamed into place
//! inside the same transaction that records it.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::repo::{ContentKind, Provider, RecentRepository, RepositoryIdentity};

use super::types::{
  CacheKey, CacheStats, CachedFile, EntryMeta, LruEntry, Partition, PartitionStats,
  ReconcileReport,
};

const INDEX_FILE: &str = "index";
const BLOB_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";

/// Schema for the cache index.
const INDEX_SCHEMA: &str = r#"
-- One row per cached file
CREATE TABLE IF NOT EXISTS cache_entries (
    repo TEXT NOT NULL,
    branch TEXT NOT NULL,
    path TEXT NOT NULL,
    blob TEXT NOT NULL,
    size INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    fetched_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL,
    revalidation_tag TEXT,
    content_kind TEXT NOT NULL,
    PRIMARY KEY (repo, branch, path)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_lru
    ON cache_entries(last_accessed_at, fetched_at);

-- Branch lists and file trees, kept for offline browsing
CREATE TABLE IF NOT EXISTS listings (
    repo TEXT NOT NULL,
    scope TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload BLOB NOT NULL,
    fetched_at INTEGER NOT NULL,
    PRIMARY KEY (repo, scope, kind)
);

-- Recently connected repositories
CREATE TABLE IF NOT EXISTS repositories (
    repo TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    default_branch TEXT,
    last_connected_at INTEGER NOT NULL
);
"#;

/// Kind of listing stored alongside file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingKind {
  Branches,
  Tree,
}

impl ListingKind {
  fn as_str(&self) -> &'static str {
    match self {
      ListingKind::Branches => "branches",
      ListingKind::Tree => "tree",
    }
  }
}

/// A listing read back from the index.
#[derive(Debug, Clone)]
pub struct CachedListing<T> {
  pub items: T,
  pub fetched_at: DateTime<Utc>,
}

/// Why a stored entry could not be served.
#[derive(Debug, thiserror::Error)]
enum Corruption {
  #[error("blob file is missing")]
  MissingBlob,
  #[error("blob holds {actual} bytes, index expects {expected}")]
  SizeMismatch { expected: u64, actual: u64 },
  #[error("blob checksum does not match the index")]
  ChecksumMismatch,
}

struct Index {
  conn: Connection,
  /// Last issued access stamp; stamps are strictly increasing
  last_stamp: i64,
}

impl Index {
  fn next_stamp(&mut self, now: i64) -> i64 {
    let stamp = now.max(self.last_stamp + 1);
    self.last_stamp = stamp;
    stamp
  }
}

struct StoreInner {
  root: PathBuf,
  index: Mutex<Index>,
  clock: Arc<dyn Clock>,
  /// Keys with a fetch-and-write in flight; never eviction targets
  pinned: Mutex<HashMap<CacheKey, usize>>,
}

/// Durable, content-verified store of cached repository files.
#[derive(Clone)]
pub struct CacheStore {
  inner: Arc<StoreInner>,
}

impl CacheStore {
  /// Open (or create) a store rooted at `root`.
  ///
  /// Call [`CacheStore::reconcile`] before the first concurrent writer
  /// starts to clean up after a crash.
  pub fn open(root: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
    let root = root.as_ref().to_path_buf();
    for dir in [root.clone(), root.join(BLOB_DIR), root.join(TMP_DIR)] {
      fs::create_dir_all(&dir)
        .map_err(|e| eyre!("Failed to create cache directory {}: {}", dir.display(), e))?;
    }

    let path = root.join(INDEX_FILE);
    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache index at {}: {}", path.display(), e))?;

    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to enable WAL journal: {}", e))?;
    conn
      .pragma_update(None, "synchronous", "FULL")
      .map_err(|e| eyre!("Failed to set synchronous mode: {}", e))?;
    conn
      .execute_batch(INDEX_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    let last_stamp: i64 = conn
      .query_row(
        "SELECT COALESCE(MAX(last_accessed_at), 0) FROM cache_entries",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to read access stamps: {}", e))?;

    debug!(root = %root.display(), "opened cache store");

    Ok(Self {
      inner: Arc::new(StoreInner {
        root,
        index: Mutex::new(Index { conn, last_stamp }),
        clock,
        pinned: Mutex::new(HashMap::new()),
      }),
    })
  }

  pub fn root(&self) -> &Path {
    &self.inner.root
  }

  fn lock_index(&self) -> Result<MutexGuard<'_, Index>> {
    self
      .inner
      .index
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Read an entry and mark it as accessed.
  ///
  /// The blob is read and hashed without holding the index lock. The row is
  /// then re-checked under the lock: if a writer replaced it meanwhile, the
  /// read is repeated under the lock against the new row. An entry whose
  /// blob is missing or fails verification is dropped and reported as a
  /// miss.
  pub fn get(&self, key: &CacheKey) -> Result<Option<CachedFile>> {
    let found = {
      let index = self.lock_index()?;
      select_entry(&index.conn, key)?
    };
    let Some((meta, blob)) = found else {
      return Ok(None);
    };
    let checked = read_verified(&self.inner.root.join(&blob), &meta)?;

    let mut index = self.lock_index()?;
    let Some((current, current_blob)) = select_entry(&index.conn, key)? else {
      return Ok(None);
    };
    // Every put issues a fresh stamp, so an unchanged stamp means the bytes
    // read above belong to this row
    let checked = if current.fetched_at == meta.fetched_at && current_blob == blob {
      checked
    } else {
      debug!(key = %key, "entry replaced during read, reading again");
      read_verified(&self.inner.root.join(&current_blob), &current)?
    };
    self.finish_get(&mut index, current, &current_blob, checked)
  }

  /// Stamp a verified read, or drop a corrupt entry. Runs under the lock
  /// that confirmed `meta` is the current row.
  fn finish_get(
    &self,
    index: &mut Index,
    mut meta: EntryMeta,
    blob: &str,
    checked: std::result::Result<Bytes, Corruption>,
  ) -> Result<Option<CachedFile>> {
    let key = meta.key.clone();
    match checked {
      Ok(content) => {
        let stamp = index.next_stamp(self.inner.clock.unix_millis());
        index
          .conn
          .execute(
            "UPDATE cache_entries SET last_accessed_at = ?1
             WHERE repo = ?2 AND branch = ?3 AND path = ?4",
            params![stamp, key.repo.as_str(), key.branch, key.path],
          )
          .map_err(|e| eyre!("Failed to update access time: {}", e))?;
        meta.last_accessed_at = stamp;
        Ok(Some(CachedFile { content, meta }))
      }
      Err(corruption) => {
        warn!(key = %key, reason = %corruption, "dropping corrupt cache entry");
        index
          .conn
          .execute(
            "DELETE FROM cache_entries WHERE repo = ?1 AND branch = ?2 AND path = ?3",
            params![key.repo.as_str(), key.branch, key.path],
          )
          .map_err(|e| eyre!("Failed to drop corrupt entry: {}", e))?;
        remove_blob(&self.inner.root.join(blob))?;
        Ok(None)
      }
    }
  }

  /// Metadata of an entry without touching its access time.
  pub fn peek(&self, key: &CacheKey) -> Result<Option<EntryMeta>> {
    let index = self.lock_index()?;
    Ok(select_entry(&index.conn, key)?.map(|(meta, _)| meta))
  }

  /// Store `content` under `key`, replacing any previous entry.
  ///
  /// The blob is written and synced under `tmp/`, then renamed into place
  /// inside the index transaction that records it.
  pub fn put(
    &self,
    key: &CacheKey,
    content: &[u8],
    revalidation_tag: Option<&str>,
  ) -> Result<EntryMeta> {
    let checksum = hex::encode(Sha256::digest(content));
    let content_kind = ContentKind::detect(content);
    let relative = key.blob_path();
    let dest = self.inner.root.join(&relative);

    let tmp = self.write_temp(content)?;
    let result = self.commit_put(
      key,
      &relative,
      &dest,
      &tmp,
      content.len() as u64,
      checksum,
      content_kind,
      revalidation_tag,
    );
    if result.is_err() {
      let _ = fs::remove_file(&tmp);
    }
    result
  }

  fn write_temp(&self, content: &[u8]) -> Result<PathBuf> {
    let name = format!("{}.part", hex::encode(rand::random::<[u8; 8]>()));
    let tmp = self.inner.root.join(TMP_DIR).join(name);

    let mut file = File::create(&tmp)
      .map_err(|e| eyre!("Failed to create temp blob {}: {}", tmp.display(), e))?;
    let written = file.write_all(content).and_then(|_| file.sync_all());
    if let Err(e) = written {
      let _ = fs::remove_file(&tmp);
      return Err(eyre!("Failed to write temp blob {}: {}", tmp.display(), e));
    }
    Ok(tmp)
  }

  #[allow(clippy::too_many_arguments)]
  fn commit_put(
    &self,
    key: &CacheKey,
    relative: &Path,
    dest: &Path,
    tmp: &Path,
    size: u64,
    checksum: String,
    content_kind: ContentKind,
    revalidation_tag: Option<&str>,
  ) -> Result<EntryMeta> {
    let mut index = self.lock_index()?;
    let stamp = index.next_stamp(self.inner.clock.unix_millis());

    let tx = index
      .conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (repo, branch, path, blob, size, checksum, fetched_at, last_accessed_at, revalidation_tag, content_kind)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8, ?9)",
      params![
        key.repo.as_str(),
        key.branch,
        key.path,
        relative.to_string_lossy(),
        size as i64,
        checksum,
        stamp,
        revalidation_tag,
        content_kind.as_str(),
      ],
    )
    .map_err(|e| eyre!("Failed to record cache entry: {}", e))?;

    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create blob directory {}: {}", parent.display(), e))?;
    }
    fs::rename(tmp, dest).map_err(|e| {
      eyre!(
        "Failed to move blob into place ({} -> {}): {}",
        tmp.display(),
        dest.display(),
        e
      )
    })?;
    if let Some(parent) = dest.parent() {
      sync_dir(parent);
    }

    // A failed commit after the rename leaves the previous row pointing at
    // the new bytes; the checksum check on the next read drops it.
    tx.commit()
      .map_err(|e| eyre!("Failed to commit cache entry: {}", e))?;

    debug!(key = %key, size, "stored cache entry");

    Ok(EntryMeta {
      key: key.clone(),
      size,
      checksum,
      fetched_at: stamp,
      last_accessed_at: stamp,
      revalidation_tag: revalidation_tag.map(String::from),
      content_kind,
    })
  }

  /// Re-stamp an entry the remote confirmed unchanged.
  pub fn mark_revalidated(&self, key: &CacheKey) -> Result<bool> {
    let mut index = self.lock_index()?;
    let stamp = index.next_stamp(self.inner.clock.unix_millis());
    let updated = index
      .conn
      .execute(
        "UPDATE cache_entries SET fetched_at = ?1, last_accessed_at = ?1
         WHERE repo = ?2 AND branch = ?3 AND path = ?4",
        params![stamp, key.repo.as_str(), key.branch, key.path],
      )
      .map_err(|e| eyre!("Failed to re-stamp entry: {}", e))?;
    Ok(updated > 0)
  }

  /// Remove an entry. Removing a missing key is not an error.
  pub fn delete(&self, key: &CacheKey) -> Result<bool> {
    Ok(self.delete_many(std::slice::from_ref(key))? > 0)
  }

  /// Remove several entries in one transaction, returning how many existed.
  pub fn delete_many(&self, keys: &[CacheKey]) -> Result<u64> {
    if keys.is_empty() {
      return Ok(0);
    }

    let mut index = self.lock_index()?;
    let tx = index
      .conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut blobs = Vec::new();
    for key in keys {
      let blob: Option<String> = tx
        .query_row(
          "DELETE FROM cache_entries WHERE repo = ?1 AND branch = ?2 AND path = ?3
           RETURNING blob",
          params![key.repo.as_str(), key.branch, key.path],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
      blobs.extend(blob);
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit deletion: {}", e))?;

    for blob in &blobs {
      remove_blob(&self.inner.root.join(blob))?;
    }
    Ok(blobs.len() as u64)
  }

  /// Remove every entry (and listing) of a repository, or of one branch.
  pub fn invalidate(&self, repo: &RepositoryIdentity, branch: Option<&str>) -> Result<u64> {
    let mut index = self.lock_index()?;
    let tx = index
      .conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let blobs: Vec<String> = {
      let mut stmt = tx
        .prepare(
          "DELETE FROM cache_entries WHERE repo = ?1 AND (?2 IS NULL OR branch = ?2)
           RETURNING blob",
        )
        .map_err(|e| eyre!("Failed to prepare invalidation: {}", e))?;
      let rows = stmt
        .query_map(params![repo.as_str(), branch], |row| row.get(0))
        .map_err(|e| eyre!("Failed to invalidate entries: {}", e))?;
      rows
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to invalidate entries: {}", e))?
    };

    match branch {
      // The branch list itself stays valid when one branch is dropped
      Some(branch) => tx.execute(
        "DELETE FROM listings WHERE repo = ?1 AND scope = ?2",
        params![repo.as_str(), branch],
      ),
      None => tx.execute("DELETE FROM listings WHERE repo = ?1", params![repo.as_str()]),
    }
    .map_err(|e| eyre!("Failed to invalidate listings: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit invalidation: {}", e))?;

    // Still under the index lock: a put of the same key renames its blob
    // into these directories while holding it.
    for blob in &blobs {
      remove_blob(&self.inner.root.join(blob))?;
    }
    let partition_dir = self.inner.root.join(BLOB_DIR).join(repo.partition_id());
    prune_empty_dirs(&partition_dir);
    drop(index);

    info!(repo = %repo, branch = ?branch, removed = blobs.len(), "invalidated cache entries");
    Ok(blobs.len() as u64)
  }

  /// Total bytes held by a partition.
  pub fn size_of(&self, partition: Partition<'_>) -> Result<u64> {
    let index = self.lock_index()?;
    let size: i64 = match partition {
      Partition::Repository(repo) => index.conn.query_row(
        "SELECT COALESCE(SUM(size), 0) FROM cache_entries WHERE repo = ?1",
        params![repo.as_str()],
        |row| row.get(0),
      ),
      Partition::All => index.conn.query_row(
        "SELECT COALESCE(SUM(size), 0) FROM cache_entries",
        [],
        |row| row.get(0),
      ),
    }
    .map_err(|e| eyre!("Failed to sum cache size: {}", e))?;
    Ok(size as u64)
  }

  /// Entries in ascending last-access order, ties broken by fetch time and
  /// then by key.
  pub fn iterate_by_last_access(&self, partition: Partition<'_>) -> Result<Vec<LruEntry>> {
    let index = self.lock_index()?;
    let repo = match partition {
      Partition::Repository(repo) => Some(repo.as_str()),
      Partition::All => None,
    };

    let mut stmt = index
      .conn
      .prepare(
        "SELECT repo, branch, path, size, last_accessed_at, fetched_at FROM cache_entries
         WHERE ?1 IS NULL OR repo = ?1
         ORDER BY last_accessed_at ASC, fetched_at ASC, repo ASC, branch ASC, path ASC",
      )
      .map_err(|e| eyre!("Failed to prepare LRU query: {}", e))?;

    let rows = stmt
      .query_map(params![repo], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, i64>(3)?,
          row.get::<_, i64>(4)?,
          row.get::<_, i64>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query LRU order: {}", e))?;

    let mut entries = Vec::new();
    for row in rows {
      let (repo, branch, path, size, last_accessed_at, fetched_at) =
        row.map_err(|e| eyre!("Failed to read LRU row: {}", e))?;
      let Ok(identity) = RepositoryIdentity::parse(&repo) else {
        warn!(repo, "skipping cache entry with unparseable repository");
        continue;
      };
      entries.push(LruEntry {
        key: CacheKey {
          repo: identity,
          branch,
          path,
        },
        size: size as u64,
        last_accessed_at,
        fetched_at,
      });
    }
    Ok(entries)
  }

  /// Per-repository totals, largest first.
  pub fn stats(&self) -> Result<CacheStats> {
    let index = self.lock_index()?;
    let mut stmt = index
      .conn
      .prepare(
        "SELECT repo, COUNT(*), SUM(size) FROM cache_entries
         GROUP BY repo ORDER BY SUM(size) DESC, repo ASC",
      )
      .map_err(|e| eyre!("Failed to prepare stats query: {}", e))?;

    let partitions = stmt
      .query_map([], |row| {
        Ok(PartitionStats {
          repository: row.get(0)?,
          entries: row.get::<_, i64>(1)? as u64,
          bytes: row.get::<_, i64>(2)? as u64,
        })
      })
      .map_err(|e| eyre!("Failed to query stats: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read stats: {}", e))?;

    Ok(CacheStats {
      entries: partitions.iter().map(|p| p.entries).sum(),
      bytes: partitions.iter().map(|p| p.bytes).sum(),
      partitions,
    })
  }

  /// Bring the index and the blob directory back in agreement.
  ///
  /// Drops index rows whose blob is missing or truncated, deletes blobs no
  /// row references, and clears partial writes. Run at startup only: it
  /// treats every file under `tmp/` as abandoned.
  pub fn reconcile(&self) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let mut index = self.lock_index()?;

    let tmp_dir = self.inner.root.join(TMP_DIR);
    for entry in read_dir_files(&tmp_dir)? {
      remove_blob(&entry)?;
      report.stale_temp_files += 1;
    }

    let rows: Vec<(String, String, String, String, i64)> = {
      let mut stmt = index
        .conn
        .prepare("SELECT repo, branch, path, blob, size FROM cache_entries")
        .map_err(|e| eyre!("Failed to prepare reconcile query: {}", e))?;
      let rows = stmt
        .query_map([], |row| {
          Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })
        .map_err(|e| eyre!("Failed to list cache entries: {}", e))?;
      rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to list cache entries: {}", e))?
    };

    let mut referenced = HashSet::new();
    let mut dropped = Vec::new();
    for (repo, branch, path, blob, size) in rows {
      let blob_path = self.inner.root.join(&blob);
      match fs::metadata(&blob_path) {
        Ok(m) if m.is_file() && m.len() == size as u64 => {
          referenced.insert(blob_path);
        }
        Ok(m) => {
          warn!(repo, branch, path, expected = size, actual = m.len(), "dropping entry with truncated blob");
          dropped.push((repo, branch, path));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
          warn!(repo, branch, path, "dropping entry with missing blob");
          dropped.push((repo, branch, path));
        }
        Err(e) => {
          return Err(eyre!("Failed to inspect blob {}: {}", blob_path.display(), e));
        }
      }
    }

    if !dropped.is_empty() {
      let tx = index
        .conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
      for (repo, branch, path) in &dropped {
        tx.execute(
          "DELETE FROM cache_entries WHERE repo = ?1 AND branch = ?2 AND path = ?3",
          params![repo, branch, path],
        )
        .map_err(|e| eyre!("Failed to drop entry: {}", e))?;
      }
      tx.commit()
        .map_err(|e| eyre!("Failed to commit reconciliation: {}", e))?;
    }
    report.dropped_entries = dropped.len() as u64;

    let blob_root = self.inner.root.join(BLOB_DIR);
    for file in walk_files(&blob_root)? {
      if !referenced.contains(&file) {
        remove_blob(&file)?;
        report.orphan_blobs += 1;
      }
    }
    prune_empty_dirs(&blob_root);
    // prune_empty_dirs removes the root too once everything is gone
    fs::create_dir_all(&blob_root)
      .map_err(|e| eyre!("Failed to recreate blob directory: {}", e))?;

    info!(
      dropped_entries = report.dropped_entries,
      orphan_blobs = report.orphan_blobs,
      stale_temp_files = report.stale_temp_files,
      "reconciled cache index"
    );
    Ok(report)
  }

  /// Keep `key` out of eviction until the guard drops.
  pub fn pin(&self, key: &CacheKey) -> PinGuard {
    let mut pinned = self
      .inner
      .pinned
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    *pinned.entry(key.clone()).or_insert(0) += 1;
    PinGuard {
      inner: Arc::clone(&self.inner),
      key: key.clone(),
    }
  }

  pub fn is_pinned(&self, key: &CacheKey) -> bool {
    self
      .inner
      .pinned
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .contains_key(key)
  }

  /// Store a branch list or tree for offline use.
  pub fn store_listing<T: Serialize>(
    &self,
    repo: &RepositoryIdentity,
    scope: &str,
    kind: ListingKind,
    items: &T,
  ) -> Result<()> {
    let payload =
      serde_json::to_vec(items).map_err(|e| eyre!("Failed to serialize listing: {}", e))?;
    let index = self.lock_index()?;
    index
      .conn
      .execute(
        "INSERT OR REPLACE INTO listings (repo, scope, kind, payload, fetched_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
          repo.as_str(),
          scope,
          kind.as_str(),
          payload,
          self.inner.clock.unix_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to store listing: {}", e))?;
    Ok(())
  }

  pub fn get_listing<T: DeserializeOwned>(
    &self,
    repo: &RepositoryIdentity,
    scope: &str,
    kind: ListingKind,
  ) -> Result<Option<CachedListing<T>>> {
    let index = self.lock_index()?;
    let row: Option<(Vec<u8>, i64)> = index
      .conn
      .query_row(
        "SELECT payload, fetched_at FROM listings WHERE repo = ?1 AND scope = ?2 AND kind = ?3",
        params![repo.as_str(), scope, kind.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read listing: {}", e))?;

    let Some((payload, fetched_at)) = row else {
      return Ok(None);
    };
    match serde_json::from_slice(&payload) {
      Ok(items) => Ok(Some(CachedListing {
        items,
        fetched_at: DateTime::from_timestamp_millis(fetched_at).unwrap_or_default(),
      })),
      Err(e) => {
        warn!(repo = %repo, scope, kind = kind.as_str(), error = %e, "ignoring unreadable listing");
        Ok(None)
      }
    }
  }

  /// Record a connection in the recent-repositories list.
  pub fn record_repository(
    &self,
    repo: &RepositoryIdentity,
    default_branch: Option<&str>,
  ) -> Result<()> {
    let index = self.lock_index()?;
    index
      .conn
      .execute(
        "INSERT OR REPLACE INTO repositories (repo, provider, default_branch, last_connected_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
          repo.as_str(),
          repo.provider().as_str(),
          default_branch,
          self.inner.clock.unix_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to record repository: {}", e))?;
    Ok(())
  }

  /// Recently connected repositories, newest first.
  pub fn recent_repositories(&self, limit: usize) -> Result<Vec<RecentRepository>> {
    let index = self.lock_index()?;
    let mut stmt = index
      .conn
      .prepare(
        "SELECT repo, provider, default_branch, last_connected_at FROM repositories
         ORDER BY last_connected_at DESC, repo ASC LIMIT ?1",
      )
      .map_err(|e| eyre!("Failed to prepare recent query: {}", e))?;

    let rows = stmt
      .query_map(params![limit as i64], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, Option<String>>(2)?,
          row.get::<_, i64>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query recent repositories: {}", e))?;

    let mut recent = Vec::new();
    for row in rows {
      let (repo, provider, default_branch, connected) =
        row.map_err(|e| eyre!("Failed to read recent repository: {}", e))?;
      let (Ok(identity), Ok(provider)) = (
        RepositoryIdentity::parse(&repo),
        provider.parse::<Provider>(),
      ) else {
        warn!(repo, "skipping unreadable recent repository");
        continue;
      };
      recent.push(RecentRepository {
        identity,
        provider,
        default_branch,
        last_connected_at: DateTime::from_timestamp_millis(connected).unwrap_or_default(),
      });
    }
    Ok(recent)
  }

  pub fn forget_repository(&self, repo: &RepositoryIdentity) -> Result<bool> {
    let index = self.lock_index()?;
    let removed = index
      .conn
      .execute(
        "DELETE FROM repositories WHERE repo = ?1",
        params![repo.as_str()],
      )
      .map_err(|e| eyre!("Failed to forget repository: {}", e))?;
    Ok(removed > 0)
  }
}

/// Releases a pin taken with [`CacheStore::pin`].
pub struct PinGuard {
  inner: Arc<StoreInner>,
  key: CacheKey,
}

impl Drop for PinGuard {
  fn drop(&mut self) {
    let mut pinned = self
      .inner
      .pinned
      .lock()
      .unwrap_or_else(|e| e.into_inner());
    if let Some(count) = pinned.get_mut(&self.key) {
      *count -= 1;
      if *count == 0 {
        pinned.remove(&self.key);
      }
    }
  }
}

fn select_entry(conn: &Connection, key: &CacheKey) -> Result<Option<(EntryMeta, String)>> {
  conn
    .query_row(
      "SELECT blob, size, checksum, fetched_at, last_accessed_at, revalidation_tag, content_kind
       FROM cache_entries WHERE repo = ?1 AND branch = ?2 AND path = ?3",
      params![key.repo.as_str(), key.branch, key.path],
      |row| {
        let blob: String = row.get(0)?;
        let kind: String = row.get(6)?;
        Ok((
          EntryMeta {
            key: key.clone(),
            size: row.get::<_, i64>(1)? as u64,
            checksum: row.get(2)?,
            fetched_at: row.get(3)?,
            last_accessed_at: row.get(4)?,
            revalidation_tag: row.get(5)?,
            content_kind: ContentKind::from_db(&kind),
          },
          blob,
        ))
      },
    )
    .optional()
    .map_err(|e| eyre!("Failed to look up cache entry: {}", e))
}

/// Read a blob and check it against its index row.
///
/// The outer error is a local I/O failure; the inner one means the entry
/// is corrupt and should be dropped.
fn read_verified(path: &Path, meta: &EntryMeta) -> Result<std::result::Result<Bytes, Corruption>> {
  let content = match fs::read(path) {
    Ok(content) => content,
    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Err(Corruption::MissingBlob)),
    Err(e) => return Err(eyre!("Failed to read blob {}: {}", path.display(), e)),
  };

  if content.len() as u64 != meta.size {
    return Ok(Err(Corruption::SizeMismatch {
      expected: meta.size,
      actual: content.len() as u64,
    }));
  }
  if hex::encode(Sha256::digest(&content)) != meta.checksum {
    return Ok(Err(Corruption::ChecksumMismatch));
  }
  Ok(Ok(Bytes::from(content)))
}

fn remove_blob(path: &Path) -> Result<()> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
    Err(e) => Err(eyre!("Failed to remove {}: {}", path.display(), e)),
  }
}

fn sync_dir(dir: &Path) {
  if let Ok(handle) = File::open(dir) {
    let _ = handle.sync_all();
  }
}

fn read_dir_files(dir: &Path) -> Result<Vec<PathBuf>> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(eyre!("Failed to list {}: {}", dir.display(), e)),
  };
  let mut files = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|e| eyre!("Failed to list {}: {}", dir.display(), e))?;
    if entry.path().is_file() {
      files.push(entry.path());
    }
  }
  Ok(files)
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  let mut stack = vec![root.to_path_buf()];
  while let Some(dir) = stack.pop() {
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == ErrorKind::NotFound => continue,
      Err(e) => return Err(eyre!("Failed to list {}: {}", dir.display(), e)),
    };
    for entry in entries {
      let entry = entry.map_err(|e| eyre!("Failed to list {}: {}", dir.display(), e))?;
      let path = entry.path();
      if path.is_dir() {
        stack.push(path);
      } else {
        files.push(path);
      }
    }
  }
  Ok(files)
}

/// Remove empty directories bottom-up, `dir` included. Best effort.
fn prune_empty_dirs(dir: &Path) {
  if let Ok(entries) = fs::read_dir(dir) {
    for entry in entries.flatten() {
      let path = entry.path();
      if path.is_dir() {
        prune_empty_dirs(&path);
      }
    }
  }
  // Fails harmlessly when the directory still has content
  let _ = fs::remove_dir(dir);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::testing::ManualClock;
  use crate::repo::BranchInfo;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::time::Duration;
  use tempfile::TempDir;

  fn repo(name: &str) -> RepositoryIdentity {
    RepositoryIdentity::parse(&format!("https://github.com/octo/{}", name)).unwrap()
  }

  fn key(name: &str, path: &str) -> CacheKey {
    CacheKey::new(repo(name), "main", path)
  }

  fn open() -> (TempDir, Arc<ManualClock>, CacheStore) {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = CacheStore::open(dir.path(), clock.clone()).unwrap();
    (dir, clock, store)
  }

  #[test]
  fn test_put_then_get() {
    let (_dir, _clock, store) = open();
    let k = key("docs", "README.md");

    let meta = store.put(&k, b"# Hello", Some("\"etag-1\"")).unwrap();
    assert_eq!(meta.size, 7);
    assert_eq!(meta.content_kind, ContentKind::Text);

    let hit = store.get(&k).unwrap().unwrap();
    assert_eq!(&hit.content[..], b"# Hello");
    assert_eq!(hit.meta.revalidation_tag.as_deref(), Some("\"etag-1\""));
    assert!(hit.meta.last_accessed_at > meta.last_accessed_at);
    assert!(store.root().join(k.blob_path()).is_file());
  }

  #[test]
  fn test_get_missing_is_none() {
    let (_dir, _clock, store) = open();
    assert!(store.get(&key("docs", "nope.md")).unwrap().is_none());
  }

  #[test]
  fn test_access_stamps_strictly_increase_at_same_instant() {
    let (_dir, _clock, store) = open();
    let k = key("docs", "a.md");
    store.put(&k, b"a", None).unwrap();

    let first = store.get(&k).unwrap().unwrap().meta.last_accessed_at;
    let second = store.get(&k).unwrap().unwrap().meta.last_accessed_at;
    assert!(second > first);
  }

  #[test]
  fn test_put_replaces_entry() {
    let (_dir, _clock, store) = open();
    let k = key("docs", "a.md");
    store.put(&k, b"short", None).unwrap();
    store.put(&k, b"a much longer body", None).unwrap();

    let hit = store.get(&k).unwrap().unwrap();
    assert_eq!(&hit.content[..], b"a much longer body");
    assert_eq!(store.size_of(Partition::All).unwrap(), 18);
    assert_eq!(store.stats().unwrap().entries, 1);
  }

  #[test]
  fn test_delete_is_idempotent() {
    let (_dir, _clock, store) = open();
    let k = key("docs", "a.md");
    store.put(&k, b"a", None).unwrap();

    assert!(store.delete(&k).unwrap());
    assert!(!store.delete(&k).unwrap());
    assert!(store.get(&k).unwrap().is_none());
    assert!(!store.root().join(k.blob_path()).exists());
  }

  #[test]
  fn test_corrupt_blob_is_dropped_as_miss() {
    let (_dir, _clock, store) = open();
    let k = key("docs", "a.md");
    store.put(&k, b"original", None).unwrap();
    fs::write(store.root().join(k.blob_path()), b"tampered").unwrap();

    assert!(store.get(&k).unwrap().is_none());
    assert!(store.peek(&k).unwrap().is_none());
    assert!(!store.root().join(k.blob_path()).exists());
  }

  #[test]
  fn test_missing_blob_is_dropped_as_miss() {
    let (_dir, _clock, store) = open();
    let k = key("docs", "a.md");
    store.put(&k, b"original", None).unwrap();
    fs::remove_file(store.root().join(k.blob_path())).unwrap();

    assert!(store.get(&k).unwrap().is_none());
    assert_eq!(store.size_of(Partition::All).unwrap(), 0);
  }

  #[test]
  fn test_lru_order_follows_access() {
    let (_dir, clock, store) = open();
    let (a, b, c) = (key("docs", "a"), key("docs", "b"), key("docs", "c"));
    for k in [&a, &b, &c] {
      store.put(k, b"x", None).unwrap();
      clock.advance(Duration::from_secs(1));
    }
    store.get(&a).unwrap();

    let order: Vec<_> = store
      .iterate_by_last_access(Partition::All)
      .unwrap()
      .into_iter()
      .map(|e| e.key)
      .collect();
    assert_eq!(order, vec![b, c, a]);
  }

  #[test]
  fn test_size_of_partition() {
    let (_dir, _clock, store) = open();
    store.put(&key("docs", "a"), &[1u8; 10], None).unwrap();
    store.put(&key("docs", "b"), &[1u8; 5], None).unwrap();
    store.put(&key("wiki", "a"), &[1u8; 7], None).unwrap();

    assert_eq!(store.size_of(Partition::Repository(&repo("docs"))).unwrap(), 15);
    assert_eq!(store.size_of(Partition::Repository(&repo("wiki"))).unwrap(), 7);
    assert_eq!(store.size_of(Partition::All).unwrap(), 22);

    let stats = store.stats().unwrap();
    assert_eq!(stats.bytes, 22);
    assert_eq!(stats.partitions[0].repository, repo("docs").as_str());
  }

  #[test]
  fn test_invalidate_branch_and_repository() {
    let (_dir, _clock, store) = open();
    let docs = repo("docs");
    store.put(&CacheKey::new(docs.clone(), "main", "a"), b"1", None).unwrap();
    store.put(&CacheKey::new(docs.clone(), "dev", "a"), b"2", None).unwrap();
    store.put(&key("wiki", "a"), b"3", None).unwrap();

    assert_eq!(store.invalidate(&docs, Some("dev")).unwrap(), 1);
    assert_eq!(store.size_of(Partition::Repository(&docs)).unwrap(), 1);

    assert_eq!(store.invalidate(&docs, None).unwrap(), 1);
    assert_eq!(store.invalidate(&docs, None).unwrap(), 0);
    assert_eq!(store.size_of(Partition::All).unwrap(), 1);
  }

  #[test]
  fn test_reconcile_removes_orphans_on_both_sides() {
    let (_dir, _clock, store) = open();
    let kept = key("docs", "kept");
    let lost = key("docs", "lost");
    store.put(&kept, b"kept", None).unwrap();
    store.put(&lost, b"lost", None).unwrap();
    fs::remove_file(store.root().join(lost.blob_path())).unwrap();

    let orphan = store.root().join("blobs/deadbeef/main/orphan");
    fs::create_dir_all(orphan.parent().unwrap()).unwrap();
    fs::write(&orphan, b"orphan").unwrap();
    fs::write(store.root().join("tmp/abc.part"), b"partial").unwrap();

    let report = store.reconcile().unwrap();
    assert_eq!(
      report,
      ReconcileReport {
        dropped_entries: 1,
        orphan_blobs: 1,
        stale_temp_files: 1,
      }
    );
    assert!(!orphan.exists());
    assert!(store.get(&kept).unwrap().is_some());
    assert!(store.peek(&lost).unwrap().is_none());
  }

  #[test]
  fn test_stamps_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(5_000));
    let k = key("docs", "a");
    let stamp = {
      let store = CacheStore::open(dir.path(), clock.clone()).unwrap();
      store.put(&k, b"a", None).unwrap();
      store.get(&k).unwrap().unwrap().meta.last_accessed_at
    };

    // Wall clock moved backwards between runs
    let earlier = Arc::new(ManualClock::new(1_000));
    let store = CacheStore::open(dir.path(), earlier).unwrap();
    let again = store.get(&k).unwrap().unwrap().meta.last_accessed_at;
    assert!(again > stamp);
  }

  #[test]
  fn test_pins_nest() {
    let (_dir, _clock, store) = open();
    let k = key("docs", "a");
    let outer = store.pin(&k);
    let inner = store.pin(&k);
    drop(inner);
    assert!(store.is_pinned(&k));
    drop(outer);
    assert!(!store.is_pinned(&k));
  }

  #[test]
  fn test_listing_round_trip_and_invalidation() {
    let (_dir, _clock, store) = open();
    let docs = repo("docs");
    let branches = vec![BranchInfo {
      name: "main".into(),
      commit_sha: Some("abc".into()),
      is_default: true,
    }];
    store
      .store_listing(&docs, "", ListingKind::Branches, &branches)
      .unwrap();

    let cached: CachedListing<Vec<BranchInfo>> = store
      .get_listing(&docs, "", ListingKind::Branches)
      .unwrap()
      .unwrap();
    assert_eq!(cached.items, branches);

    store.invalidate(&docs, None).unwrap();
    assert!(store
      .get_listing::<Vec<BranchInfo>>(&docs, "", ListingKind::Branches)
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_recent_repositories_newest_first() {
    let (_dir, clock, store) = open();
    store.record_repository(&repo("docs"), Some("main")).unwrap();
    clock.advance(Duration::from_secs(5));
    store.record_repository(&repo("wiki"), None).unwrap();
    clock.advance(Duration::from_secs(5));
    // Same repository through a different URL form
    let alias = RepositoryIdentity::parse("git@github.com:octo/docs.git").unwrap();
    store.record_repository(&alias, Some("main")).unwrap();

    let recent = store.recent_repositories(10).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].identity, repo("docs"));
    assert_eq!(recent[1].identity, repo("wiki"));

    assert!(store.forget_repository(&repo("wiki")).unwrap());
    assert_eq!(store.recent_repositories(10).unwrap().len(), 1);
  }

  #[test]
  fn test_invalidate_racing_put_never_leaves_row_without_blob() {
    let (_dir, _clock, store) = open();
    let docs = repo("docs");
    let k = CacheKey::new(docs.clone(), "main", "README.md");

    let stop = Arc::new(AtomicBool::new(false));
    let invalidator = {
      let store = store.clone();
      let stop = stop.clone();
      std::thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
          store.invalidate(&docs, None).unwrap();
        }
      })
    };

    for _ in 0..2000 {
      store.put(&k, b"hello", None).unwrap();
      if store.peek(&k).unwrap().is_some() && !store.root().join(k.blob_path()).is_file() {
        // Invalidate drops the row before the blob, so the row must be gone
        assert!(store.peek(&k).unwrap().is_none());
      }
    }

    stop.store(true, Ordering::SeqCst);
    invalidator.join().unwrap();
    assert_eq!(store.reconcile().unwrap().dropped_entries, 0);
  }

  #[test]
  fn test_get_during_replacement_serves_consistent_entry() {
    let (_dir, _clock, store) = open();
    let k = key("docs", "a.md");
    store.put(&k, b"aaaa", None).unwrap();

    let writer = {
      let store = store.clone();
      let k = k.clone();
      std::thread::spawn(move || {
        for i in 0..500 {
          let body: &[u8] = if i % 2 == 0 { b"bbbbbbbb" } else { b"aaaa" };
          store.put(&k, body, None).unwrap();
        }
      })
    };

    while !writer.is_finished() {
      let hit = store.get(&k).unwrap().unwrap();
      assert_eq!(hit.meta.size, hit.content.len() as u64);
      assert_eq!(hex::encode(Sha256::digest(&hit.content)), hit.meta.checksum);
    }
    writer.join().unwrap();
    assert_eq!(&store.get(&k).unwrap().unwrap().content[..], b"aaaa");
  }
}
