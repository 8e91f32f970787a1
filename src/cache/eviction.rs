//! Size ceilings for the cache, enforced by LRU eviction.

use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::repo::RepositoryIdentity;

use super::storage::CacheStore;
use super::types::{CacheKey, EntryMeta, Partition};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionLimits {
  pub per_repo: u64,
  pub global: u64,
  /// Fraction of a limit to drop to once eviction starts
  pub target_ratio: f64,
}

impl EvictionLimits {
  fn target(&self, limit: u64) -> u64 {
    (limit as f64 * self.target_ratio.clamp(0.0, 1.0)) as u64
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvictionError {
  #[error("entry of {size} bytes exceeds the {limit} byte cache limit")]
  TooLarge { size: u64, limit: u64 },
  #[error("cache full: {needed} bytes needed under a {limit} byte limit, remaining entries are in use")]
  Full { needed: u64, limit: u64 },
  #[error("cache store failure: {0}")]
  Store(String),
}

impl From<color_eyre::Report> for EvictionError {
  fn from(e: color_eyre::Report) -> Self {
    EvictionError::Store(format!("{:#}", e))
  }
}

/// Entries removed by one eviction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
  pub evicted: Vec<CacheKey>,
  pub freed_bytes: u64,
}

/// Keeps every repository partition under the per-repository limit and the
/// whole cache under the global limit.
///
/// Size checks and the writes they admit are serialized, so two writers can
/// never both claim the same free space.
pub struct EvictionManager {
  store: CacheStore,
  limits: EvictionLimits,
  admission: Mutex<()>,
}

impl EvictionManager {
  pub fn new(store: CacheStore, limits: EvictionLimits) -> Self {
    Self {
      store,
      limits,
      admission: Mutex::new(()),
    }
  }

  /// Make room for `incoming` bytes about to be written under `key`.
  pub fn ensure_space(&self, key: &CacheKey, incoming: u64) -> Result<EvictionReport, EvictionError> {
    let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
    self.ensure_space_locked(key, incoming)
  }

  /// Evict as needed, then store `content` under `key`.
  pub fn admit(
    &self,
    key: &CacheKey,
    content: &[u8],
    revalidation_tag: Option<&str>,
  ) -> Result<EntryMeta, EvictionError> {
    let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
    self.ensure_space_locked(key, content.len() as u64)?;
    Ok(self.store.put(key, content, revalidation_tag)?)
  }

  fn ensure_space_locked(&self, key: &CacheKey, incoming: u64) -> Result<EvictionReport, EvictionError> {
    for limit in [self.limits.per_repo, self.limits.global] {
      if incoming > limit {
        return Err(EvictionError::TooLarge {
          size: incoming,
          limit,
        });
      }
    }

    // Bytes of an entry being replaced are freed by the write itself
    let replaced = self.store.peek(key)?.map(|meta| meta.size).unwrap_or(0);

    let mut report = EvictionReport::default();
    self.evict(
      Partition::Repository(&key.repo),
      self.limits.per_repo,
      Some(key),
      incoming,
      replaced,
      &mut report,
    )?;
    self.evict(
      Partition::All,
      self.limits.global,
      Some(key),
      incoming,
      replaced,
      &mut report,
    )?;
    Ok(report)
  }

  /// Bring every partition and the whole cache back under their limits.
  ///
  /// Runs at startup and on the sweep timer. Entries that are in use are
  /// skipped; if they alone keep a partition over its limit the sweep logs
  /// it and moves on.
  pub fn enforce_global(&self) -> Result<EvictionReport, EvictionError> {
    let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
    let mut report = EvictionReport::default();

    let stats = self.store.stats()?;
    for partition in stats.partitions.iter().filter(|p| p.bytes > self.limits.per_repo) {
      let Ok(repo) = RepositoryIdentity::parse(&partition.repository) else {
        continue;
      };
      let result = self.evict(
        Partition::Repository(&repo),
        self.limits.per_repo,
        None,
        0,
        0,
        &mut report,
      );
      tolerate_full(result)?;
    }

    let result = self.evict(Partition::All, self.limits.global, None, 0, 0, &mut report);
    tolerate_full(result)?;
    Ok(report)
  }

  fn evict(
    &self,
    partition: Partition<'_>,
    limit: u64,
    writing: Option<&CacheKey>,
    incoming: u64,
    replaced: u64,
    report: &mut EvictionReport,
  ) -> Result<(), EvictionError> {
    let mut current = self.store.size_of(partition)?.saturating_sub(replaced);
    if current + incoming <= limit {
      return Ok(());
    }

    let target = self.limits.target(limit);
    let mut victims = Vec::new();
    for entry in self.store.iterate_by_last_access(partition)? {
      if current + incoming <= target {
        break;
      }
      if Some(&entry.key) == writing || self.store.is_pinned(&entry.key) {
        continue;
      }
      current = current.saturating_sub(entry.size);
      report.freed_bytes += entry.size;
      victims.push(entry.key);
    }

    if !victims.is_empty() {
      self.store.delete_many(&victims)?;
      info!(
        partition = %PartitionLabel(partition),
        evicted = victims.len(),
        remaining = current,
        limit,
        "evicted least recently used entries"
      );
      report.evicted.extend(victims);
    }

    if current + incoming > limit {
      return Err(EvictionError::Full {
        needed: current + incoming,
        limit,
      });
    }
    Ok(())
  }
}

fn tolerate_full(result: Result<(), EvictionError>) -> Result<(), EvictionError> {
  match result {
    Err(EvictionError::Full { needed, limit }) => {
      warn!(needed, limit, "cache still over limit, remaining entries are in use");
      Ok(())
    }
    other => other,
  }
}

struct PartitionLabel<'a>(Partition<'a>);

impl std::fmt::Display for PartitionLabel<'_> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.0 {
      Partition::Repository(repo) => write!(f, "{}", repo),
      Partition::All => write!(f, "all"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::testing::ManualClock;
  use std::sync::Arc;
  use std::time::Duration;
  use tempfile::TempDir;

  fn repo(name: &str) -> RepositoryIdentity {
    RepositoryIdentity::parse(&format!("https://github.com/octo/{}", name)).unwrap()
  }

  fn key(repo_name: &str, path: &str) -> CacheKey {
    CacheKey::new(repo(repo_name), "main", path)
  }

  struct Fixture {
    _dir: TempDir,
    clock: Arc<ManualClock>,
    store: CacheStore,
    eviction: EvictionManager,
  }

  fn fixture(per_repo: u64, global: u64) -> Fixture {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = CacheStore::open(dir.path(), clock.clone()).unwrap();
    let eviction = EvictionManager::new(
      store.clone(),
      EvictionLimits {
        per_repo,
        global,
        target_ratio: 0.9,
      },
    );
    Fixture {
      _dir: dir,
      clock,
      store,
      eviction,
    }
  }

  impl Fixture {
    fn write(&self, key: &CacheKey, size: usize) -> Result<EntryMeta, EvictionError> {
      self.clock.advance(Duration::from_secs(1));
      self.eviction.admit(key, &vec![b'x'; size], None)
    }
  }

  #[test]
  fn test_third_write_evicts_oldest() {
    let f = fixture(100, 10_000);
    let (a, b, c) = (key("docs", "a"), key("docs", "b"), key("docs", "c"));
    f.write(&a, 40).unwrap();
    f.write(&b, 40).unwrap();

    f.clock.advance(Duration::from_secs(1));
    let report = f.eviction.ensure_space(&c, 40).unwrap();
    assert_eq!(report.evicted, vec![a.clone()]);
    f.store.put(&c, &[b'x'; 40], None).unwrap();

    assert!(f.store.peek(&a).unwrap().is_none());
    assert!(f.store.peek(&b).unwrap().is_some());
    assert!(f.store.size_of(Partition::Repository(&repo("docs"))).unwrap() <= 90);
  }

  #[test]
  fn test_reads_refresh_lru_position() {
    let f = fixture(100, 10_000);
    let (a, b, c) = (key("docs", "a"), key("docs", "b"), key("docs", "c"));
    f.write(&a, 40).unwrap();
    f.write(&b, 40).unwrap();
    f.clock.advance(Duration::from_secs(1));
    f.store.get(&a).unwrap();
    f.write(&c, 40).unwrap();

    assert!(f.store.peek(&a).unwrap().is_some());
    assert!(f.store.peek(&b).unwrap().is_none());
  }

  #[test]
  fn test_oversized_entry_is_rejected_without_evicting() {
    let f = fixture(100, 10_000);
    let a = key("docs", "a");
    f.write(&a, 40).unwrap();

    let err = f.write(&key("docs", "huge"), 101).unwrap_err();
    assert_eq!(err, EvictionError::TooLarge { size: 101, limit: 100 });
    assert!(f.store.peek(&a).unwrap().is_some());
  }

  #[test]
  fn test_replaced_entry_does_not_count() {
    let f = fixture(100, 10_000);
    let (a, b) = (key("docs", "a"), key("docs", "b"));
    f.write(&a, 40).unwrap();
    f.write(&b, 40).unwrap();

    f.write(&a, 60).unwrap();
    assert!(f.store.peek(&b).unwrap().is_some());
    assert_eq!(f.store.size_of(Partition::All).unwrap(), 100);
  }

  #[test]
  fn test_global_limit_evicts_across_repositories() {
    let f = fixture(100, 100);
    let docs_a = key("docs", "a");
    let wiki_b = key("wiki", "b");
    f.write(&docs_a, 50).unwrap();
    f.write(&wiki_b, 40).unwrap();
    f.write(&key("wiki", "c"), 30).unwrap();

    assert!(f.store.peek(&docs_a).unwrap().is_none());
    assert!(f.store.peek(&wiki_b).unwrap().is_some());
    assert!(f.store.size_of(Partition::All).unwrap() <= 90);
  }

  #[test]
  fn test_pinned_entries_are_skipped() {
    let f = fixture(100, 10_000);
    let (a, b) = (key("docs", "a"), key("docs", "b"));
    f.write(&a, 40).unwrap();
    f.write(&b, 40).unwrap();

    let _pin = f.store.pin(&a);
    f.write(&key("docs", "c"), 40).unwrap();
    assert!(f.store.peek(&a).unwrap().is_some());
    assert!(f.store.peek(&b).unwrap().is_none());
  }

  #[test]
  fn test_full_when_everything_is_pinned() {
    let f = fixture(100, 10_000);
    let (a, b) = (key("docs", "a"), key("docs", "b"));
    f.write(&a, 40).unwrap();
    f.write(&b, 40).unwrap();

    let _pins = (f.store.pin(&a), f.store.pin(&b));
    let err = f.write(&key("docs", "c"), 40).unwrap_err();
    assert_eq!(err, EvictionError::Full { needed: 120, limit: 100 });
  }

  #[test]
  fn test_enforce_global_after_limits_shrink() {
    let f = fixture(1_000, 10_000);
    for i in 0..5 {
      f.write(&key("docs", &format!("d{i}")), 40).unwrap();
      f.write(&key("wiki", &format!("w{i}")), 40).unwrap();
    }

    let tight = EvictionManager::new(
      f.store.clone(),
      EvictionLimits {
        per_repo: 100,
        global: 150,
        target_ratio: 0.9,
      },
    );
    let report = tight.enforce_global().unwrap();
    assert!(!report.evicted.is_empty());
    assert!(f.store.size_of(Partition::Repository(&repo("docs"))).unwrap() <= 100);
    assert!(f.store.size_of(Partition::Repository(&repo("wiki"))).unwrap() <= 100);
    assert!(f.store.size_of(Partition::All).unwrap() <= 150);
  }
}
