//! Local cache of remote repository files.
//!
//! This module provides:
//! - A durable store (SQLite index + blob files) with crash-safe writes
//! - Per-key single-flight so concurrent misses fetch once
//! - LRU eviction against per-repository and global size limits

mod eviction;
mod flight;
mod storage;
mod types;

pub use eviction::{EvictionError, EvictionLimits, EvictionManager, EvictionReport};
pub use flight::{Flight, FlightError, SingleFlight};
pub use storage::{CacheStore, CachedListing, ListingKind, PinGuard};
pub use types::{
  CacheKey, CacheStats, CachedFile, EntryMeta, LruEntry, Partition, PartitionStats,
  ReconcileReport,
};
