//! The facade the UI layer talks to.
//!
//! [`Gateway`] combines the cache store, eviction, the remote client, the
//! provider APIs and the connectivity monitor. Reads are cache-first, misses
//! for one key share a single network fetch, and failures come back as
//! [`GatewayError`].

mod credentials;
mod error;
mod service;

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::cache::{CachedFile, EvictionLimits};
use crate::connectivity::MonitorOptions;
use crate::remote::RemoteOptions;
use crate::repo::ContentKind;

pub use credentials::{CredentialStore, MemoryCredentialStore};
pub use error::GatewayError;
pub use service::{Gateway, GatewayParts};

pub const DEFAULT_PER_REPO_LIMIT: u64 = 256 * 1024 * 1024;
pub const DEFAULT_GLOBAL_LIMIT: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_TARGET_RATIO: f64 = 0.9;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_AZURE_API_VERSION: &str = "7.1";

#[derive(Debug, Clone)]
pub struct GatewayOptions {
  pub cache_root: PathBuf,
  pub limits: EvictionLimits,
  pub remote: RemoteOptions,
  pub monitor: MonitorOptions,
  /// Period of the background global-limit sweep
  pub sweep_interval: Duration,
  pub github_api_url: String,
  pub azure_api_version: String,
}

impl GatewayOptions {
  pub fn new(cache_root: impl Into<PathBuf>) -> Self {
    Self {
      cache_root: cache_root.into(),
      limits: EvictionLimits {
        per_repo: DEFAULT_PER_REPO_LIMIT,
        global: DEFAULT_GLOBAL_LIMIT,
        target_ratio: DEFAULT_TARGET_RATIO,
      },
      remote: RemoteOptions::default(),
      monitor: MonitorOptions::default(),
      sweep_interval: DEFAULT_SWEEP_INTERVAL,
      github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
      azure_api_version: DEFAULT_AZURE_API_VERSION.to_string(),
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
  /// Skip the cache lookup and go to the network
  pub force_refresh: bool,
  /// Stops this caller waiting; a shared fetch keeps running
  pub cancel: Option<CancellationToken>,
}

impl FetchOptions {
  pub fn forced() -> Self {
    Self {
      force_refresh: true,
      cancel: None,
    }
  }
}

/// File content returned by [`Gateway::fetch_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
  pub content: Bytes,
  pub served_from_cache: bool,
  pub content_kind: ContentKind,
  pub fetched_at: DateTime<Utc>,
  pub revalidation_tag: Option<String>,
}

impl FetchedFile {
  fn cached(file: CachedFile) -> Self {
    Self {
      content: file.content,
      served_from_cache: true,
      content_kind: file.meta.content_kind,
      fetched_at: file.meta.fetched_at_utc(),
      revalidation_tag: file.meta.revalidation_tag,
    }
  }
}
