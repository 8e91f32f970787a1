use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::Result;
use reqwest::header::{HeaderValue, IF_NONE_MATCH};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{
  CacheKey, CacheStats, CacheStore, EvictionManager, EvictionReport, ListingKind, ReconcileReport,
  SingleFlight,
};
use crate::clock::{Clock, Scheduler, SystemClock};
use crate::connectivity::{ConnectivityMonitor, ConnectivityState, HttpProber, NetworkSignal, Prober};
use crate::provider::{Endpoint, Providers};
use crate::remote::{
  credential_fingerprint, Call, HttpRequest, HttpResponse, RemoteClient, RemoteError,
  ReqwestTransport, Transport,
};
use crate::repo::{BranchInfo, ConnectInfo, RecentRepository, RepositoryIdentity, TreeEntry};

use super::credentials::CredentialStore;
use super::error::GatewayError;
use super::{FetchOptions, FetchedFile, GatewayOptions};

/// Upper bound on pages followed for one listing.
const MAX_PAGES: u32 = 100;
/// Used when a repository reports no default branch and has no branches.
const FALLBACK_BRANCH: &str = "main";

/// Collaborators a [`Gateway`] is assembled from.
pub struct GatewayParts {
  pub options: GatewayOptions,
  pub clock: Arc<dyn Clock>,
  pub transport: Arc<dyn Transport>,
  /// Defaults to HTTP probes sent over `transport`
  pub prober: Option<Arc<dyn Prober>>,
  pub credentials: Arc<dyn CredentialStore>,
}

/// Repository gateway. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Gateway {
  inner: Arc<Inner>,
}

struct Inner {
  store: CacheStore,
  eviction: EvictionManager,
  remote: RemoteClient,
  providers: Providers,
  monitor: ConnectivityMonitor,
  credentials: Arc<dyn CredentialStore>,
  flights: SingleFlight<CacheKey, Result<FetchedFile, GatewayError>>,
  scheduler: Scheduler,
  options: GatewayOptions,
  /// Cancelled on shutdown; aborts every remote call
  cancel: CancellationToken,
  started: AtomicBool,
}

impl Gateway {
  pub fn assemble(parts: GatewayParts) -> Result<Self> {
    let GatewayParts {
      options,
      clock,
      transport,
      prober,
      credentials,
    } = parts;

    let providers = Providers::new(&options.github_api_url, &options.azure_api_version)?;
    let store = CacheStore::open(&options.cache_root, Arc::clone(&clock))?;
    let eviction = EvictionManager::new(store.clone(), options.limits);
    let prober: Arc<dyn Prober> = match prober {
      Some(prober) => prober,
      None => Arc::new(HttpProber::new(
        Arc::clone(&transport),
        &providers,
        options.monitor.probe_timeout,
      )),
    };
    let monitor = ConnectivityMonitor::new(prober, Arc::clone(&clock), options.monitor);
    let remote = RemoteClient::new(transport, clock, options.remote);

    Ok(Self {
      inner: Arc::new(Inner {
        store,
        eviction,
        remote,
        providers,
        monitor,
        credentials,
        flights: SingleFlight::new(),
        scheduler: Scheduler::new(),
        options,
        cancel: CancellationToken::new(),
        started: AtomicBool::new(false),
      }),
    })
  }

  /// Gateway over HTTPS and the system clock.
  pub fn open(
    options: GatewayOptions,
    user_agent: &str,
    credentials: Arc<dyn CredentialStore>,
  ) -> Result<Self> {
    let transport = Arc::new(ReqwestTransport::new(user_agent)?);
    Self::assemble(GatewayParts {
      options,
      clock: Arc::new(SystemClock::new()),
      transport,
      prober: None,
      credentials,
    })
  }

  /// Reconcile the store with disk, enforce the global limit, then start
  /// connectivity monitoring and the periodic sweep.
  ///
  /// Only the first call does anything: reconciliation deletes pending
  /// temp files and must not race live writes.
  pub async fn initialize(&self) -> Result<ReconcileReport, GatewayError> {
    if self.inner.started.swap(true, Ordering::SeqCst) {
      debug!("gateway already initialized");
      return Ok(ReconcileReport::default());
    }

    let report = self.inner.store.reconcile()?;
    let evicted = self.inner.eviction.enforce_global()?;
    info!(
      dropped = report.dropped_entries,
      orphans = report.orphan_blobs,
      temp = report.stale_temp_files,
      evicted = evicted.evicted.len(),
      "cache ready"
    );

    self.inner.monitor.initialize();

    let weak = Arc::downgrade(&self.inner);
    self
      .inner
      .scheduler
      .every(self.inner.options.sweep_interval, move || {
        let weak = weak.clone();
        async move {
          if let Some(inner) = weak.upgrade() {
            if let Err(e) = inner.sweep() {
              warn!(error = %e, "cache sweep failed");
            }
          }
        }
      });

    Ok(report)
  }

  /// Stop background work and abort outstanding remote calls.
  pub fn shutdown(&self) {
    self.inner.shutdown();
    info!("gateway shut down");
  }

  /// Resolve `url`, remember `token` for it and load its branches.
  pub async fn connect(&self, url: &str, token: Option<&str>) -> Result<ConnectInfo, GatewayError> {
    let identity = RepositoryIdentity::parse(url)?;
    if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
      self
        .inner
        .credentials
        .set(&identity, token)
        .map_err(credential_error)?;
    }

    let branches = self.list_branches(&identity).await?;
    let default_branch = branches
      .iter()
      .find(|b| b.is_default)
      .or_else(|| branches.first())
      .map(|b| b.name.clone())
      .unwrap_or_else(|| FALLBACK_BRANCH.to_string());

    self
      .inner
      .store
      .record_repository(&identity, Some(&default_branch))?;
    info!(repo = %identity, default_branch, branches = branches.len(), "connected");

    Ok(ConnectInfo {
      identity,
      default_branch,
      branches,
    })
  }

  /// Branches of `identity`, from the network when reachable, else the
  /// stored listing.
  pub async fn list_branches(&self, identity: &RepositoryIdentity) -> Result<Vec<BranchInfo>, GatewayError> {
    let token = self.inner.token(identity)?;
    let inner = &self.inner;
    inner
      .listing(identity, "", ListingKind::Branches, || {
        inner.fetch_branches(identity, token.as_deref())
      })
      .await
  }

  /// Recursive file tree of `branch`.
  pub async fn list_files(
    &self,
    identity: &RepositoryIdentity,
    branch: &str,
  ) -> Result<Vec<TreeEntry>, GatewayError> {
    let token = self.inner.token(identity)?;
    let inner = &self.inner;
    inner
      .listing(identity, branch, ListingKind::Tree, || {
        inner.fetch_tree(identity, branch, token.as_deref())
      })
      .await
  }

  /// Content of `path` on `branch`, cache-first.
  ///
  /// A caller arriving while a fetch for the same key is in flight gets that
  /// fetch's result. Cancelling `options.cancel` only stops this caller
  /// waiting; the fetch itself still completes and fills the cache.
  pub async fn fetch_file(
    &self,
    identity: &RepositoryIdentity,
    branch: &str,
    path: &str,
    options: FetchOptions,
  ) -> Result<FetchedFile, GatewayError> {
    let key = CacheKey::new(identity.clone(), branch, path);
    let cancel = options.cancel.unwrap_or_default();
    if cancel.is_cancelled() {
      return Err(GatewayError::Cancelled);
    }

    let flight = match self.inner.flights.join(&key) {
      Some(flight) => {
        debug!(key = %key, "joining in-flight fetch");
        flight
      }
      None => {
        if !options.force_refresh {
          if let Some(hit) = self.inner.store.get(&key)? {
            debug!(key = %key, "cache hit");
            return Ok(FetchedFile::cached(hit));
          }
        }

        let provider = identity.provider();
        if !self.inner.monitor.is_reachable(provider) {
          debug!(key = %key, %provider, "cache miss while offline");
          return Err(GatewayError::Offline { provider });
        }

        debug!(key = %key, force = options.force_refresh, "fetching");
        let inner = Arc::clone(&self.inner);
        let force_refresh = options.force_refresh;
        let task_key = key.clone();
        self
          .inner
          .flights
          .run(key, move || async move { inner.fetch_and_store(task_key, force_refresh).await })
      }
    };

    tokio::select! {
      _ = cancel.cancelled() => Err(GatewayError::Cancelled),
      result = flight => result?,
    }
  }

  /// Drop cached content (and listings) for a repository or one branch.
  /// Returns the number of files removed; invalidating nothing is not an
  /// error.
  pub async fn invalidate(
    &self,
    identity: &RepositoryIdentity,
    branch: Option<&str>,
  ) -> Result<u64, GatewayError> {
    let removed = self.inner.store.invalidate(identity, branch)?;
    info!(repo = %identity, branch, removed, "invalidated");
    Ok(removed)
  }

  /// Forget a repository entirely: cached content, credential and the
  /// recent-repositories entry.
  pub async fn disconnect(&self, identity: &RepositoryIdentity) -> Result<(), GatewayError> {
    let removed = self.inner.store.invalidate(identity, None)?;
    self
      .inner
      .credentials
      .delete(identity)
      .map_err(credential_error)?;
    self.inner.store.forget_repository(identity)?;
    info!(repo = %identity, removed, "disconnected");
    Ok(())
  }

  pub fn get_connectivity(&self) -> ConnectivityState {
    self.inner.monitor.snapshot()
  }

  pub fn subscribe_connectivity(&self) -> watch::Receiver<ConnectivityState> {
    self.inner.monitor.subscribe()
  }

  /// Forward an OS network change notification.
  pub fn signal_network(&self, signal: NetworkSignal) {
    self.inner.monitor.signal(signal);
  }

  pub async fn recent_repositories(&self, limit: usize) -> Result<Vec<RecentRepository>, GatewayError> {
    Ok(self.inner.store.recent_repositories(limit)?)
  }

  pub async fn cache_stats(&self) -> Result<CacheStats, GatewayError> {
    Ok(self.inner.store.stats()?)
  }

  /// Run the global-limit sweep now.
  pub async fn sweep(&self) -> Result<EvictionReport, GatewayError> {
    self.inner.sweep()
  }
}

impl Inner {
  fn shutdown(&self) {
    self.cancel.cancel();
    self.scheduler.shutdown();
    self.monitor.shutdown();
  }

  fn sweep(&self) -> Result<EvictionReport, GatewayError> {
    let report = self.eviction.enforce_global()?;
    if !report.evicted.is_empty() {
      info!(
        evicted = report.evicted.len(),
        freed = report.freed_bytes,
        "sweep evicted entries"
      );
    }
    Ok(report)
  }

  fn token(&self, identity: &RepositoryIdentity) -> Result<Option<String>, GatewayError> {
    self.credentials.get(identity).map_err(credential_error)
  }

  async fn send(
    &self,
    identity: &RepositoryIdentity,
    request: HttpRequest,
    token: Option<&str>,
  ) -> Result<HttpResponse, RemoteError> {
    let call = Call {
      provider: identity.provider(),
      credential: token.map(credential_fingerprint),
      request,
    };
    self.remote.request(&call, &self.cancel).await
  }

  /// Network-first listing with the stored copy as the offline fallback.
  async fn listing<T, F, Fut>(
    &self,
    identity: &RepositoryIdentity,
    scope: &str,
    kind: ListingKind,
    fetch: F,
  ) -> Result<T, GatewayError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
  {
    let provider = identity.provider();
    let failure = if self.monitor.is_reachable(provider) {
      match fetch().await {
        Ok(items) => {
          self.store.store_listing(identity, scope, kind, &items)?;
          return Ok(items);
        }
        Err(e) if e.is_connectivity() => {
          warn!(repo = %identity, scope, error = %e, "listing fetch failed, trying stored copy");
          GatewayError::from(e)
        }
        Err(e) => return Err(e.into()),
      }
    } else {
      GatewayError::Offline { provider }
    };

    match self.store.get_listing::<T>(identity, scope, kind)? {
      Some(stored) => {
        debug!(repo = %identity, scope, fetched_at = %stored.fetched_at, "serving stored listing");
        Ok(stored.items)
      }
      None => Err(failure),
    }
  }

  /// Every page of a listing endpoint.
  async fn fetch_pages<T, P>(
    &self,
    identity: &RepositoryIdentity,
    endpoint: Endpoint<'_>,
    token: Option<&str>,
    parse: P,
  ) -> Result<Vec<T>, RemoteError>
  where
    P: Fn(&[u8]) -> Result<Vec<T>, RemoteError>,
  {
    let api = self.providers.for_repo(identity);
    let mut request = api.build_request(identity, endpoint, token)?;
    let mut items = Vec::new();

    for page in 1..=MAX_PAGES {
      let response = self.send(identity, request.clone(), token).await?;
      items.extend(parse(&response.body)?);
      match api.next_page(&request, &response) {
        Some(next) => request = next,
        None => return Ok(items),
      }
      debug!(repo = %identity, page, "following next page");
    }

    warn!(repo = %identity, pages = MAX_PAGES, "listing truncated at page limit");
    Ok(items)
  }

  async fn fetch_branches(
    &self,
    identity: &RepositoryIdentity,
    token: Option<&str>,
  ) -> Result<Vec<BranchInfo>, RemoteError> {
    let api = self.providers.for_repo(identity);
    let request = api.build_request(identity, Endpoint::RepositoryInfo, token)?;
    let info = self.send(identity, request, token).await?;
    let default_branch = api.parse_default_branch(&info.body)?;

    self
      .fetch_pages(identity, Endpoint::ListBranches, token, |body| {
        api.parse_branches(body, default_branch.as_deref())
      })
      .await
  }

  async fn fetch_tree(
    &self,
    identity: &RepositoryIdentity,
    branch: &str,
    token: Option<&str>,
  ) -> Result<Vec<TreeEntry>, RemoteError> {
    let api = self.providers.for_repo(identity);
    self
      .fetch_pages(identity, Endpoint::FetchTree { branch }, token, |body| {
        api.parse_tree(body)
      })
      .await
  }

  /// The body of a single-flight fetch. Runs in its own task.
  async fn fetch_and_store(&self, key: CacheKey, force_refresh: bool) -> Result<FetchedFile, GatewayError> {
    let _pin = self.store.pin(&key);

    let mut tag = None;
    if force_refresh {
      tag = self.store.peek(&key)?.and_then(|meta| meta.revalidation_tag);
    } else if let Some(hit) = self.store.get(&key)? {
      // Filled by a fetch that finished after the caller's lookup
      return Ok(FetchedFile::cached(hit));
    }

    let api = self.providers.for_repo(&key.repo);
    let token = self.token(&key.repo)?;
    loop {
      let endpoint = Endpoint::FetchFile {
        branch: &key.branch,
        path: &key.path,
      };
      let mut request = api.build_request(&key.repo, endpoint, token.as_deref())?;
      if let Some(value) = tag.as_deref().and_then(|t| HeaderValue::from_str(t).ok()) {
        request = request.with_header(IF_NONE_MATCH, value);
      }

      let response = self.send(&key.repo, request, token.as_deref()).await?;

      if response.status == 304 {
        if tag.is_none() {
          return Err(GatewayError::Unknown {
            message: "remote answered 304 to an unconditional request".into(),
            retry_after: None,
          });
        }
        if self.store.mark_revalidated(&key)? {
          if let Some(hit) = self.store.get(&key)? {
            debug!(key = %key, "revalidated");
            return Ok(FetchedFile::cached(hit));
          }
        }
        debug!(key = %key, "revalidated entry is gone, fetching in full");
        tag = None;
        continue;
      }

      let etag = response.header_str("etag").map(str::to_string);
      let meta = self.eviction.admit(&key, &response.body, etag.as_deref())?;
      debug!(key = %key, size = meta.size, "fetched and cached");

      return Ok(FetchedFile {
        content: response.body,
        served_from_cache: false,
        content_kind: meta.content_kind,
        fetched_at: meta.fetched_at_utc(),
        revalidation_tag: meta.revalidation_tag,
      });
    }
  }
}

impl Drop for Inner {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn credential_error(e: color_eyre::Report) -> GatewayError {
  GatewayError::Credentials(format!("{:#}", e))
}
