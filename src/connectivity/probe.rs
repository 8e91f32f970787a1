use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::provider::Providers;
use crate::remote::{HttpRequest, Transport};
use crate::repo::Provider;

/// Lightweight, unauthenticated reachability check.
#[async_trait]
pub trait Prober: Send + Sync {
  /// Whether `provider` answered at all. A failed probe is final; the
  /// monitor decides when to probe again.
  async fn probe(&self, provider: Provider) -> bool;
}

/// Probes each provider's public endpoint over HTTP.
///
/// Any HTTP response, error statuses included, proves the provider is
/// reachable; only transport failures count as unreachable.
pub struct HttpProber {
  transport: Arc<dyn Transport>,
  requests: BTreeMap<Provider, HttpRequest>,
}

impl HttpProber {
  pub fn new(transport: Arc<dyn Transport>, providers: &Providers, timeout: Duration) -> Self {
    let requests = Provider::ALL
      .iter()
      .map(|&p| {
        let mut request = providers.get(p).probe_request();
        request.timeout = Some(timeout);
        (p, request)
      })
      .collect();
    Self {
      transport,
      requests,
    }
  }
}

#[async_trait]
impl Prober for HttpProber {
  async fn probe(&self, provider: Provider) -> bool {
    let Some(request) = self.requests.get(&provider) else {
      return false;
    };
    match self.transport.send(request.clone()).await {
      Ok(response) => {
        debug!(%provider, status = response.status, "probe answered");
        true
      }
      Err(e) => {
        debug!(%provider, error = %e, "probe failed");
        false
      }
    }
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Mutex;

  use super::*;

  /// Prober with switchable per-provider answers.
  pub struct ScriptedProber {
    reachable: Mutex<BTreeMap<Provider, bool>>,
    delay: Duration,
    calls: AtomicU32,
  }

  impl ScriptedProber {
    pub fn new(reachable: bool) -> Self {
      Self {
        reachable: Mutex::new(Provider::ALL.iter().map(|&p| (p, reachable)).collect()),
        delay: Duration::ZERO,
        calls: AtomicU32::new(0),
      }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = delay;
      self
    }

    pub fn set(&self, provider: Provider, reachable: bool) {
      self.reachable.lock().unwrap().insert(provider, reachable);
    }

    pub fn set_all(&self, reachable: bool) {
      for provider in Provider::ALL {
        self.set(provider, reachable);
      }
    }

    /// Probe rounds so far (one call per provider per round).
    pub fn rounds(&self) -> u32 {
      self.calls.load(Ordering::SeqCst) / Provider::ALL.len() as u32
    }
  }

  #[async_trait]
  impl Prober for ScriptedProber {
    async fn probe(&self, provider: Provider) -> bool {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      self.reachable.lock().unwrap()[&provider]
    }
  }
}
