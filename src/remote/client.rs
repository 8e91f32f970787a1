use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::Clock;
use crate::repo::Provider;

use super::error::RemoteError;
use super::rate_limit::{RateLimitScope, RateLimitTracker};
use super::retry::{retry, RetryError, RetryPolicy};
use super::transport::{HttpRequest, HttpResponse, Transport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteOptions {
  pub policy: RetryPolicy,
  /// Bound on a whole call, retries included
  pub call_timeout: Duration,
  /// Bound on one network attempt
  pub attempt_timeout: Duration,
}

impl Default for RemoteOptions {
  fn default() -> Self {
    Self {
      policy: RetryPolicy::default(),
      call_timeout: Duration::from_secs(60),
      attempt_timeout: Duration::from_secs(30),
    }
  }
}

/// One outbound call.
#[derive(Debug, Clone)]
pub struct Call {
  pub provider: Provider,
  /// Fingerprint of the credential attached to the request, if any
  pub credential: Option<String>,
  pub request: HttpRequest,
}

/// Remote API client with backoff, rate-limit bookkeeping and timeouts.
///
/// Performs no caching and no disk I/O.
pub struct RemoteClient {
  transport: Arc<dyn Transport>,
  clock: Arc<dyn Clock>,
  limits: RateLimitTracker,
  options: RemoteOptions,
}

impl RemoteClient {
  pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, options: RemoteOptions) -> Self {
    Self {
      transport,
      clock,
      limits: RateLimitTracker::new(),
      options,
    }
  }

  /// Send `call`, retrying transient failures.
  ///
  /// Dropping the returned future, cancelling `cancel` or hitting the call
  /// timeout aborts the in-flight network operation. `2xx` and `304` are
  /// successes; everything else is classified into a [`RemoteError`].
  pub async fn request(&self, call: &Call, cancel: &CancellationToken) -> Result<HttpResponse, RemoteError> {
    let scope = RateLimitScope {
      provider: call.provider,
      credential: call.credential.clone(),
    };

    let work = retry(&self.options.policy, RemoteError::is_transient, |attempt| {
      self.attempt(&scope, call, attempt)
    });

    tokio::select! {
      _ = cancel.cancelled() => Err(RemoteError::Cancelled),
      result = tokio::time::timeout(self.options.call_timeout, work) => match result {
        Err(_) => Err(RemoteError::Timeout),
        Ok(Ok(response)) => Ok(response),
        Ok(Err(RetryError::Permanent(e))) => Err(e),
        Ok(Err(RetryError::Exhausted { last, attempts, wait_hint })) => Err(RemoteError::Exhausted {
          last: Box::new(last),
          attempts,
          wait_hint,
        }),
      },
    }
  }

  async fn attempt(&self, scope: &RateLimitScope, call: &Call, attempt: u32) -> Result<HttpResponse, RemoteError> {
    let now = self.clock.utc_now();
    if let Some(reset_at) = self.limits.blocked_until(scope, now) {
      debug!(provider = %call.provider, %reset_at, "rate limit exhausted, not sending");
      return Err(RemoteError::RateLimited { reset_at });
    }

    let mut request = call.request.clone();
    request.timeout = Some(self.options.attempt_timeout);

    debug!(
      provider = %call.provider,
      method = %request.method,
      path = request.url.path(),
      attempt,
      "sending request"
    );
    let response = self.transport.send(request).await?;

    let now = self.clock.utc_now();
    self
      .limits
      .observe(scope, response.status, &response.headers, now);
    self.classify(scope, call, response, now)
  }

  fn classify(
    &self,
    scope: &RateLimitScope,
    call: &Call,
    response: HttpResponse,
    now: DateTime<Utc>,
  ) -> Result<HttpResponse, RemoteError> {
    match response.status {
      200..=299 | 304 => Ok(response),
      401 => Err(RemoteError::Unauthorized {
        status: 401,
        credentialed: call.credential.is_some(),
      }),
      403 | 429 => match self.limits.blocked_until(scope, now) {
        Some(reset_at) => Err(RemoteError::RateLimited { reset_at }),
        None if response.status == 403 => Err(RemoteError::Forbidden),
        None => Err(RemoteError::Status { status: 429 }),
      },
      404 | 410 => Err(RemoteError::NotFound),
      status => Err(RemoteError::Status { status }),
    }
  }
}
