use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::{EvictionError, FlightError};
use crate::remote::{RemoteError, TransportError};
use crate::repo::{IdentityError, Provider};

/// Every failure a gateway caller can see.
///
/// Remote and connectivity failures are mapped into this taxonomy; nothing
/// from the lower layers is passed through raw.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
  #[error("{provider} is unreachable")]
  Offline { provider: Provider },
  #[error("rate limited until {reset_at}")]
  RateLimited { reset_at: DateTime<Utc> },
  #[error("authentication failed")]
  AuthFailed,
  #[error("credentials expired or were revoked")]
  AuthExpired,
  #[error("not found")]
  NotFound,
  #[error("request timed out")]
  Timeout {
    /// Backoff the remote client had reached, when it retried first
    retry_after: Option<Duration>,
  },
  #[error("file of {size} bytes exceeds the {limit} byte cache limit")]
  CacheEntryTooLarge { size: u64, limit: u64 },
  #[error("invalid repository: {0}")]
  InvalidRepository(String),
  #[error("local storage failure: {0}")]
  Storage(String),
  #[error("credential store failure: {0}")]
  Credentials(String),
  #[error("cancelled")]
  Cancelled,
  #[error("{message}")]
  Unknown {
    message: String,
    /// Backoff the remote client had reached when it gave up
    retry_after: Option<Duration>,
  },
}

impl GatewayError {
  /// Whether invoking the same operation again later can succeed.
  pub fn retryable(&self) -> bool {
    matches!(
      self,
      GatewayError::Offline { .. }
        | GatewayError::RateLimited { .. }
        | GatewayError::Timeout { .. }
        | GatewayError::Unknown { .. }
    )
  }

  /// Failures of this machine (disk, credential store) rather than the remote.
  pub fn is_local(&self) -> bool {
    matches!(
      self,
      GatewayError::Storage(_) | GatewayError::Credentials(_) | GatewayError::CacheEntryTooLarge { .. }
    )
  }

  fn unknown(message: impl Into<String>) -> Self {
    GatewayError::Unknown {
      message: message.into(),
      retry_after: None,
    }
  }
}

impl From<RemoteError> for GatewayError {
  fn from(e: RemoteError) -> Self {
    match e {
      RemoteError::RateLimited { reset_at } => GatewayError::RateLimited { reset_at },
      RemoteError::Unauthorized { credentialed: true, .. } => GatewayError::AuthExpired,
      RemoteError::Unauthorized { credentialed: false, .. } => GatewayError::AuthFailed,
      RemoteError::Forbidden => GatewayError::AuthFailed,
      RemoteError::NotFound => GatewayError::NotFound,
      RemoteError::Timeout | RemoteError::Transport(TransportError::Timeout) => {
        GatewayError::Timeout { retry_after: None }
      }
      RemoteError::Cancelled => GatewayError::Cancelled,
      RemoteError::Exhausted {
        last,
        attempts,
        wait_hint,
      } => match GatewayError::from(*last) {
        GatewayError::Unknown { message, .. } => GatewayError::Unknown {
          message: format!("{} (gave up after {} attempts)", message, attempts),
          retry_after: Some(wait_hint),
        },
        GatewayError::Timeout { .. } => GatewayError::Timeout {
          retry_after: Some(wait_hint),
        },
        other => other,
      },
      other @ (RemoteError::Status { .. }
      | RemoteError::Transport(_)
      | RemoteError::InvalidRequest(_)
      | RemoteError::InvalidResponse(_)) => GatewayError::unknown(other.to_string()),
    }
  }
}

impl From<EvictionError> for GatewayError {
  fn from(e: EvictionError) -> Self {
    match e {
      EvictionError::TooLarge { size, limit } => GatewayError::CacheEntryTooLarge { size, limit },
      full @ EvictionError::Full { .. } => GatewayError::Storage(full.to_string()),
      EvictionError::Store(message) => GatewayError::Storage(message),
    }
  }
}

impl From<IdentityError> for GatewayError {
  fn from(e: IdentityError) -> Self {
    GatewayError::InvalidRepository(e.to_string())
  }
}

impl From<FlightError> for GatewayError {
  fn from(e: FlightError) -> Self {
    GatewayError::unknown(format!("fetch task failed: {}", e))
  }
}

/// Index and blob I/O failures surface as local storage errors.
impl From<color_eyre::Report> for GatewayError {
  fn from(e: color_eyre::Report) -> Self {
    GatewayError::Storage(format!("{:#}", e))
  }
}
