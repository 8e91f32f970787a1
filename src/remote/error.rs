use std::time::Duration;

use chrono::{DateTime, Utc};

use super::transport::TransportError;

/// Classified failure of one remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
  #[error("rate limited until {reset_at}")]
  RateLimited { reset_at: DateTime<Utc> },
  #[error("authentication rejected (HTTP {status})")]
  Unauthorized { status: u16, credentialed: bool },
  #[error("access forbidden")]
  Forbidden,
  #[error("not found")]
  NotFound,
  #[error("remote returned HTTP {status}")]
  Status { status: u16 },
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error("request timed out")]
  Timeout,
  #[error("request cancelled")]
  Cancelled,
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  #[error("invalid response: {0}")]
  InvalidResponse(String),
  #[error("{last} (gave up after {attempts} attempts)")]
  Exhausted {
    last: Box<RemoteError>,
    attempts: u32,
    wait_hint: Duration,
  },
}

impl RemoteError {
  /// Failures the retry loop may try again: 429, 5xx and connection-level
  /// errors.
  pub fn is_transient(&self) -> bool {
    match self {
      RemoteError::Status { status } => *status == 429 || *status >= 500,
      RemoteError::Transport(e) => e.is_transient(),
      _ => false,
    }
  }

  /// Whether the error says nothing about the remote being reachable.
  pub fn is_connectivity(&self) -> bool {
    match self {
      RemoteError::Transport(e) => e.is_transient(),
      RemoteError::Timeout => true,
      RemoteError::Exhausted { last, .. } => last.is_connectivity(),
      _ => false,
    }
  }
}
