//! Upstream API rate-limit bookkeeping.
//!
//! Reads `X-RateLimit-*` (GitHub) or the IETF `RateLimit-*` headers and
//! `Retry-After` from every response, per provider and credential, so a
//! call against an exhausted budget can fail without touching the network.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::repo::Provider;

/// Reset values below this are relative seconds rather than epoch seconds.
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

/// Budget tracked for one provider and credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
  pub limit: Option<u64>,
  pub remaining: Option<u64>,
  pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitState {
  fn exhausted_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match (self.remaining, self.reset_at) {
      (Some(0), Some(reset_at)) if reset_at > now => Some(reset_at),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitScope {
  pub provider: Provider,
  /// Fingerprint of the credential, never the credential itself
  pub credential: Option<String>,
}

/// Short, non-reversible identifier for a token.
pub fn credential_fingerprint(token: &str) -> String {
  hex::encode(&Sha256::digest(token.as_bytes())[..6])
}

#[derive(Debug, Default)]
pub struct RateLimitTracker {
  states: Mutex<HashMap<RateLimitScope, RateLimitState>>,
}

impl RateLimitTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn snapshot(&self, scope: &RateLimitScope) -> Option<RateLimitState> {
    self
      .states
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(scope)
      .copied()
  }

  /// Reset time when the budget is used up and the reset is still ahead.
  pub fn blocked_until(&self, scope: &RateLimitScope, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self.snapshot(scope)?.exhausted_until(now)
  }

  /// Update the budget from a response. Missing headers leave the prior
  /// state unchanged.
  pub fn observe(&self, scope: &RateLimitScope, status: u16, headers: &HeaderMap, now: DateTime<Utc>) {
    let limit = header_u64(headers, "X-RateLimit-Limit", "RateLimit-Limit");
    let remaining = header_u64(headers, "X-RateLimit-Remaining", "RateLimit-Remaining");
    let reset = header_i64(headers, "X-RateLimit-Reset", "RateLimit-Reset")
      .and_then(|value| reset_time(value, now));
    let retry_after = headers
      .get("Retry-After")
      .and_then(|v| v.to_str().ok())
      .and_then(|v| retry_after_time(v, now));

    let throttled = (status == 429 || status == 403) && (retry_after.is_some() || remaining == Some(0));
    let throttled = throttled || (status == 429 && reset.is_some());

    if limit.is_none() && remaining.is_none() && reset.is_none() && retry_after.is_none() {
      return;
    }

    let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
    let state = states.entry(scope.clone()).or_default();
    if let Some(limit) = limit {
      state.limit = Some(limit);
    }
    if let Some(remaining) = remaining {
      state.remaining = Some(remaining);
    }
    if let Some(reset) = reset {
      state.reset_at = Some(reset);
    }

    if throttled {
      state.remaining = Some(0);
      if let Some(retry_after) = retry_after {
        state.reset_at = Some(state.reset_at.map_or(retry_after, |r| r.max(retry_after)));
      }
      info!(
        provider = %scope.provider,
        status,
        reset_at = ?state.reset_at,
        "rate limit exhausted"
      );
    } else {
      debug!(
        provider = %scope.provider,
        remaining = ?state.remaining,
        limit = ?state.limit,
        "rate limit updated"
      );
    }
  }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str, fallback: &str) -> Option<&'a str> {
  headers
    .get(name)
    .or_else(|| headers.get(fallback))
    .and_then(|v| v.to_str().ok())
}

fn header_u64(headers: &HeaderMap, name: &str, fallback: &str) -> Option<u64> {
  header_str(headers, name, fallback).and_then(|v| v.trim().parse().ok())
}

fn header_i64(headers: &HeaderMap, name: &str, fallback: &str) -> Option<i64> {
  header_str(headers, name, fallback).and_then(|v| v.trim().parse().ok())
}

fn reset_time(value: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
  if value < 0 {
    None
  } else if value < EPOCH_THRESHOLD {
    Some(now + ChronoDuration::seconds(value))
  } else {
    DateTime::from_timestamp(value, 0)
  }
}

/// `Retry-After` is either delta seconds or an HTTP date.
fn retry_after_time(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
  let value = value.trim();
  if let Ok(seconds) = value.parse::<i64>() {
    return (seconds >= 0).then(|| now + ChronoDuration::seconds(seconds));
  }
  DateTime::parse_from_rfc2822(value)
    .ok()
    .map(|date| date.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scope() -> RateLimitScope {
    RateLimitScope {
      provider: Provider::GitHub,
      credential: Some(credential_fingerprint("token")),
    }
  }

  fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
      map.insert(*name, value.parse().unwrap());
    }
    map
  }

  fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
  }

  #[test]
  fn test_update_from_github_headers() {
    let tracker = RateLimitTracker::new();
    tracker.observe(
      &scope(),
      200,
      &headers(&[
        ("X-RateLimit-Limit", "5000"),
        ("X-RateLimit-Remaining", "42"),
        ("X-RateLimit-Reset", "1700000600"),
      ]),
      now(),
    );

    let state = tracker.snapshot(&scope()).unwrap();
    assert_eq!(state.limit, Some(5000));
    assert_eq!(state.remaining, Some(42));
    assert_eq!(state.reset_at, DateTime::from_timestamp(1_700_000_600, 0));
    assert_eq!(tracker.blocked_until(&scope(), now()), None);
  }

  #[test]
  fn test_ietf_reset_is_relative() {
    let tracker = RateLimitTracker::new();
    tracker.observe(
      &scope(),
      200,
      &headers(&[("RateLimit-Remaining", "0"), ("RateLimit-Reset", "30")]),
      now(),
    );
    assert_eq!(
      tracker.blocked_until(&scope(), now()),
      Some(now() + ChronoDuration::seconds(30))
    );
  }

  #[test]
  fn test_missing_headers_keep_prior_state() {
    let tracker = RateLimitTracker::new();
    tracker.observe(&scope(), 200, &headers(&[("X-RateLimit-Remaining", "7")]), now());
    tracker.observe(&scope(), 200, &HeaderMap::new(), now());
    assert_eq!(tracker.snapshot(&scope()).unwrap().remaining, Some(7));
  }

  #[test]
  fn test_429_with_retry_after_blocks_until_then() {
    let tracker = RateLimitTracker::new();
    tracker.observe(&scope(), 429, &headers(&[("Retry-After", "30")]), now());

    let reset = now() + ChronoDuration::seconds(30);
    assert_eq!(tracker.blocked_until(&scope(), now()), Some(reset));
    assert_eq!(
      tracker.blocked_until(&scope(), now() + ChronoDuration::seconds(29)),
      Some(reset)
    );
    assert_eq!(tracker.blocked_until(&scope(), reset), None);
  }

  #[test]
  fn test_scopes_are_independent() {
    let tracker = RateLimitTracker::new();
    tracker.observe(&scope(), 429, &headers(&[("Retry-After", "30")]), now());

    let other = RateLimitScope {
      provider: Provider::GitHub,
      credential: Some(credential_fingerprint("other-token")),
    };
    assert_eq!(tracker.blocked_until(&other, now()), None);
  }

  #[test]
  fn test_retry_after_http_date() {
    let parsed = retry_after_time("Tue, 14 Nov 2023 22:13:50 GMT", now()).unwrap();
    assert_eq!(parsed, DateTime::from_timestamp(1_700_000_030, 0).unwrap());
  }
}
