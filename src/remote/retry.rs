//! Exponential backoff with jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// Total attempts including the first; `None` retries until the caller's
  /// overall timeout.
  pub max_attempts: Option<u32>,
  /// Upper bound of the random extra delay, as a fraction of the
  /// exponential delay
  pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(32),
      max_attempts: Some(5),
      jitter_ratio: 0.25,
    }
  }
}

impl RetryPolicy {
  /// `min(base * 2^attempt, max)`, without jitter.
  pub fn base_delay_for(&self, attempt: u32) -> Duration {
    2u32
      .checked_pow(attempt)
      .and_then(|factor| self.base_delay.checked_mul(factor))
      .map_or(self.max_delay, |delay| delay.min(self.max_delay))
  }

  /// `min(base * 2^attempt + jitter, max)` where `unit` in `[0, 1)` picks
  /// the jitter within its range.
  pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
    let exponential = self.base_delay_for(attempt);
    let jitter = exponential.mul_f64(self.jitter_ratio.max(0.0) * unit.clamp(0.0, 1.0));
    (exponential + jitter).min(self.max_delay)
  }

  /// Delay to wait after failed attempt `attempt` (0-indexed).
  pub fn compute_delay(&self, attempt: u32) -> Duration {
    self.delay_with_jitter(attempt, rand::random::<f64>())
  }

  /// Whether attempt number `attempt` (0-indexed) may run.
  pub fn allows_attempt(&self, attempt: u32) -> bool {
    self.max_attempts.map_or(true, |max| attempt < max)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
  /// Non-transient failure, returned without retrying
  Permanent(E),
  /// Transient failures until the attempt budget ran out
  Exhausted {
    last: E,
    attempts: u32,
    wait_hint: Duration,
  },
}

/// Run `op` until it succeeds, fails permanently or runs out of attempts.
///
/// `op` receives the 0-indexed attempt number. Only errors for which
/// `is_transient` holds are retried.
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, is_transient: P, mut op: F) -> Result<T, RetryError<E>>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Result<T, E>>,
  P: Fn(&E) -> bool,
  E: Display,
{
  let mut attempt = 0u32;
  loop {
    let error = match op(attempt).await {
      Ok(value) => return Ok(value),
      Err(e) if !is_transient(&e) => return Err(RetryError::Permanent(e)),
      Err(e) => e,
    };

    let delay = policy.compute_delay(attempt);
    if !policy.allows_attempt(attempt + 1) {
      return Err(RetryError::Exhausted {
        last: error,
        attempts: attempt + 1,
        wait_hint: delay,
      });
    }

    warn!(
      attempt = attempt + 1,
      max_attempts = ?policy.max_attempts,
      delay_ms = delay.as_millis() as u64,
      error = %error,
      "transient failure, retrying"
    );
    tokio::time::sleep(delay).await;
    attempt += 1;
  }
}
