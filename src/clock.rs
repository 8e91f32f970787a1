//! Time source and cancellable delayed/periodic task execution.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Monotonic and wall-clock time source.
pub trait Clock: Send + Sync + 'static {
  /// Monotonic instant for deadlines and elapsed-time measurement.
  fn now(&self) -> Instant;

  /// Wall-clock time in Unix milliseconds, used for persisted timestamps.
  fn unix_millis(&self) -> i64;

  fn utc_now(&self) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(self.unix_millis()).unwrap_or_default()
  }
}

/// System clock whose wall time advances with tokio's clock.
///
/// The wall clock is sampled once and then derived from the monotonic clock,
/// so a paused tokio runtime also freezes (and auto-advances) wall time.
#[derive(Debug, Clone)]
pub struct SystemClock {
  origin: Instant,
  origin_unix_ms: i64,
}

impl SystemClock {
  pub fn new() -> Self {
    Self {
      origin: Instant::now(),
      origin_unix_ms: Utc::now().timestamp_millis(),
    }
  }
}

impl Default for SystemClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }

  fn unix_millis(&self) -> i64 {
    let elapsed = self.origin.elapsed().as_millis();
    self.origin_unix_ms + i64::try_from(elapsed).unwrap_or(i64::MAX / 2)
  }
}

/// Handle to a scheduled task. Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
  cancel: CancellationToken,
  join: JoinHandle<()>,
}

impl TaskHandle {
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub fn is_finished(&self) -> bool {
    self.join.is_finished()
  }
}

/// Runs delayed and periodic tasks on the tokio runtime.
///
/// Every task gets a child of the scheduler's root token, so
/// [`Scheduler::shutdown`] cancels everything the scheduler started.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
  root: CancellationToken,
}

impl Scheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `task` once after `delay` unless cancelled first.
  pub fn after<F, Fut>(&self, delay: Duration, task: F) -> TaskHandle
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let cancel = self.root.child_token();
    let token = cancel.clone();
    let join = tokio::spawn(async move {
      tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(delay) => task().await,
      }
    });
    TaskHandle { cancel, join }
  }

  /// Run `task` every `interval`, first run one interval from now.
  ///
  /// A run that overruns the interval delays the next one instead of
  /// bursting to catch up.
  pub fn every<F, Fut>(&self, interval: Duration, mut task: F) -> TaskHandle
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let cancel = self.root.child_token();
    let token = cancel.clone();
    let join = tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          _ = ticker.tick() => {
            tokio::select! {
              _ = token.cancelled() => break,
              _ = task() => {}
            }
          }
        }
      }
    });
    TaskHandle { cancel, join }
  }

  /// Cancel every task started by this scheduler.
  pub fn shutdown(&self) {
    self.root.cancel();
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  #[tokio::test(start_paused = true)]
  async fn test_system_clock_follows_tokio_time() {
    let clock = SystemClock::new();
    let before = clock.unix_millis();
    tokio::time::sleep(Duration::from_secs(30)).await;
    let after = clock.unix_millis();
    assert!(after - before >= 30_000);
  }

  #[tokio::test(start_paused = true)]
  async fn test_after_runs_once() {
    let scheduler = Scheduler::new();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();

    let handle = scheduler.after(Duration::from_secs(5), move || async move {
      counter.fetch_add(1, Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(handle.is_finished());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_after_never_runs() {
    let scheduler = Scheduler::new();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();

    let handle = scheduler.after(Duration::from_secs(5), move || async move {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    handle.cancel();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_every_repeats_until_shutdown() {
    let scheduler = Scheduler::new();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();

    let _handle = scheduler.every(Duration::from_secs(10), move || {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    scheduler.shutdown();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);
  }
}
