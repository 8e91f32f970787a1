//! Online/Offline/Recovering state machine.
//!
//! Transitions:
//! - Online -> Offline: network-down signal, or a probe finding no provider
//! - Offline -> Recovering: first failed recovery probe
//! - Offline/Recovering -> Online: a probe reaching at least one provider,
//!   scheduled or requested by a network-up signal
//!
//! Recovery probes back off from `recovery_base` to `recovery_max`; once
//! online the machine re-verifies every `steady_interval`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::repo::Provider;

use super::probe::Prober;
use super::state::{ConnectivityState, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
  pub probe_timeout: Duration,
  pub recovery_base: Duration,
  pub recovery_max: Duration,
  pub steady_interval: Duration,
}

impl Default for MonitorOptions {
  fn default() -> Self {
    Self {
      probe_timeout: Duration::from_secs(4),
      recovery_base: Duration::from_secs(2),
      recovery_max: Duration::from_secs(60),
      steady_interval: Duration::from_secs(30),
    }
  }
}

/// Low-level network change notification from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
  Up,
  Down,
}

type ProbeResults = BTreeMap<Provider, bool>;

pub struct ConnectivityMonitor {
  state: Arc<watch::Sender<ConnectivityState>>,
  signals: mpsc::UnboundedSender<NetworkSignal>,
  pending: Mutex<Option<mpsc::UnboundedReceiver<NetworkSignal>>>,
  prober: Arc<dyn Prober>,
  clock: Arc<dyn Clock>,
  options: MonitorOptions,
  cancel: CancellationToken,
}

impl ConnectivityMonitor {
  pub fn new(prober: Arc<dyn Prober>, clock: Arc<dyn Clock>, options: MonitorOptions) -> Self {
    let (state, _) = watch::channel(ConnectivityState::initial());
    let (signals, pending) = mpsc::unbounded_channel();
    Self {
      state: Arc::new(state),
      signals,
      pending: Mutex::new(Some(pending)),
      prober,
      clock,
      options,
      cancel: CancellationToken::new(),
    }
  }

  /// Start the state machine with an immediate probe. Returns `false` if it
  /// was already started.
  pub fn initialize(&self) -> bool {
    let Some(signals) = self
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take()
    else {
      return false;
    };

    let machine = Machine {
      state: Arc::clone(&self.state),
      prober: Arc::clone(&self.prober),
      clock: Arc::clone(&self.clock),
      options: self.options,
      recovery_interval: self.options.recovery_base,
    };
    tokio::spawn(machine.run(signals, self.cancel.clone()));
    info!("connectivity monitor started");
    true
  }

  pub fn shutdown(&self) {
    self.cancel.cancel();
  }

  pub fn snapshot(&self) -> ConnectivityState {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.state.subscribe()
  }

  pub fn signal(&self, signal: NetworkSignal) {
    // Only fails once the machine has stopped
    let _ = self.signals.send(signal);
  }

  pub fn is_reachable(&self, provider: Provider) -> bool {
    self.state.borrow().is_reachable(provider)
  }
}

impl Drop for ConnectivityMonitor {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

struct Machine {
  state: Arc<watch::Sender<ConnectivityState>>,
  prober: Arc<dyn Prober>,
  clock: Arc<dyn Clock>,
  options: MonitorOptions,
  recovery_interval: Duration,
}

impl Machine {
  async fn run(mut self, mut signals: mpsc::UnboundedReceiver<NetworkSignal>, cancel: CancellationToken) {
    let mut next_probe = Instant::now();
    let mut probe: BoxFuture<'static, ProbeResults> = future::pending().boxed();
    let mut probing = false;

    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        Some(signal) = signals.recv() => match signal {
          NetworkSignal::Down => {
            // Results of a probe started before the drop are stale
            probing = false;
            probe = future::pending().boxed();
            if self.go_offline() {
              next_probe = Instant::now() + self.next_recovery_delay();
            }
          }
          NetworkSignal::Up => {
            debug!("network up signal, probing now");
            if !probing {
              next_probe = Instant::now();
            }
          }
        },
        results = &mut probe, if probing => {
          probing = false;
          probe = future::pending().boxed();
          next_probe = Instant::now() + self.apply(results);
        }
        _ = tokio::time::sleep_until(next_probe), if !probing => {
          probing = true;
          probe = probe_all(Arc::clone(&self.prober), self.options.probe_timeout).boxed();
        }
      }
    }
    debug!("connectivity monitor stopped");
  }

  fn current(&self) -> ConnectivityState {
    self.state.borrow().clone()
  }

  fn publish(&self, next: ConnectivityState) {
    let previous = self.state.send_replace(next.clone());
    if previous.phase != next.phase {
      info!(from = %previous.phase, to = %next.phase, "connectivity changed");
    }
  }

  /// Returns `true` if this was a transition.
  fn go_offline(&mut self) -> bool {
    let current = self.current();
    if current.phase != Phase::Online {
      return false;
    }
    self.recovery_interval = self.options.recovery_base;
    self.publish(ConnectivityState {
      phase: Phase::Offline,
      providers: current.providers.keys().map(|&p| (p, false)).collect(),
      last_verified: current.last_verified,
    });
    true
  }

  /// Apply a probe round and return the delay until the next one.
  fn apply(&mut self, results: ProbeResults) -> Duration {
    let current = self.current();

    if results.values().any(|&reachable| reachable) {
      self.recovery_interval = self.options.recovery_base;
      self.publish(ConnectivityState {
        phase: Phase::Online,
        providers: results,
        last_verified: Some(self.clock.utc_now()),
      });
      return self.options.steady_interval;
    }

    match current.phase {
      Phase::Online => {
        self.go_offline();
      }
      Phase::Offline => {
        self.publish(ConnectivityState {
          phase: Phase::Recovering,
          ..current
        });
      }
      Phase::Recovering => {}
    }

    let delay = self.next_recovery_delay();
    debug!(next_probe_secs = delay.as_secs_f64(), "providers unreachable");
    delay
  }

  /// Current recovery delay; doubles the next one up to `recovery_max`.
  fn next_recovery_delay(&mut self) -> Duration {
    let delay = self.recovery_interval;
    self.recovery_interval = (delay * 2).min(self.options.recovery_max);
    delay
  }
}

/// Probe every provider in parallel, each bounded by `timeout`.
async fn probe_all(prober: Arc<dyn Prober>, timeout: Duration) -> ProbeResults {
  let checks = Provider::ALL.iter().map(|&provider| {
    let prober = Arc::clone(&prober);
    async move {
      let reachable = tokio::time::timeout(timeout, prober.probe(provider))
        .await
        .unwrap_or(false);
      (provider, reachable)
    }
  });
  future::join_all(checks).await.into_iter().collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::connectivity::probe::testing::ScriptedProber;

  fn monitor(prober: Arc<ScriptedProber>) -> ConnectivityMonitor {
    ConnectivityMonitor::new(prober, Arc::new(SystemClock::new()), MonitorOptions::default())
  }

  /// Collects every published snapshot.
  fn record(monitor: &ConnectivityMonitor) -> Arc<Mutex<Vec<ConnectivityState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut rx = monitor.subscribe();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();
        sink.lock().unwrap().push(state);
      }
    });
    seen
  }

  fn phases(seen: &Arc<Mutex<Vec<ConnectivityState>>>) -> Vec<Phase> {
    seen.lock().unwrap().iter().map(|s| s.phase).collect()
  }

  async fn wait(secs: f64) {
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_initial_state_before_first_probe() {
    let monitor = monitor(Arc::new(ScriptedProber::new(true)));
    let state = monitor.snapshot();
    assert!(state.is_online());
    assert!(state.last_verified.is_none());
    assert!(monitor.is_reachable(Provider::AzureDevOps));
  }

  #[tokio::test(start_paused = true)]
  async fn test_initialize_probes_immediately() {
    let prober = Arc::new(ScriptedProber::new(true));
    let monitor = monitor(prober.clone());
    assert!(monitor.initialize());
    assert!(!monitor.initialize());

    wait(0.1).await;
    assert_eq!(prober.rounds(), 1);
    assert!(monitor.snapshot().last_verified.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_down_then_up_signal() {
    let prober = Arc::new(ScriptedProber::new(true));
    let monitor = monitor(prober.clone());
    monitor.initialize();
    wait(1.0).await;

    prober.set_all(false);
    monitor.signal(NetworkSignal::Down);
    let started = Instant::now();
    let mut rx = monitor.subscribe();
    while rx.borrow_and_update().phase != Phase::Offline {
      rx.changed().await.unwrap();
    }
    assert!(started.elapsed() <= Duration::from_secs(2));
    assert!(!monitor.is_reachable(Provider::GitHub));

    prober.set_all(true);
    monitor.signal(NetworkSignal::Up);
    let started = Instant::now();
    while !rx.borrow_and_update().is_online() {
      rx.changed().await.unwrap();
    }
    assert!(started.elapsed() <= Duration::from_secs(6));
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovery_backs_off_and_publishes_once() {
    let prober = Arc::new(ScriptedProber::new(false));
    let monitor = monitor(prober.clone());
    let seen = record(&monitor);
    monitor.initialize();

    // Rounds at 0s (fails -> Offline), 2s (-> Recovering), 6s, 14s, 30s
    wait(15.0).await;
    assert_eq!(prober.rounds(), 4);
    assert_eq!(phases(&seen), vec![Phase::Offline, Phase::Recovering]);

    wait(14.0).await;
    assert_eq!(prober.rounds(), 4);

    prober.set_all(true);
    wait(2.0).await;
    assert_eq!(prober.rounds(), 5);
    assert_eq!(
      phases(&seen),
      vec![Phase::Offline, Phase::Recovering, Phase::Online]
    );

    // Back to the steady interval: next round 30s after recovery
    wait(28.0).await;
    assert_eq!(prober.rounds(), 5);
    wait(2.0).await;
    assert_eq!(prober.rounds(), 6);
  }

  #[tokio::test(start_paused = true)]
  async fn test_down_signal_backs_off_like_a_failed_probe() {
    let prober = Arc::new(ScriptedProber::new(true));
    let monitor = monitor(prober.clone());
    monitor.initialize();
    wait(1.0).await;
    assert_eq!(prober.rounds(), 1);

    prober.set_all(false);
    monitor.signal(NetworkSignal::Down);

    // Recovery rounds 2s, 6s and 14s after the signal
    wait(2.5).await;
    assert_eq!(prober.rounds(), 2);
    wait(2.0).await;
    assert_eq!(prober.rounds(), 2);
    wait(2.0).await;
    assert_eq!(prober.rounds(), 3);
    wait(8.0).await;
    assert_eq!(prober.rounds(), 4);
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovery_interval_is_capped() {
    let prober = Arc::new(ScriptedProber::new(false));
    let monitor = monitor(prober.clone());
    monitor.initialize();

    // 0, 2, 6, 14, 30, 62, then every 60s: 122, 182
    wait(183.0).await;
    assert_eq!(prober.rounds(), 8);
  }

  #[tokio::test(start_paused = true)]
  async fn test_steady_state_reverification_publishes() {
    let prober = Arc::new(ScriptedProber::new(true));
    let monitor = monitor(prober.clone());
    let seen = record(&monitor);
    monitor.initialize();

    wait(61.0).await;
    assert_eq!(prober.rounds(), 3);
    assert_eq!(seen.lock().unwrap().len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_per_provider_reachability() {
    let prober = Arc::new(ScriptedProber::new(true));
    prober.set(Provider::AzureDevOps, false);
    let monitor = monitor(prober.clone());
    monitor.initialize();
    wait(0.1).await;

    let state = monitor.snapshot();
    assert!(state.is_online());
    assert!(monitor.is_reachable(Provider::GitHub));
    assert!(!monitor.is_reachable(Provider::AzureDevOps));
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_probe_times_out() {
    let prober = Arc::new(ScriptedProber::new(true).with_delay(Duration::from_secs(3600)));
    let monitor = monitor(prober.clone());
    monitor.initialize();

    wait(5.0).await;
    assert_eq!(monitor.snapshot().phase, Phase::Offline);
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_stops_probing() {
    let prober = Arc::new(ScriptedProber::new(true));
    let monitor = monitor(prober.clone());
    monitor.initialize();
    wait(0.1).await;
    monitor.shutdown();

    wait(120.0).await;
    assert_eq!(prober.rounds(), 1);
  }
}
