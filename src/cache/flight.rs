//! Keyed single-flight: at most one in-flight operation per key.
//!
//! Each operation runs in its own task, so a caller that stops waiting
//! does not cancel the work; later callers for the same key join it and
//! receive a clone of its result.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlightError {
  #[error("in-flight operation panicked")]
  Panicked,
  #[error("in-flight operation was aborted")]
  Aborted,
}

/// Awaitable handle on an in-flight operation. Cheap to clone.
pub type Flight<V> = Shared<BoxFuture<'static, Result<V, FlightError>>>;

type FlightMap<K, V> = Arc<Mutex<HashMap<K, Flight<V>>>>;

pub struct SingleFlight<K, V> {
  flights: FlightMap<K, V>,
}

impl<K, V> Clone for SingleFlight<K, V> {
  fn clone(&self) -> Self {
    Self {
      flights: Arc::clone(&self.flights),
    }
  }
}

impl<K, V> Default for SingleFlight<K, V> {
  fn default() -> Self {
    Self {
      flights: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl<K, V> SingleFlight<K, V>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<K, Flight<V>>> {
    self.flights.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Join the operation in flight for `key`, or start `op` as a new one.
  pub fn run<F, Fut>(&self, key: K, op: F) -> Flight<V>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = V> + Send + 'static,
  {
    let mut flights = self.lock();
    if let Some(existing) = flights.get(&key) {
      return existing.clone();
    }

    // The map stays locked until the flight is registered, so the
    // deregistration below can never run ahead of the insert.
    let deregister = Deregister {
      flights: Arc::clone(&self.flights),
      key: key.clone(),
    };
    let work = op();
    let handle = tokio::spawn(async move {
      let _deregister = deregister;
      work.await
    });

    let flight = async move {
      handle.await.map_err(|e| {
        if e.is_panic() {
          FlightError::Panicked
        } else {
          FlightError::Aborted
        }
      })
    }
    .boxed()
    .shared();

    flights.insert(key, flight.clone());
    flight
  }

  /// The operation in flight for `key`, if any.
  pub fn join(&self, key: &K) -> Option<Flight<V>> {
    self.lock().get(key).cloned()
  }

  pub fn contains(&self, key: &K) -> bool {
    self.lock().contains_key(key)
  }

  pub fn in_flight(&self) -> usize {
    self.lock().len()
  }
}

/// Removes a finished flight from the map, also when its task panics.
struct Deregister<K: Eq + Hash, V> {
  flights: FlightMap<K, V>,
  key: K,
}

impl<K: Eq + Hash, V> Drop for Deregister<K, V> {
  fn drop(&mut self) {
    self
      .flights
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&self.key);
  }
}
