use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::repo::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
  Online,
  Offline,
  Recovering,
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Phase::Online => write!(f, "online"),
      Phase::Offline => write!(f, "offline"),
      Phase::Recovering => write!(f, "recovering"),
    }
  }
}

/// Immutable connectivity snapshot handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
  pub phase: Phase,
  /// Reachability per provider as of the last probe
  pub providers: BTreeMap<Provider, bool>,
  pub last_verified: Option<DateTime<Utc>>,
}

impl ConnectivityState {
  /// Before the first probe every provider is assumed reachable.
  pub fn initial() -> Self {
    Self {
      phase: Phase::Online,
      providers: Provider::ALL.iter().map(|&p| (p, true)).collect(),
      last_verified: None,
    }
  }

  pub fn is_online(&self) -> bool {
    self.phase == Phase::Online
  }

  pub fn is_recovering(&self) -> bool {
    self.phase == Phase::Recovering
  }

  /// Whether operations against `provider` may use the network.
  pub fn is_reachable(&self, provider: Provider) -> bool {
    self.is_online() && self.providers.get(&provider).copied().unwrap_or(false)
  }
}

impl Default for ConnectivityState {
  fn default() -> Self {
    Self::initial()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_reachability_requires_online() {
    let mut state = ConnectivityState::initial();
    assert!(state.is_reachable(Provider::GitHub));

    state.providers.insert(Provider::AzureDevOps, false);
    assert!(state.is_reachable(Provider::GitHub));
    assert!(!state.is_reachable(Provider::AzureDevOps));

    state.phase = Phase::Recovering;
    assert!(!state.is_reachable(Provider::GitHub));
    assert!(state.is_recovering());
  }
}
