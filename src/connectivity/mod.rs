//! Connectivity tracking: push signals plus active probes.

mod monitor;
mod probe;
mod state;

pub use monitor::{ConnectivityMonitor, MonitorOptions, NetworkSignal};
pub use probe::{HttpProber, Prober};
pub use state::{ConnectivityState, Phase};

#[cfg(test)]
pub(crate) use probe::testing;
