//! Read-through, size-bounded cache and sync engine for remote Git
//! repositories hosted on GitHub and Azure DevOps.
//!
//! The UI layer talks to [`gateway::Gateway`]; everything else is plumbing
//! behind it.

pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod gateway;
pub mod logging;
pub mod provider;
pub mod remote;
pub mod repo;

pub use gateway::{FetchOptions, FetchedFile, Gateway, GatewayError, GatewayOptions};
