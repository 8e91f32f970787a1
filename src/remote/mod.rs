//! Rate-limited access to provider APIs.

mod client;
mod error;
mod rate_limit;
mod retry;
mod transport;

pub use client::{Call, RemoteClient, RemoteOptions};
pub use error::RemoteError;
pub use rate_limit::{credential_fingerprint, RateLimitScope, RateLimitState, RateLimitTracker};
pub use retry::{retry, RetryError, RetryPolicy};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};

#[cfg(test)]
pub(crate) use transport::testing;
