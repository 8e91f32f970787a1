//! Provider API abstraction layer.
//!
//! Provides the [`ProviderApi`] trait that encapsulates everything
//! provider-specific: URL construction, headers, pagination and response
//! parsing. The gateway dispatches through this trait so no provider detail
//! leaks outside this module. Sending is left to the remote client.

mod api_types;
mod azure;
mod github;

use color_eyre::Result;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;

use crate::remote::{HttpRequest, HttpResponse, RemoteError};
use crate::repo::{BranchInfo, Provider, RepositoryIdentity, TreeEntry};

pub use azure::AzureDevOpsApi;
pub use github::GitHubApi;

/// A provider operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint<'a> {
  RepositoryInfo,
  ListBranches,
  FetchFile { branch: &'a str, path: &'a str },
  FetchTree { branch: &'a str },
}

pub trait ProviderApi: Send + Sync {
  fn provider(&self) -> Provider;

  /// Request for `endpoint` (first page for listings).
  fn build_request(
    &self,
    repo: &RepositoryIdentity,
    endpoint: Endpoint<'_>,
    token: Option<&str>,
  ) -> Result<HttpRequest, RemoteError>;

  /// Request for the page after `response`, if there is one.
  fn next_page(&self, request: &HttpRequest, response: &HttpResponse) -> Option<HttpRequest>;

  /// Unauthenticated reachability check against the public endpoint.
  fn probe_request(&self) -> HttpRequest;

  fn parse_default_branch(&self, body: &[u8]) -> Result<Option<String>, RemoteError>;

  fn parse_branches(&self, body: &[u8], default_branch: Option<&str>) -> Result<Vec<BranchInfo>, RemoteError>;

  fn parse_tree(&self, body: &[u8]) -> Result<Vec<TreeEntry>, RemoteError>;
}

/// The provider implementations, one per [`Provider`].
pub struct Providers {
  github: GitHubApi,
  azure: AzureDevOpsApi,
}

impl Providers {
  pub fn new(github_api_url: &str, azure_api_version: &str) -> Result<Self> {
    Ok(Self {
      github: GitHubApi::new(github_api_url)?,
      azure: AzureDevOpsApi::new(azure_api_version)?,
    })
  }

  pub fn get(&self, provider: Provider) -> &dyn ProviderApi {
    match provider {
      Provider::GitHub => &self.github,
      Provider::AzureDevOps => &self.azure,
    }
  }

  pub fn for_repo(&self, repo: &RepositoryIdentity) -> &dyn ProviderApi {
    self.get(repo.provider())
  }
}

fn parse_json<T: DeserializeOwned>(body: &[u8], what: &str) -> Result<T, RemoteError> {
  serde_json::from_slice(body)
    .map_err(|e| RemoteError::InvalidResponse(format!("Failed to parse {}: {}", what, e)))
}

fn with_bearer(request: HttpRequest, token: Option<&str>) -> Result<HttpRequest, RemoteError> {
  let Some(token) = token else {
    return Ok(request);
  };
  let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
    .map_err(|_| RemoteError::InvalidRequest("token is not a valid header value".into()))?;
  value.set_sensitive(true);
  Ok(request.with_header(AUTHORIZATION, value))
}

fn path_segments(path: &str) -> impl Iterator<Item = &str> {
  path.split('/').filter(|s| !s.is_empty())
}
