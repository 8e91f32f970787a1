//! GitHub REST API.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT};
use url::Url;

use crate::remote::{HttpRequest, HttpResponse, RemoteError};
use crate::repo::{BranchInfo, Provider, RepositoryIdentity, TreeEntry};

use super::api_types::{GhBranch, GhRepository, GhTree};
use super::{parse_json, path_segments, with_bearer, Endpoint, ProviderApi};

const JSON_ACCEPT: &str = "application/vnd.github+json";
const RAW_ACCEPT: &str = "application/vnd.github.raw";
const API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: &str = "100";

pub struct GitHubApi {
  api_url: Url,
}

impl GitHubApi {
  pub fn new(api_url: &str) -> Result<Self> {
    let api_url = Url::parse(api_url.trim_end_matches('/'))
      .map_err(|e| eyre!("Invalid GitHub API URL '{}': {}", api_url, e))?;
    if api_url.cannot_be_a_base() {
      return Err(eyre!("Invalid GitHub API URL '{}'", api_url));
    }
    Ok(Self { api_url })
  }

  fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, RemoteError> {
    let mut url = self.api_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| RemoteError::InvalidRequest("GitHub API URL cannot be a base".into()))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }
}

impl ProviderApi for GitHubApi {
  fn provider(&self) -> Provider {
    Provider::GitHub
  }

  fn build_request(
    &self,
    repo: &RepositoryIdentity,
    endpoint: Endpoint<'_>,
    token: Option<&str>,
  ) -> Result<HttpRequest, RemoteError> {
    let base = ["repos", repo.owner(), repo.name()];
    let mut accept = JSON_ACCEPT;

    let url = match endpoint {
      Endpoint::RepositoryInfo => self.url(base)?,
      Endpoint::ListBranches => {
        let mut url = self.url(base.into_iter().chain(["branches"]))?;
        url.query_pairs_mut().append_pair("per_page", PAGE_SIZE);
        url
      }
      Endpoint::FetchFile { branch, path } => {
        accept = RAW_ACCEPT;
        let mut url = self.url(base.into_iter().chain(["contents"]).chain(path_segments(path)))?;
        url.query_pairs_mut().append_pair("ref", branch);
        url
      }
      Endpoint::FetchTree { branch } => {
        let mut url = self.url(base.into_iter().chain(["git", "trees", branch]))?;
        url.query_pairs_mut().append_pair("recursive", "1");
        url
      }
    };

    let request = HttpRequest::get(url)
      .with_header(ACCEPT, HeaderValue::from_static(accept))
      .with_header(
        HeaderName::from_static("x-github-api-version"),
        HeaderValue::from_static(API_VERSION),
      );
    with_bearer(request, token)
  }

  /// Follows the `Link: <...>; rel="next"` header.
  fn next_page(&self, request: &HttpRequest, response: &HttpResponse) -> Option<HttpRequest> {
    let link = response.header_str("link")?;
    let next = link.split(',').find_map(|part| {
      let (target, params) = part.split_once(';')?;
      params
        .split(';')
        .any(|p| p.trim() == "rel=\"next\"")
        .then(|| target.trim().trim_start_matches('<').trim_end_matches('>'))
    })?;
    let url = Url::parse(next).ok()?;
    // Never follow a link off the configured API host
    if url.host_str() != self.api_url.host_str() {
      return None;
    }
    let mut request = request.clone();
    request.url = url;
    Some(request)
  }

  fn probe_request(&self) -> HttpRequest {
    let mut url = self.api_url.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
      segments.pop_if_empty().push("zen");
    }
    HttpRequest::get(url)
  }

  fn parse_default_branch(&self, body: &[u8]) -> Result<Option<String>, RemoteError> {
    let repo: GhRepository = parse_json(body, "repository")?;
    Ok(repo.default_branch)
  }

  fn parse_branches(&self, body: &[u8], default_branch: Option<&str>) -> Result<Vec<BranchInfo>, RemoteError> {
    let branches: Vec<GhBranch> = parse_json(body, "branches")?;
    Ok(
      branches
        .into_iter()
        .map(|b| b.into_branch_info(default_branch))
        .collect(),
    )
  }

  fn parse_tree(&self, body: &[u8]) -> Result<Vec<TreeEntry>, RemoteError> {
    let tree: GhTree = parse_json(body, "tree")?;
    if tree.truncated {
      tracing::warn!(entries = tree.tree.len(), "GitHub returned a truncated tree");
    }
    Ok(tree.tree.into_iter().filter_map(|item| item.into_entry()).collect())
  }
}
