//! Azure DevOps Git REST API.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, ACCEPT};
use url::Url;

use crate::remote::{HttpRequest, HttpResponse, RemoteError};
use crate::repo::{BranchInfo, Provider, RepositoryIdentity, TreeEntry};

use super::api_types::{AdoItem, AdoList, AdoRef, AdoRepository};
use super::{parse_json, with_bearer, Endpoint, ProviderApi};

const API_BASE: &str = "https://dev.azure.com";
const PROBE_URL: &str = "https://dev.azure.com/_apis/connectionData";
const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

pub struct AzureDevOpsApi {
  base: Url,
  api_version: String,
}

impl AzureDevOpsApi {
  pub fn new(api_version: &str) -> Result<Self> {
    let base = Url::parse(API_BASE).map_err(|e| eyre!("Invalid Azure DevOps URL: {}", e))?;
    if api_version.trim().is_empty() {
      return Err(eyre!("Azure DevOps api-version must not be empty"));
    }
    Ok(Self {
      base,
      api_version: api_version.trim().to_string(),
    })
  }

  /// `/{org}/{project}/_apis/git/repositories/{repo}[/{tail}]`
  fn repo_url(&self, repo: &RepositoryIdentity, tail: Option<&str>) -> Result<Url, RemoteError> {
    let project = repo
      .project()
      .ok_or_else(|| RemoteError::InvalidRequest(format!("{} has no project", repo)))?;
    let mut url = self.base.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| RemoteError::InvalidRequest("Azure DevOps URL cannot be a base".into()))?;
      segments
        .pop_if_empty()
        .extend([repo.owner(), project, "_apis", "git", "repositories", repo.name()]);
      if let Some(tail) = tail {
        segments.push(tail);
      }
    }
    Ok(url)
  }
}

impl ProviderApi for AzureDevOpsApi {
  fn provider(&self) -> Provider {
    Provider::AzureDevOps
  }

  fn build_request(
    &self,
    repo: &RepositoryIdentity,
    endpoint: Endpoint<'_>,
    token: Option<&str>,
  ) -> Result<HttpRequest, RemoteError> {
    let mut accept = "application/json";

    let url = match endpoint {
      Endpoint::RepositoryInfo => {
        let mut url = self.repo_url(repo, None)?;
        url
          .query_pairs_mut()
          .append_pair("api-version", &self.api_version);
        url
      }
      Endpoint::ListBranches => {
        let mut url = self.repo_url(repo, Some("refs"))?;
        url
          .query_pairs_mut()
          .append_pair("filter", "heads/")
          .append_pair("api-version", &self.api_version);
        url
      }
      Endpoint::FetchFile { branch, path } => {
        accept = "application/octet-stream";
        let mut url = self.repo_url(repo, Some("items"))?;
        url
          .query_pairs_mut()
          .append_pair("path", &format!("/{}", path.trim_start_matches('/')))
          .append_pair("versionDescriptor.version", branch)
          .append_pair("versionDescriptor.versionType", "branch")
          .append_pair("$format", "octetStream")
          .append_pair("api-version", &self.api_version);
        url
      }
      Endpoint::FetchTree { branch } => {
        let mut url = self.repo_url(repo, Some("items"))?;
        url
          .query_pairs_mut()
          .append_pair("scopePath", "/")
          .append_pair("recursionLevel", "Full")
          .append_pair("versionDescriptor.version", branch)
          .append_pair("versionDescriptor.versionType", "branch")
          .append_pair("api-version", &self.api_version);
        url
      }
    };

    let request = HttpRequest::get(url).with_header(ACCEPT, HeaderValue::from_static(accept));
    with_bearer(request, token)
  }

  /// Follows the `x-ms-continuationtoken` response header.
  fn next_page(&self, request: &HttpRequest, response: &HttpResponse) -> Option<HttpRequest> {
    let token = response.header_str(CONTINUATION_HEADER)?.trim();
    if token.is_empty() {
      return None;
    }

    let mut url = request.url.clone();
    let pairs: Vec<(String, String)> = request
      .url
      .query_pairs()
      .filter(|(k, _)| k != "continuationToken")
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();
    url
      .query_pairs_mut()
      .clear()
      .extend_pairs(pairs)
      .append_pair("continuationToken", token);

    let mut request = request.clone();
    request.url = url;
    Some(request)
  }

  fn probe_request(&self) -> HttpRequest {
    match Url::parse(PROBE_URL) {
      Ok(url) => HttpRequest::get(url),
      Err(_) => HttpRequest::get(self.base.clone()),
    }
  }

  fn parse_default_branch(&self, body: &[u8]) -> Result<Option<String>, RemoteError> {
    let repo: AdoRepository = parse_json(body, "repository")?;
    Ok(repo.default_branch_name())
  }

  fn parse_branches(&self, body: &[u8], default_branch: Option<&str>) -> Result<Vec<BranchInfo>, RemoteError> {
    let refs: AdoList<AdoRef> = parse_json(body, "refs")?;
    Ok(
      refs
        .value
        .into_iter()
        .filter_map(|r| r.into_branch_info(default_branch))
        .collect(),
    )
  }

  fn parse_tree(&self, body: &[u8]) -> Result<Vec<TreeEntry>, RemoteError> {
    let items: AdoList<AdoItem> = parse_json(body, "items")?;
    Ok(items.value.into_iter().filter_map(|i| i.into_entry()).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::testing::response_with_headers;
  use crate::repo::TreeEntryKind;

  fn api() -> AzureDevOpsApi {
    AzureDevOpsApi::new("7.1").unwrap()
  }

  fn repo() -> RepositoryIdentity {
    RepositoryIdentity::parse("https://dev.azure.com/contoso/Handbook/_git/handbook").unwrap()
  }

  fn query(request: &HttpRequest, key: &str) -> Option<String> {
    request
      .url
      .query_pairs()
      .find(|(k, _)| k == key)
      .map(|(_, v)| v.into_owned())
  }

  #[test]
  fn test_every_request_carries_api_version() {
    let api = api();
    let endpoints = [
      Endpoint::RepositoryInfo,
      Endpoint::ListBranches,
      Endpoint::FetchFile {
        branch: "main",
        path: "a.md",
      },
      Endpoint::FetchTree { branch: "main" },
    ];
    for endpoint in endpoints {
      let request = api.build_request(&repo(), endpoint, None).unwrap();
      assert_eq!(query(&request, "api-version").as_deref(), Some("7.1"), "{endpoint:?}");
      assert!(request
        .url
        .path()
        .starts_with("/contoso/Handbook/_apis/git/repositories/handbook"));
    }
  }

  #[test]
  fn test_file_request() {
    let request = api()
      .build_request(
        &repo(),
        Endpoint::FetchFile {
          branch: "release/1.0",
          path: "docs/intro.md",
        },
        Some("tok"),
      )
      .unwrap();
    assert_eq!(request.url.path(), "/contoso/Handbook/_apis/git/repositories/handbook/items");
    assert_eq!(query(&request, "path").as_deref(), Some("/docs/intro.md"));
    assert_eq!(
      query(&request, "versionDescriptor.version").as_deref(),
      Some("release/1.0")
    );
    assert_eq!(query(&request, "$format").as_deref(), Some("octetStream"));
  }

  #[test]
  fn test_continuation_token_paging() {
    let api = api();
    let request = api.build_request(&repo(), Endpoint::ListBranches, None).unwrap();
    let response = response_with_headers(200, "{}", &[("x-ms-continuationtoken", "abc")]);

    let next = api.next_page(&request, &response).unwrap();
    assert_eq!(query(&next, "continuationToken").as_deref(), Some("abc"));
    assert_eq!(query(&next, "filter").as_deref(), Some("heads/"));

    let again = api
      .next_page(&next, &response_with_headers(200, "{}", &[("x-ms-continuationtoken", "def")]))
      .unwrap();
    assert_eq!(
      again
        .url
        .query_pairs()
        .filter(|(k, _)| k == "continuationToken")
        .count(),
      1
    );

    let done = response_with_headers(200, "{}", &[]);
    assert!(api.next_page(&next, &done).is_none());
  }

  #[test]
  fn test_parse_refs_and_default_branch() {
    let api = api();
    let default = api
      .parse_default_branch(br#"{"id": "1", "defaultBranch": "refs/heads/main"}"#)
      .unwrap();
    assert_eq!(default.as_deref(), Some("main"));

    let body = br#"{"count": 3, "value": [
      {"name": "refs/heads/main", "objectId": "aaa"},
      {"name": "refs/heads/feature/x", "objectId": "bbb"},
      {"name": "refs/tags/v1", "objectId": "ccc"}
    ]}"#;
    let branches = api.parse_branches(body, default.as_deref()).unwrap();
    assert_eq!(branches.len(), 2);
    assert!(branches[0].is_default);
    assert_eq!(branches[1].name, "feature/x");
  }

  #[test]
  fn test_parse_tree_strips_root() {
    let body = br#"{"count": 3, "value": [
      {"path": "/", "isFolder": true, "gitObjectType": "tree"},
      {"path": "/docs", "isFolder": true, "gitObjectType": "tree"},
      {"path": "/docs/a.md", "gitObjectType": "blob"}
    ]}"#;
    let tree = api().parse_tree(body).unwrap();
    assert_eq!(tree.len(), 2);
    assert_eq!(tree[0].path, "docs");
    assert_eq!(tree[0].kind, TreeEntryKind::Directory);
    assert_eq!(tree[1].path, "docs/a.md");
    assert_eq!(tree[1].kind, TreeEntryKind::File);
  }
}
