//! Normalized repository identity.
//!
//! Every URL form a user can paste for the same repository (SSH, HTTP,
//! trailing slash, `.git` suffix, upper-case host, legacy Azure hosts) maps
//! to one canonical HTTPS URL. The canonical URL is the cache partition key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// A remote Git hosting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
  GitHub,
  AzureDevOps,
}

impl Provider {
  pub const ALL: [Provider; 2] = [Provider::GitHub, Provider::AzureDevOps];

  pub fn as_str(&self) -> &'static str {
    match self {
      Provider::GitHub => "github",
      Provider::AzureDevOps => "azure_devops",
    }
  }
}

impl fmt::Display for Provider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Provider::GitHub => write!(f, "GitHub"),
      Provider::AzureDevOps => write!(f, "Azure DevOps"),
    }
  }
}

impl FromStr for Provider {
  type Err = IdentityError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "github" => Ok(Provider::GitHub),
      "azure_devops" => Ok(Provider::AzureDevOps),
      other => Err(IdentityError::UnsupportedHost(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
  #[error("repository URL is empty")]
  Empty,
  #[error("invalid repository URL '{0}'")]
  InvalidUrl(String),
  #[error("unsupported repository host '{0}'")]
  UnsupportedHost(String),
  #[error("repository URL '{0}' does not name a repository")]
  MissingSegments(String),
}

/// Canonical identity of a remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryIdentity {
  canonical: String,
  provider: Provider,
  /// GitHub owner or Azure DevOps organization
  owner: String,
  /// Azure DevOps project; `None` for GitHub
  project: Option<String>,
  name: String,
}

impl RepositoryIdentity {
  /// Parse and normalize a repository URL.
  pub fn parse(input: &str) -> Result<Self, IdentityError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
      return Err(IdentityError::Empty);
    }

    let url = to_url(trimmed)?;
    let host = url
      .host_str()
      .ok_or_else(|| IdentityError::InvalidUrl(trimmed.to_string()))?
      .to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();

    let segments: Vec<String> = url
      .path_segments()
      .map(|segs| {
        segs
          .filter(|s| !s.is_empty())
          .map(|s| s.to_string())
          .collect()
      })
      .unwrap_or_default();

    let missing = || IdentityError::MissingSegments(trimmed.to_string());

    match host.as_str() {
      "github.com" => {
        let [owner, name, ..] = segments.as_slice() else {
          return Err(missing());
        };
        Ok(Self::github(owner, strip_git_suffix(name)))
      }
      "dev.azure.com" => {
        // {org}/{project}/_git/{repo} or {org}/_git/{repo}
        match segments.as_slice() {
          [org, project, git, repo, ..] if git == "_git" => {
            Ok(Self::azure(org, project, strip_git_suffix(repo)))
          }
          [org, git, repo, ..] if git == "_git" => {
            Ok(Self::azure(org, strip_git_suffix(repo), strip_git_suffix(repo)))
          }
          _ => Err(missing()),
        }
      }
      "ssh.dev.azure.com" | "vs-ssh.visualstudio.com" => {
        // v3/{org}/{project}/{repo}
        match segments.as_slice() {
          [v3, org, project, repo, ..] if v3 == "v3" => {
            Ok(Self::azure(org, project, strip_git_suffix(repo)))
          }
          _ => Err(missing()),
        }
      }
      h if h.ends_with(".visualstudio.com") => {
        let org = h.trim_end_matches(".visualstudio.com");
        let segments: Vec<&String> = segments
          .iter()
          .filter(|s| !s.eq_ignore_ascii_case("DefaultCollection"))
          .collect();
        match segments.as_slice() {
          [project, git, repo, ..] if *git == "_git" => {
            Ok(Self::azure(org, project, strip_git_suffix(repo)))
          }
          [git, repo, ..] if *git == "_git" => {
            Ok(Self::azure(org, strip_git_suffix(repo), strip_git_suffix(repo)))
          }
          _ => Err(missing()),
        }
      }
      other => Err(IdentityError::UnsupportedHost(other.to_string())),
    }
  }

  fn github(owner: &str, name: &str) -> Self {
    Self {
      canonical: format!("https://github.com/{}/{}", owner, name),
      provider: Provider::GitHub,
      owner: owner.to_string(),
      project: None,
      name: name.to_string(),
    }
  }

  fn azure(org: &str, project: &str, name: &str) -> Self {
    Self {
      canonical: format!("https://dev.azure.com/{}/{}/_git/{}", org, project, name),
      provider: Provider::AzureDevOps,
      owner: org.to_string(),
      project: Some(project.to_string()),
      name: name.to_string(),
    }
  }

  pub fn as_str(&self) -> &str {
    &self.canonical
  }

  pub fn provider(&self) -> Provider {
    self.provider
  }

  pub fn owner(&self) -> &str {
    &self.owner
  }

  pub fn project(&self) -> Option<&str> {
    self.project.as_deref()
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Stable, fixed-length directory name for this repository's blobs.
  pub fn partition_id(&self) -> String {
    let digest = Sha256::digest(self.canonical.as_bytes());
    hex::encode(&digest[..8])
  }
}

impl fmt::Display for RepositoryIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

impl FromStr for RepositoryIdentity {
  type Err = IdentityError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

/// Turn user input into an https URL, accepting scp-like SSH and bare hosts.
fn to_url(input: &str) -> Result<Url, IdentityError> {
  let invalid = || IdentityError::InvalidUrl(input.to_string());

  let rewritten = if let Some(rest) = input.strip_prefix("git@") {
    // git@host:path
    let (host, path) = rest.split_once(':').ok_or_else(invalid)?;
    format!("https://{}/{}", host, path.trim_start_matches('/'))
  } else if input.contains("://") {
    input.to_string()
  } else {
    format!("https://{}", input)
  };

  let mut url = Url::parse(&rewritten).map_err(|_| invalid())?;
  match url.scheme() {
    "https" => {}
    "http" | "ssh" | "git" => {
      // Url::set_scheme refuses special <-> non-special changes, so rebuild.
      let rest = &rewritten[url.scheme().len()..];
      url = Url::parse(&format!("https{}", rest)).map_err(|_| invalid())?;
    }
    _ => return Err(invalid()),
  }
  Ok(url)
}

fn strip_git_suffix(name: &str) -> &str {
  name.strip_suffix(".git").unwrap_or(name)
}
