use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::{Provider, RepositoryIdentity};

/// A branch of a remote repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
  pub name: String,
  pub commit_sha: Option<String>,
  #[serde(default)]
  pub is_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeEntryKind {
  File,
  Directory,
}

/// One node of a repository file tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
  pub path: String,
  pub kind: TreeEntryKind,
  pub size: Option<u64>,
}

/// Whether cached content is text or binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
  Text,
  Binary,
}

impl ContentKind {
  const SNIFF_LEN: usize = 8 * 1024;

  /// Binary if the leading bytes contain NUL or the content is not UTF-8.
  pub fn detect(content: &[u8]) -> Self {
    let head = &content[..content.len().min(Self::SNIFF_LEN)];
    if head.contains(&0) || std::str::from_utf8(content).is_err() {
      ContentKind::Binary
    } else {
      ContentKind::Text
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ContentKind::Text => "text",
      ContentKind::Binary => "binary",
    }
  }

  pub fn from_db(s: &str) -> Self {
    match s {
      "text" => ContentKind::Text,
      _ => ContentKind::Binary,
    }
  }
}

/// Result of connecting to a repository
#[derive(Debug, Clone)]
pub struct ConnectInfo {
  pub identity: RepositoryIdentity,
  pub default_branch: String,
  pub branches: Vec<BranchInfo>,
}

/// A previously connected repository
#[derive(Debug, Clone)]
pub struct RecentRepository {
  pub identity: RepositoryIdentity,
  pub provider: Provider,
  pub default_branch: Option<String>,
  pub last_connected_at: DateTime<Utc>,
}
