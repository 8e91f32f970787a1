//! Serde-deserializable types matching provider API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::Deserialize;

use crate::repo::{BranchInfo, TreeEntry, TreeEntryKind};

const HEADS_PREFIX: &str = "refs/heads/";

// ============================================================================
// GitHub
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GhRepository {
  pub default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GhCommitRef {
  pub sha: String,
}

#[derive(Debug, Deserialize)]
pub struct GhBranch {
  pub name: String,
  pub commit: Option<GhCommitRef>,
}

impl GhBranch {
  pub fn into_branch_info(self, default_branch: Option<&str>) -> BranchInfo {
    BranchInfo {
      is_default: default_branch == Some(self.name.as_str()),
      name: self.name,
      commit_sha: self.commit.map(|c| c.sha),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct GhTreeItem {
  pub path: String,
  #[serde(rename = "type")]
  pub item_type: String,
  pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct GhTree {
  #[serde(default)]
  pub tree: Vec<GhTreeItem>,
  #[serde(default)]
  pub truncated: bool,
}

impl GhTreeItem {
  /// Submodules ("commit") have no content to fetch and are skipped.
  pub fn into_entry(self) -> Option<TreeEntry> {
    let kind = match self.item_type.as_str() {
      "blob" => TreeEntryKind::File,
      "tree" => TreeEntryKind::Directory,
      _ => return None,
    };
    Some(TreeEntry {
      path: self.path,
      kind,
      size: self.size,
    })
  }
}

// ============================================================================
// Azure DevOps
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AdoRepository {
  #[serde(rename = "defaultBranch")]
  pub default_branch: Option<String>,
}

impl AdoRepository {
  pub fn default_branch_name(&self) -> Option<String> {
    self
      .default_branch
      .as_deref()
      .map(|b| b.strip_prefix(HEADS_PREFIX).unwrap_or(b).to_string())
  }
}

/// Azure DevOps wraps collections as `{ "count": n, "value": [...] }`.
#[derive(Debug, Deserialize)]
pub struct AdoList<T> {
  #[serde(default = "Vec::new")]
  pub value: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct AdoRef {
  pub name: String,
  #[serde(rename = "objectId")]
  pub object_id: Option<String>,
}

impl AdoRef {
  pub fn into_branch_info(self, default_branch: Option<&str>) -> Option<BranchInfo> {
    let name = self.name.strip_prefix(HEADS_PREFIX)?.to_string();
    Some(BranchInfo {
      is_default: default_branch == Some(name.as_str()),
      name,
      commit_sha: self.object_id,
    })
  }
}

#[derive(Debug, Deserialize)]
pub struct AdoItem {
  pub path: String,
  #[serde(rename = "isFolder", default)]
  pub is_folder: bool,
  #[serde(rename = "gitObjectType")]
  pub git_object_type: Option<String>,
  pub size: Option<u64>,
}

impl AdoItem {
  /// Paths come back rooted ("/docs/a.md"); the root folder itself is skipped.
  pub fn into_entry(self) -> Option<TreeEntry> {
    let path = self.path.trim_start_matches('/').to_string();
    if path.is_empty() || self.git_object_type.as_deref() == Some("commit") {
      return None;
    }
    Some(TreeEntry {
      path,
      kind: if self.is_folder {
        TreeEntryKind::Directory
      } else {
        TreeEntryKind::File
      },
      size: self.size,
    })
  }
}
