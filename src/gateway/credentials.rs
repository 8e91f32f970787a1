//! Credential storage capability.

use std::collections::HashMap;
use std::sync::Mutex;

use color_eyre::{eyre::eyre, Result};

use crate::repo::RepositoryIdentity;

/// Where API tokens live. Implementations are expected to be backed by an OS
/// secret store; the gateway never writes tokens anywhere else.
pub trait CredentialStore: Send + Sync {
  fn get(&self, repo: &RepositoryIdentity) -> Result<Option<String>>;
  fn set(&self, repo: &RepositoryIdentity, token: &str) -> Result<()>;
  fn delete(&self, repo: &RepositoryIdentity) -> Result<()>;
}

/// Process-lifetime credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
  tokens: Mutex<HashMap<RepositoryIdentity, String>>,
}

impl MemoryCredentialStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CredentialStore for MemoryCredentialStore {
  fn get(&self, repo: &RepositoryIdentity) -> Result<Option<String>> {
    let tokens = self
      .tokens
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(tokens.get(repo).cloned())
  }

  fn set(&self, repo: &RepositoryIdentity, token: &str) -> Result<()> {
    let mut tokens = self
      .tokens
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    tokens.insert(repo.clone(), token.to_string());
    Ok(())
  }

  fn delete(&self, repo: &RepositoryIdentity) -> Result<()> {
    let mut tokens = self
      .tokens
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    tokens.remove(repo);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_get_delete() {
    let store = MemoryCredentialStore::new();
    let repo = RepositoryIdentity::parse("git@github.com:octo/docs.git").unwrap();
    let same = RepositoryIdentity::parse("https://github.com/octo/docs").unwrap();

    assert_eq!(store.get(&repo).unwrap(), None);
    store.set(&repo, "ghp_abc").unwrap();
    assert_eq!(store.get(&same).unwrap().as_deref(), Some("ghp_abc"));

    store.delete(&same).unwrap();
    store.delete(&same).unwrap();
    assert_eq!(store.get(&repo).unwrap(), None);
  }
}
