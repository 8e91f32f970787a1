//! Operator CLI over a [`Gateway`].

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use tracing::debug;

use crate::config::Config;
use crate::gateway::{CredentialStore, FetchOptions, Gateway, MemoryCredentialStore};
use crate::repo::{RepositoryIdentity, TreeEntryKind};

/// Extra time allowed for the first probe round when reporting status.
const STATUS_GRACE: Duration = Duration::from_secs(1);

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Connect to a repository and list its branches
  Connect { url: String },
  /// List branches
  Branches { url: String },
  /// List the files of a branch
  Tree { url: String, branch: String },
  /// Fetch one file, from cache when possible
  Fetch {
    url: String,
    branch: String,
    path: String,
    /// Bypass the cache
    #[arg(short, long)]
    force: bool,
    /// Write to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
  },
  /// Drop cached content for a repository or one branch
  Invalidate {
    url: String,
    #[arg(short, long)]
    branch: Option<String>,
  },
  /// Forget a repository: cache, credential and history
  Disconnect { url: String },
  /// Show connectivity and cache usage
  Status,
  /// List recently connected repositories
  Recent {
    #[arg(short = 'n', long, default_value_t = 10)]
    limit: usize,
  },
  /// Reconcile the cache and enforce size limits
  Sweep,
}

pub struct App {
  gateway: Gateway,
  credentials: Arc<MemoryCredentialStore>,
  probe_timeout: Duration,
}

impl App {
  pub async fn new(config: &Config) -> Result<Self> {
    let options = config.gateway_options()?;
    let probe_timeout = options.monitor.probe_timeout;
    let credentials = Arc::new(MemoryCredentialStore::new());
    let gateway = Gateway::open(options, &config.remote.user_agent, credentials.clone())?;
    let report = gateway.initialize().await?;
    debug!(?report, "gateway initialized");

    Ok(Self {
      gateway,
      credentials,
      probe_timeout,
    })
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    let result = self.dispatch(command).await;
    self.gateway.shutdown();
    result
  }

  async fn dispatch(&self, command: Command) -> Result<()> {
    match command {
      Command::Connect { url } => {
        let provider = RepositoryIdentity::parse(&url)?.provider();
        let token = Config::api_token(provider);
        let info = self.gateway.connect(&url, token.as_deref()).await?;
        println!("{} ({})", info.identity, provider);
        println!("default branch: {}", info.default_branch);
        for branch in &info.branches {
          let marker = if branch.is_default { "*" } else { " " };
          println!("{} {}", marker, branch.name);
        }
      }
      Command::Branches { url } => {
        let identity = self.identity(&url)?;
        for branch in self.gateway.list_branches(&identity).await? {
          let sha = branch.commit_sha.as_deref().unwrap_or("-");
          let marker = if branch.is_default { "*" } else { " " };
          println!("{} {:<40} {}", marker, branch.name, short_sha(sha));
        }
      }
      Command::Tree { url, branch } => {
        let identity = self.identity(&url)?;
        for entry in self.gateway.list_files(&identity, &branch).await? {
          match entry.kind {
            TreeEntryKind::Directory => println!("{}/", entry.path),
            TreeEntryKind::File => println!(
              "{:<60} {}",
              entry.path,
              entry.size.map(format_bytes).unwrap_or_default()
            ),
          }
        }
      }
      Command::Fetch {
        url,
        branch,
        path,
        force,
        output,
      } => {
        let identity = self.identity(&url)?;
        let options = FetchOptions {
          force_refresh: force,
          cancel: None,
        };
        let file = self.gateway.fetch_file(&identity, &branch, &path, options).await?;
        match output {
          Some(target) => std::fs::write(&target, &file.content)
            .map_err(|e| eyre!("Failed to write {}: {}", target.display(), e))?,
          None => std::io::stdout()
            .write_all(&file.content)
            .map_err(|e| eyre!("Failed to write to stdout: {}", e))?,
        }
        let source = if file.served_from_cache { "cache" } else { "network" };
        eprintln!(
          "{} from {} ({}, {}, fetched {})",
          path,
          source,
          format_bytes(file.content.len() as u64),
          file.content_kind.as_str(),
          file.fetched_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
      }
      Command::Invalidate { url, branch } => {
        let identity = self.identity(&url)?;
        let removed = self.gateway.invalidate(&identity, branch.as_deref()).await?;
        println!("removed {} cached files", removed);
      }
      Command::Disconnect { url } => {
        let identity = RepositoryIdentity::parse(&url)?;
        self.gateway.disconnect(&identity).await?;
        println!("disconnected {}", identity);
      }
      Command::Status => self.status().await?,
      Command::Recent { limit } => {
        for recent in self.gateway.recent_repositories(limit).await? {
          println!(
            "{:<60} {:<10} {}",
            recent.identity,
            recent.default_branch.as_deref().unwrap_or("-"),
            recent.last_connected_at.format("%Y-%m-%d %H:%M")
          );
        }
      }
      Command::Sweep => {
        let report = self.gateway.sweep().await?;
        println!(
          "evicted {} entries, freed {}",
          report.evicted.len(),
          format_bytes(report.freed_bytes)
        );
      }
    }
    Ok(())
  }

  async fn status(&self) -> Result<()> {
    let mut updates = self.gateway.subscribe_connectivity();
    let probed = tokio::time::timeout(self.probe_timeout + STATUS_GRACE, async {
      updates
        .wait_for(|s| s.last_verified.is_some())
        .await
        .is_ok()
    })
    .await
    .unwrap_or(false);
    if !probed {
      debug!("no probe result yet, reporting assumed state");
    }

    let state = self.gateway.get_connectivity();
    println!("connectivity: {}", state.phase);
    for (provider, reachable) in &state.providers {
      let status = if *reachable { "reachable" } else { "unreachable" };
      println!("  {:<14} {}", provider.to_string(), status);
    }

    let stats = self.gateway.cache_stats().await?;
    println!(
      "cache: {} files, {}",
      stats.entries,
      format_bytes(stats.bytes)
    );
    for partition in &stats.partitions {
      println!(
        "  {:<60} {:>6} files {:>10}",
        partition.repository,
        partition.entries,
        format_bytes(partition.bytes)
      );
    }
    Ok(())
  }

  /// Parse `url` and make the environment's token available for it.
  fn identity(&self, url: &str) -> Result<RepositoryIdentity> {
    let identity = RepositoryIdentity::parse(url)?;
    if let Some(token) = Config::api_token(identity.provider()) {
      self.credentials.set(&identity, &token)?;
    }
    Ok(identity)
  }
}

fn short_sha(sha: &str) -> &str {
  sha.get(..7).unwrap_or(sha)
}

fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
  let mut value = bytes as f64;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  if unit == 0 {
    format!("{} {}", bytes, UNITS[0])
  } else {
    format!("{:.1} {}", value, UNITS[unit])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_format_bytes() {
    assert_eq!(format_bytes(0), "0 B");
    assert_eq!(format_bytes(1023), "1023 B");
    assert_eq!(format_bytes(1536), "1.5 KiB");
    assert_eq!(format_bytes(256 * 1024 * 1024), "256.0 MiB");
  }

  #[test]
  fn test_short_sha() {
    assert_eq!(short_sha("0123456789abcdef"), "0123456");
    assert_eq!(short_sha("abc"), "abc");
  }
}
