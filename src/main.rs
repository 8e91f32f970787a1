use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use reposync::app::{App, Command};
use reposync::config::Config;
use reposync::logging;

#[derive(Parser, Debug)]
#[command(name = "reposync")]
#[command(about = "Offline-first cache for GitHub and Azure DevOps repositories")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/reposync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging, args.verbose)?;

  let app = App::new(&config).await?;
  app.run(args.command).await?;

  Ok(())
}
