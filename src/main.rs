use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use rssvault::storage::FeedStats;
use rssvault::{Config, EngineRegistry, Outcome};

/// Default config file location (~/.config/rssvault/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("rssvault")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(name = "rssvault", version, about = "Failover RSS/Atom aggregation and storage")]
struct Args {
    /// Config file (default: ~/.config/rssvault/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// User whose feeds to operate on (overrides RSSVAULT_USER)
    #[arg(long, global = true, value_name = "ID")]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch new entries for one feed or every active feed
    Refresh {
        #[arg(long, value_name = "NAME")]
        feed: Option<String>,
    },
    /// Show entry and source statistics
    Stats {
        #[arg(long, value_name = "NAME")]
        feed: Option<String>,
    },
    /// Apply retention windows, and prune repeated captures with --keep
    Prune {
        /// Limit duplicate pruning to one feed
        #[arg(long, value_name = "NAME")]
        feed: Option<String>,
        /// Captures of each GUID to keep
        #[arg(long, value_name = "N")]
        keep: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?
        .with_env_overrides();
    if let Some(user) = &args.user {
        config.user = user.clone();
    }

    let data_dir = config.data_dir();
    ensure_data_dir(&data_dir)?;

    let registry = EngineRegistry::open(&config)
        .await
        .context("Failed to open data directory")?;
    let engine = registry
        .engine(&config.user)
        .await
        .with_context(|| format!("Failed to open store for user '{}'", config.user))?;

    match args.command {
        Command::Refresh { feed } => {
            let reports = engine.refresh_feed(feed.as_deref()).await?;
            let succeeded = reports.iter().filter(|r| r.success).count();
            let total = reports.len();
            for report in reports {
                print_outcome(&Outcome::from(report));
            }
            println!("{succeeded}/{total} feeds updated successfully");
        }
        Command::Stats { feed } => {
            let stats = engine.get_feed_stats(feed.as_deref()).await?;
            print_stats(&stats);
        }
        Command::Prune { feed, keep } => {
            let expired = engine.cleanup_old_entries().await;
            print_outcome(&Outcome::from_result(expired, |n| {
                format!("Removed {n} expired entries")
            }));
            if let Some(keep) = keep {
                let pruned = engine.cleanup_duplicates(feed.as_deref(), keep).await;
                print_outcome(&Outcome::from_result(pruned, |n| {
                    format!("Removed {n} duplicate captures")
                }));
            }
        }
    }

    Ok(())
}

/// Create the data directory, owner-only on Unix. Failure is fatal.
fn ensure_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!("Failed to create data directory {}", data_dir.display())
        })?;
        tracing::info!(path = %data_dir.display(), "Created data directory");
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %data_dir.display(),
                error = %e,
                "Failed to set data directory permissions to 0700"
            );
        }
    }
    Ok(())
}

fn print_outcome(outcome: &Outcome) {
    let status = if outcome.success { "ok" } else { "FAILED" };
    println!("[{status}] {}", outcome.message);
}

fn print_stats(stats: &FeedStats) {
    println!("Statistics for {}:", stats.feed_name);
    println!("  Feeds: {} ({} active)", stats.total_feeds, stats.active_feeds);
    println!("  Total entries: {}", stats.total_entries);
    println!("  Last 24h: {}", stats.entries_last_24h);
    println!("  Last 7 days: {}", stats.entries_last_7d);
    println!(
        "  Sources: {} active, {} healthy",
        stats.active_sources, stats.healthy_sources
    );
    if let Some(at) = stats.last_fetch {
        println!("  Last fetch: {}", at.to_rfc3339());
    }
    if let Some(at) = stats.last_success {
        println!("  Last success: {}", at.to_rfc3339());
    }
}
