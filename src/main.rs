use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use logagg::agent::Agent;
use logagg::config::Config;
use logagg::ingest::event::Dimension;
use logagg::migrate::{ClickHouseMigrator, Migrator};
use logagg::store::clickhouse::{ClickHouseStore, TopQuery};

/// Streaming aggregation of web-server access logs.
#[derive(Parser)]
#[command(name = "logagg", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity (trace, debug, info, warn, error). Overrides the
    /// config file's log_level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Manage the ClickHouse schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Print the values with the highest stored counts for one dimension.
    Top {
        /// Dimension to rank (ip, endpoint, method, status).
        #[arg(long, default_value = "ip")]
        dimension: String,

        /// Only count rows from this server.
        #[arg(long)]
        server_id: Option<String>,

        /// Only count windows newer than this, e.g. "1h" or "30m".
        #[arg(long, value_parser = humantime::parse_duration)]
        since: Option<std::time::Duration>,

        /// Number of values to print.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply pending migrations.
    Up,
    /// Roll back the latest migration.
    Down,
    /// Print the current schema version.
    Status,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash, if GIT_COMMIT was set at build time.
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("logagg {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)?;

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    // Logs go to stderr so the stdout store's NDJSON stays clean.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let command = cli.command;

    rt.block_on(async move {
        match command {
            None => run(cfg).await,
            Some(Command::Migrate { action }) => migrate(cfg, action).await,
            Some(Command::Top {
                dimension,
                server_id,
                since,
                limit,
            }) => top(cfg, &dimension, server_id, since, limit).await,
            Some(Command::Version) => Ok(()),
        }
    })
}

async fn run(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting logagg",
    );

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let stats = agent.wait(shutdown_signal()).await?;

    tracing::info!(lines = stats.lines, "logagg stopped");

    Ok(())
}

async fn clickhouse(cfg: &Config) -> Result<ClickHouseStore> {
    if !cfg.store.clickhouse.enabled {
        bail!("store.clickhouse must be enabled for this command");
    }
    ClickHouseStore::connect(&cfg.store.clickhouse).await
}

async fn migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let store = clickhouse(&cfg).await?;
    let migrator = ClickHouseMigrator::new(store.pool().clone());

    match action {
        MigrateAction::Up => migrator.up().await,
        MigrateAction::Down => migrator.down().await,
        MigrateAction::Status => {
            let (version, dirty) = migrator.status().await?;
            println!("version: {version}, dirty: {dirty}");
            Ok(())
        }
    }
}

async fn top(
    cfg: Config,
    dimension: &str,
    server_id: Option<String>,
    since: Option<std::time::Duration>,
    limit: usize,
) -> Result<()> {
    let dimension = Dimension::from_name(dimension)
        .with_context(|| format!("unknown dimension: {dimension}"))?;

    let since = since
        .map(|d| chrono::Duration::from_std(d).map(|d| Utc::now() - d))
        .transpose()
        .context("--since out of range")?;

    let store = clickhouse(&cfg).await?;
    let totals = store
        .top_values(&TopQuery {
            dimension,
            server_id,
            since,
            limit,
        })
        .await?;

    for total in totals {
        println!("{}\t{}", total.count, total.value);
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "listening for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "registering SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
