//! pageshard binary

use clap::{Parser, Subcommand};
use pageshard::admin::AdminServer;
use pageshard::ops::seed_legacy;
use pageshard::{Config, Engine, Partition};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pageshard")]
#[command(about = "Migrate page aggregates from a legacy store into hash-routed shards")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $PAGESHARD_CONFIG or ./pageshard.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Number of shards besides legacy
    #[arg(long, global = true)]
    shards: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration to completion
    Migrate {
        /// Pages per batch
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show the last persisted progress snapshot
    Status,

    /// Show per-status and per-shard counts
    Stats,

    /// Check every page sits in the partition the router assigns
    Verify,

    /// Create demo pages in the legacy store
    Seed {
        #[arg(long, default_value = "100")]
        pages: usize,

        #[arg(long, default_value = "5")]
        blocks: usize,

        #[arg(long, default_value = "2")]
        permissions: usize,
    },

    /// Start the admin HTTP API
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Start a run as soon as the server is up
        #[arg(long)]
        auto_start: bool,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    // CLI has priority over file and environment
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(shards) = cli.shards {
        config.storage.shard_count = shards;
    }
    match &cli.command {
        Commands::Migrate {
            batch_size: Some(size),
        } => config.migration.batch_size = *size,
        Commands::Serve { bind, auto_start } => {
            if let Some(bind) = bind {
                config.admin.bind_addr = *bind;
            }
            config.migration.auto_start |= *auto_start;
        }
        _ => {}
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("{}", pageshard::BUILD_INFO);
    // observers must not take the stores' LOCK files from a running migration
    let engine = match cli.command {
        Commands::Status | Commands::Stats | Commands::Verify => Engine::open_read_only(config)?,
        _ => Engine::open(config)?,
    };

    match cli.command {
        Commands::Migrate { .. } => {
            let report = engine.migrate().await?;
            println!("Migration report:");
            println!("  Recovered: {}", report.recovered);
            println!("  Batches: {}", report.batches);
            println!("  Processed: {}", report.processed);
            println!("  Migrated: {}", report.migrated);
            println!("  Stayed in legacy: {}", report.stayed_in_legacy);
            println!("  Skipped: {}", report.skipped);
            println!("  Lock busy: {}", report.lock_busy);
            println!("  Failed: {}", report.failed);
            if let Some(err) = &report.last_error {
                println!("  Last error: {}", err);
            }
        }
        Commands::Status => {
            let snapshot = engine.status();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Stats => {
            let stats = engine.statistics()?;
            println!("Legacy:");
            println!("  READY: {}", stats.legacy.ready);
            println!("  MIGRATING: {}", stats.legacy.migrating);
            println!("  MIGRATED: {}", stats.legacy.migrated);
            println!("  FAILED: {}", stats.legacy.failed);
            for shard in &stats.shards {
                println!("{}: {} pages", shard.partition, shard.pages);
            }
            println!("Migrated total: {}", stats.migrated_total);
            println!("Pending total: {}", stats.pending_total);
        }
        Commands::Verify => {
            let report = engine.verify()?;
            println!("Verification report ({}):", report.hash_contract);
            println!("  Legacy pages: {}", report.legacy_pages);
            println!("  Shard pages: {}", report.shard_pages);
            println!("  Pending: {}", report.pending);
            println!("  Misplaced: {}", report.misplaced.len());
            for m in &report.misplaced {
                println!("    {} in {}, expected {}", m.page_id, m.found_in, m.expected);
            }
            println!("  Duplicates: {}", report.duplicates.len());
            println!("  Stuck MIGRATING: {}", report.stuck_migrating.len());
            if !report.is_clean() {
                anyhow::bail!("placement verification found problems");
            }
        }
        Commands::Seed {
            pages,
            blocks,
            permissions,
        } => {
            let legacy = engine.stores().store(Partition::Legacy)?;
            let ids = seed_legacy(legacy, pages, blocks, permissions)?;
            println!("Seeded {} pages", ids.len());
        }
        Commands::Serve { .. } => {
            let config = engine.config().clone();
            let server = AdminServer::new(
                config.admin,
                engine.admin_state(),
                config.migration.auto_start,
            );
            server.serve().await?;
        }
    }

    Ok(())
}
