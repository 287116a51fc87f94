use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use soundcat_storage::{CatalogStore, MemoryCatalogStore, PgCatalogStore};
use soundcat_sync::{RunOptions, SyncConfig, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "soundcat")]
#[command(about = "Audio-gear catalog aggregation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Acquire listings from the enabled sources and merge them into the catalog.
    Sync(SyncArgs),
    /// Report stored products whose names contradict their category.
    Audit {
        #[arg(long)]
        emit_tasks: bool,
    },
    /// Run resumable syncs on the refresh cron until interrupted.
    Schedule,
    Migrate,
    /// Serve the review API.
    Serve {
        #[arg(long, env = "SOUNDCAT_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
}

#[derive(Debug, Args, Default)]
struct SyncArgs {
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    delay_ms: Option<u64>,
    #[arg(long)]
    deadline_secs: Option<u64>,
    #[arg(long)]
    resume: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    source: Option<String>,
}

impl SyncArgs {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(ms) = self.delay_ms {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.deadline_secs {
            config.deadline = Duration::from_secs(secs);
        }
        config.dry_run |= self.dry_run;
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            resume: self.resume,
            limit: self.limit,
            only_source: self.source.clone(),
        }
    }
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn CatalogStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgCatalogStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using an in-memory catalog that is discarded on exit");
            Ok(Arc::new(MemoryCatalogStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            args.apply(&mut config);
            config.validate()?;
            let store = open_store(&config).await?;
            let report = SyncPipeline::new(config, store)?
                .run_once(&args.options())
                .await?;
            let s = &report.summary;
            println!(
                "sync complete: run_id={} completed={}/{} auto={} pending={} new={} skipped={} antibot={} finished={} reports={}",
                s.run_id,
                s.items_completed,
                s.items_total,
                s.auto,
                s.pending,
                s.new_products,
                s.skipped,
                s.antibot_events,
                report.finished,
                report.reports_dir.display()
            );
        }
        Commands::Audit { emit_tasks } => {
            let store = open_store(&config).await?;
            let findings = SyncPipeline::new(config, store)?.audit(emit_tasks).await?;
            println!("{}", serde_json::to_string_pretty(&findings)?);
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let cron = config.refresh_cron.clone();
            let store = open_store(&config).await?;
            let pipeline = Arc::new(SyncPipeline::new(config, store)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            let store = PgCatalogStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { port } => {
            let root = config.workspace_root.clone();
            let store = open_store(&config).await?;
            soundcat_web::serve(soundcat_web::AppState::new(store, root), port).await?;
        }
    }

    Ok(())
}
