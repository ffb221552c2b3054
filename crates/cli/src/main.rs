//! `kardex-sync`: run warehouse syncs from the command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio::runtime::Runtime;
use tracing::info;

use kardex_events::SyncUpdate;
use kardex_infra::cancel::CancelToken;
use kardex_infra::erp::ErpRegistry;
use kardex_infra::jobs::{InMemoryJobStore, JobExecutor, JobExecutorConfig};
use kardex_infra::notify::in_memory_bus;
use kardex_infra::store::PostgresWarehouseStore;
use kardex_infra::sync::SyncRequest;
use kardex_infra::service::StartSync;
use kardex_infra::{AppConfig, ServiceError, WarehouseService};
use kardex_observability::LogFormat;

#[derive(Parser)]
#[command(name = "kardex-sync")]
#[command(about = "ERP warehouse sync and stock reconciliation")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); `KARDEX_*` variables override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log output: json or pretty
    #[arg(long, default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the local schema
    Migrate,

    /// Run one sync cycle for a company and print its report
    Sync {
        /// Company alias
        alias: String,

        /// Baseline year when the company has never been synced
        #[arg(long)]
        start_year: Option<i32>,

        /// Reconciliation window in days
        #[arg(long)]
        days: Option<u32>,

        /// Drop every synced row of the company first
        #[arg(long)]
        reset_all_data: bool,
    },

    /// Start the job runner and its stuck-job sweep until interrupted
    Run {
        /// Company to queue a sync for; repeatable
        #[arg(long = "company")]
        companies: Vec<String>,

        /// Queue the companies again every this many seconds
        #[arg(long)]
        every_secs: Option<u64>,
    },

    /// Rebuild every stock balance of a company
    Recompute {
        /// Company alias
        alias: String,
    },
}

struct App {
    runtime: Arc<Runtime>,
    store: Arc<PostgresWarehouseStore>,
    service: WarehouseService,
    jobs: Arc<InMemoryJobStore>,
    config: AppConfig,
}

fn build(config: AppConfig) -> Result<App> {
    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start the async runtime")?,
    );
    let url = config
        .database
        .url
        .as_ref()
        .context("database.url is not configured (KARDEX_DATABASE__URL)")?;
    let store = Arc::new(PostgresWarehouseStore::connect(
        runtime.clone(),
        url.expose_secret(),
        config.database.max_connections,
    )?);
    let erp = Arc::new(ErpRegistry::from_config(&config.erp, runtime.clone())?);
    let jobs = InMemoryJobStore::arc();
    let service = WarehouseService::new(
        store.clone(),
        erp,
        jobs.clone(),
        in_memory_bus(),
        Arc::new(config.rules.clone()),
        config.sync.clone(),
    );
    Ok(App {
        runtime,
        store,
        service,
        jobs,
        config,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    kardex_observability::init_with(cli.log_format);

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let app = build(config)?;

    match cli.command {
        Commands::Migrate => {
            app.store.migrate()?;
            info!("schema is up to date");
        }
        Commands::Sync {
            alias,
            start_year,
            days,
            reset_all_data,
        } => sync(&app, alias, start_year, days, reset_all_data)?,
        Commands::Run { companies, every_secs } => run(app, &companies, every_secs)?,
        Commands::Recompute { alias } => {
            let report = app.service.recompute_company(&alias)?;
            for ((warehouse, product), reason) in &report.skipped {
                tracing::warn!(%warehouse, %product, %reason, "balance skipped");
            }
            println!("{} balances recomputed, {} skipped", report.recomputed, report.skipped.len());
        }
    }
    Ok(())
}

fn sync(app: &App, alias: String, start_year: Option<i32>, days: Option<u32>, reset: bool) -> Result<()> {
    if reset {
        app.service.reset_company(&alias)?;
    }
    let mut request = SyncRequest::new(alias);
    request.start_year = start_year;
    request.reconciliation_days = days;

    let cancel = CancelToken::with_timeout(Duration::from_secs(app.config.jobs.job_timeout_secs));
    let progress = |update: &SyncUpdate| {
        info!(status = ?update.status, percent = update.progress_percent, "{}", update.message);
    };
    let report = app.service.sync_now(&request, &cancel, &progress)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn enqueue_all(service: &WarehouseService, companies: &[String]) {
    for alias in companies {
        match service.start_sync(StartSync::new(alias.as_str()).requested_by("kardex-sync")) {
            Ok(started) => info!(company = %alias, job_id = %started.job_id, "sync queued"),
            Err(ServiceError::Conflict(reason)) => info!(company = %alias, %reason, "sync already queued"),
            Err(err) => tracing::error!(company = %alias, error = %err, "failed to queue sync"),
        }
    }
}

fn run(app: App, companies: &[String], every_secs: Option<u64>) -> Result<()> {
    let mut executor = JobExecutor::new(app.jobs.clone());
    app.service.register_handlers(&mut executor);

    let config = JobExecutorConfig::from(&app.config.jobs).with_name("kardex-jobs");
    let handle = executor.spawn(config).context("failed to spawn job workers")?;
    info!(workers = app.config.jobs.workers, "job runner started");

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        let runtime = app.runtime.clone();
        thread::Builder::new()
            .name("kardex-signal".into())
            .spawn(move || {
                if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                    stop.store(true, Ordering::SeqCst);
                }
            })
            .context("failed to spawn signal listener")?;
    }

    let every = every_secs.map(Duration::from_secs);
    enqueue_all(&app.service, companies);
    let mut next = every.map(|every| Instant::now() + every);
    while !stop.load(Ordering::SeqCst) {
        if let (Some(at), Some(every)) = (next, every)
            && Instant::now() >= at
        {
            enqueue_all(&app.service, companies);
            next = Some(at + every);
        }
        thread::sleep(Duration::from_millis(200));
    }

    info!(stats = ?handle.stats(), "shutting down job runner");
    handle.shutdown();
    Ok(())
}
