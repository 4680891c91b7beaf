use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use splitter::config::{DropboxCredentials, SplitterConfig, StorageConfig};
use splitter::{recover_stale_jobs, store_from_config, FileJobStore, JobStore, Orchestrator};

mod routes;

use routes::{create_router, AppState};

/// Audio splitting and upload daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Secrets and the port may come from the environment; non-empty values win
fn apply_env_overrides(cfg: &mut SplitterConfig) {
    let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    if let Some(port) = var("PORT") {
        match port.parse() {
            Ok(port) => cfg.port = port,
            Err(_) => warn!("Ignoring invalid PORT value: {}", port),
        }
    }
    if let Some(key) = var("SPLITD_API_KEY") {
        cfg.api_key = Some(key);
    }

    let env_creds = DropboxCredentials {
        access_token: var("DROPBOX_ACCESS_TOKEN"),
        refresh_token: var("DROPBOX_REFRESH_TOKEN"),
        client_id: var("DROPBOX_CLIENT_ID"),
        client_secret: var("DROPBOX_CLIENT_SECRET"),
    };
    if let StorageConfig::Dropbox(creds) = &mut cfg.storage {
        creds.merge(env_creds);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_default_env();
    logger.format_timestamp_secs();
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let mut cfg = SplitterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    apply_env_overrides(&mut cfg);

    info!("splitd starting");
    info!("Configuration loaded:");
    info!("  Job state dir: {}", cfg.job_state_dir.display());
    info!("  Work dir: {}", cfg.work_dir.display());
    match &cfg.storage {
        StorageConfig::Dropbox(creds) => info!(
            "  Storage: dropbox ({})",
            if creds.has_refresh_grant() { "refresh token" } else { "access token" }
        ),
        StorageConfig::Local { root } => info!("  Storage: local directory {}", root.display()),
    }
    info!("  Defaults: {:?}", cfg.defaults);

    std::fs::create_dir_all(&cfg.job_state_dir)
        .with_context(|| format!("Failed to create job state directory: {}", cfg.job_state_dir.display()))?;
    std::fs::create_dir_all(&cfg.work_dir)
        .with_context(|| format!("Failed to create work directory: {}", cfg.work_dir.display()))?;

    let jobs: Arc<dyn JobStore> = Arc::new(FileJobStore::new(&cfg.job_state_dir));
    let store = store_from_config(&cfg.storage).context("Failed to initialise object store")?;

    // Anything still queued or running from a previous process has no worker
    let stale_timeout = Duration::from_secs(cfg.stale_job_timeout_secs);
    let recovered = recover_stale_jobs(jobs.as_ref(), stale_timeout)
        .await
        .context("Failed to recover stale jobs on startup")?;
    info!("Startup recovery complete: {} stale job(s) marked as error", recovered);

    let reaper_jobs = jobs.clone();
    let reaper_interval = Duration::from_secs(cfg.reaper_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reaper_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = recover_stale_jobs(reaper_jobs.as_ref(), stale_timeout).await {
                error!("Stale job sweep failed: {}", e);
            }
        }
    });

    let orchestrator = Orchestrator::with_native_engines(&cfg, jobs, store)
        .context("Failed to set up pipeline")?;
    let state = AppState {
        orchestrator,
        defaults: Arc::new(cfg.defaults.clone()),
        api_key: cfg.api_key.as_deref().map(Arc::from),
    };

    let addr = format!("{}:{}", cfg.bind_addr, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .await
        .context("HTTP server failed")?;
    Ok(())
}
