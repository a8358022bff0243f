use anyhow::{Context, Result};
use clap::Parser;
use daemon::{
    config::RemuxConfig,
    ledger::JsonLedger,
    pipeline::{Components, Orchestrator},
    relocate, scan,
};
use log::{debug, error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

/// Remux daemon: turns finished raw recordings into tagged Matroska files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Make every decision but touch neither files, ledger nor media server
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env_file = dotenvy::dotenv().ok();

    let mut logger = env_logger::Builder::from_default_env();
    if args.debug {
        logger.filter_level(LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(LevelFilter::Info);
    }
    logger.format_timestamp_secs().init();

    if let Some(path) = env_file {
        debug!("Loaded environment from {}", path.display());
    }

    let cfg = RemuxConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?
        .apply_env()
        .context("Invalid environment configuration")?;
    cfg.validate().context("Invalid configuration")?;
    let cfg = Arc::new(cfg);

    let prefix = if args.dry_run { "[DRY RUN] " } else { "" };
    info!("{}Remux daemon starting", prefix);
    info!("Configuration loaded:");
    info!("  Watch folder: {}", cfg.watch_folder.display());
    info!("  Destination folder: {}", cfg.destination_folder.display());
    info!("  Ledger: {}", cfg.ledger_path.display());
    info!("  Registry: {}", cfg.registry_path.display());
    info!("  Scan interval: {}s", cfg.scan_interval_secs);
    info!("  Threshold: {}%", cfg.threshold_percent);
    info!("  Include cancelled: {}", cfg.include_cancelled);
    info!("  Max jobs: {}", cfg.max_jobs);
    if cfg.plex.is_enabled() {
        info!("  Media server: {} (library '{}')", cfg.plex.url, cfg.plex.library);
    } else {
        info!("  Media server: disabled");
    }

    if !args.dry_run {
        if let Some(parent) = cfg.ledger_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory: {}", parent.display()))?;
        }
    }

    // A ledger we cannot read could mean processing everything twice
    let ledger = JsonLedger::open(&cfg.ledger_path)
        .await
        .with_context(|| format!("Refusing to start: cannot load ledger {}", cfg.ledger_path.display()))?;

    if args.dry_run {
        info!("[DRY RUN] Skipping staging recovery");
    } else {
        let cleaned = relocate::recover_staging(&cfg.staging_dir())
            .await
            .context("Failed to clean up staging directory on startup")?;
        if cleaned > 0 {
            info!("✅ Startup recovery complete: {} partial output(s) cleaned", cleaned);
        } else {
            info!("✅ Startup recovery complete: no orphaned files found");
        }
    }

    let components = Components::from_config(&cfg, Arc::new(ledger), args.dry_run)?;
    let orchestrator = Arc::new(Orchestrator::new(cfg.clone(), components, args.dry_run));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(cfg.scan_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, no further scans");
                break;
            }
            _ = ticker.tick() => {}
        }

        match orchestrator.reconcile_notifications().await {
            Ok(0) => {}
            Ok(n) => info!("Media server confirmed {} earlier recording(s)", n),
            Err(e) => warn!("Notification reconciliation failed: {:#}", e),
        }

        let captures = match scan::scan_watch_folder(&cfg.watch_folder).await {
            Ok(captures) => captures,
            Err(e) => {
                error!("Watch folder scan failed: {:#}", e);
                continue;
            }
        };

        let report = orchestrator.run_tick(&captures).await;
        info!(
            "{}Scan summary: {} capture(s), {} dispatched, {} settled without transcoding",
            prefix,
            captures.len(),
            report.dispatched,
            report.settled.len()
        );
        for (path, disposition) in &report.settled {
            debug!("  {}: {}", path.display(), disposition);
        }
    }

    orchestrator.shutdown().await;
    info!("Remux daemon stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
