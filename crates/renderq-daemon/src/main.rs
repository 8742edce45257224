//! renderq daemon
//!
//! Loads a farm snapshot into memory, feeds host reports to the dispatcher on
//! a fixed interval and watches local host assignments for deficits.

use anyhow::Context;
use clap::Parser;
use renderq_core::{DaemonConfig, FarmConfig, Host, HostReport, LockState, LoggingConfig};
use renderq_scheduler::{DeficitMonitor, Dispatcher, ReportHandler, ReportQueue};
use renderq_store::{
    load_farm, AllocationRepository, DispatchStore, FacilityRepository, HostRepository,
    MemoryStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// renderq daemon - dispatch and booking engine for a render farm
#[derive(Parser, Debug)]
#[command(name = "renderqd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Daemon configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Farm snapshot to load at startup (TOML)
    #[arg(long)]
    farm: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging)?;

    info!("Starting renderq daemon v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn DispatchStore> = Arc::new(MemoryStore::new());
    if let Some(path) = &args.farm {
        let farm = FarmConfig::from_file(path)
            .with_context(|| format!("loading farm {}", path.display()))?;
        load_farm(store.as_ref(), &farm).await?;
    }

    let dispatcher = Arc::new(Dispatcher::new(store.clone(), config.dispatcher.clone()));
    let (queue, workers) = ReportHandler::spawn(dispatcher.clone(), &config.reports);

    let mut events = dispatcher.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!(
                frame_id = %event.frame_id,
                host_id = %event.host_id,
                transition = ?event.transition,
                "Frame event"
            );
        }
    });

    let reports = tokio::spawn(replay_reports(
        dispatcher.clone(),
        queue,
        Duration::from_secs(config.reports.report_interval_secs.max(1)),
    ));
    let deficits = tokio::spawn(poll_deficits(
        store.clone(),
        Duration::from_secs(config.reports.deficit_poll_secs.max(1)),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down");

    reports.abort();
    deficits.abort();
    event_log.abort();
    // Workers exit once the queue held by the report task is dropped
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Report worker ended abnormally");
        }
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&logging.level)
        .with_context(|| format!("invalid log level {}", logging.level))?;
    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating log file {}", path.display()))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false);
    if logging.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

/// Re-submit every enabled host's last report on each tick; disabled hosts
/// are dropped from the ledger until they come back
async fn replay_reports(dispatcher: Arc<Dispatcher>, queue: ReportQueue, every: Duration) {
    let store = dispatcher.store();
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        for host in store.hosts().await {
            if !host.enabled {
                dispatcher.remove_host(host.id).await;
                continue;
            }
            let report = match heartbeat(store.as_ref(), &host).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(host = %host.name, error = %e, "Skipping host report");
                    continue;
                }
            };
            if let Err(e) = queue.submit(report).await {
                warn!(error = %e, "Report queue closed");
                return;
            }
        }
    }
}

async fn heartbeat(store: &dyn DispatchStore, host: &Host) -> anyhow::Result<HostReport> {
    let alloc = store.get_allocation(host.allocation_id).await?;
    let facility = store.get_facility_by_id(alloc.facility_id).await?;
    Ok(HostReport {
        name: host.name.clone(),
        facility: facility.name,
        allocation: Some(alloc.name),
        tags: host.tags.iter().cloned().collect(),
        state: host.state,
        nimby_enabled: host.nimby_enabled,
        nimby_locked: host.lock_state == LockState::NimbyLocked,
        total_cores: host.total.cores,
        total_memory: host.total.memory,
        total_gpus: host.total.gpus,
        total_gpu_memory: host.total.gpu_memory,
        total_swap: host.total_swap,
        free_swap: host.free_swap,
        boot_time: host.boot_time,
    })
}

/// Log assignments whose live procs exceed their maximums; correcting them is
/// left to an operator or an external reconciler
async fn poll_deficits(store: Arc<dyn DispatchStore>, every: Duration) {
    let monitor = DeficitMonitor::new(store.clone());
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        for host in store.hosts().await {
            for deficit in monitor.find_deficits(host.id).await {
                warn!(
                    host = %host.name,
                    assignment_id = %deficit.assignment_id,
                    target = %deficit.target,
                    committed = %deficit.committed,
                    max = %deficit.max,
                    over = %deficit.over,
                    "Resource deficit"
                );
            }
        }
    }
}
