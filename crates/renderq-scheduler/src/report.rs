//! Host report intake
//!
//! Reports are sharded by host name over a fixed set of workers, so reports
//! from one host are handled in order while different hosts proceed in
//! parallel.

use renderq_core::{HostReport, RenderqError, RenderqResult, ReportConfig};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;

/// Sending side of the report workers
#[derive(Clone)]
pub struct ReportQueue {
    shards: Vec<mpsc::Sender<HostReport>>,
}

impl ReportQueue {
    /// Queue a report, waiting while its worker's queue is full
    pub async fn submit(&self, report: HostReport) -> RenderqResult<()> {
        let shard = shard_for(&report.name, self.shards.len());
        self.shards[shard].send(report).await.map_err(|e| {
            RenderqError::Internal(format!("report worker {} stopped, dropped report from {}", shard, e.0.name))
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

fn shard_for(host: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

pub struct ReportHandler;

impl ReportHandler {
    /// Start the workers. They stop once every clone of the returned queue
    /// has been dropped and their queues are drained.
    pub fn spawn(
        dispatcher: Arc<Dispatcher>,
        config: &ReportConfig,
    ) -> (ReportQueue, Vec<JoinHandle<()>>) {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);

        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            shards.push(tx);
            handles.push(tokio::spawn(run_worker(worker, dispatcher.clone(), rx)));
        }

        info!(workers = workers, queue_capacity = capacity, "Report workers started");
        (ReportQueue { shards }, handles)
    }
}

async fn run_worker(worker: usize, dispatcher: Arc<Dispatcher>, mut rx: mpsc::Receiver<HostReport>) {
    while let Some(report) = rx.recv().await {
        let host = report.name.clone();
        match dispatcher.handle_report(report).await {
            Ok(procs) => debug!(worker = worker, host = %host, procs = procs.len(), "Report handled"),
            Err(e) => warn!(worker = worker, host = %host, error = %e, "Failed to handle report"),
        }
    }
    debug!(worker = worker, "Report worker stopped");
}
