//! Build worker: drains the deployment queue

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::deploy::pipeline::Pipeline;
use crate::scheduler::dispatch::Scheduler;

/// Build worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Identifies the worker in leases and logs
    pub worker_id: String,
}

/// Run one build worker until shutdown. A deployment already claimed is
/// run to its end before the worker stops.
pub async fn run(
    options: &Options,
    scheduler: Arc<Scheduler>,
    pipeline: Arc<Pipeline>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Build worker {} starting...", options.worker_id);

    loop {
        let id = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Build worker {} shutting down...", options.worker_id);
                return;
            }
            id = scheduler.next_queued() => id,
        };

        debug!("Worker {} picked deployment {}", options.worker_id, id);
        // a panicking run takes down its own task, not the worker
        let job = {
            let scheduler = scheduler.clone();
            let pipeline = pipeline.clone();
            let worker_id = options.worker_id.clone();
            let id = id.clone();
            tokio::spawn(async move { scheduler.run_one(&worker_id, &id, &pipeline).await })
        };
        if let Err(e) = job.await {
            error!(
                "Worker {} lost deployment {} to a crashed run, its lease will expire: {}",
                options.worker_id, id, e
            );
        }
    }
}
