//! Lease reaper worker

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::scheduler::dispatch::Scheduler;

/// Reaper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// How often expired leases are looked for
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
        }
    }
}

/// Run the reaper worker
pub async fn run<S, F>(
    options: &Options,
    scheduler: Arc<Scheduler>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Reaper worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reaper worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let retries = scheduler.reap_expired_leases().await;
        if !retries.is_empty() {
            info!("Reaper queued {} retries", retries.len());
        } else {
            debug!("No expired leases");
        }
    }
}
