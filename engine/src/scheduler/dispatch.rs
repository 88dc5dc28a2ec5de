//! Task scheduler: admission, dispatch, cancellation and lease reaping

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::deploy::fsm::DeploymentEvent;
use crate::deploy::pipeline::{Pipeline, RunControl, StopReason};
use crate::errors::ShipyardError;
use crate::models::binding::normalize_hostname;
use crate::models::deployment::{
    Deployment, DeploymentError, DeploymentStatus, FailureKind, RoutingRole, SourceRevision,
    TriggerKind,
};
use crate::scheduler::queue::{DeploymentQueue, QueueDepth};
use crate::storage::settings::Settings;
use crate::storage::state::{Authority, StateStore};
use crate::utils::generate_uuid;

/// Scheduler options
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Number of build workers
    pub concurrency: usize,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// Time a running deployment gets to unwind after a cancel
    pub cancel_grace: Duration,
    /// Whole-run limit, on top of the per-step timeouts
    pub pipeline_timeout: Duration,
    /// Attempts per (project, revision, role) when workers are lost
    pub max_attempts: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SchedulerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            concurrency: settings.concurrency.max(1),
            lease_ttl: Duration::from_secs(settings.lease.ttl_secs),
            heartbeat_interval: Duration::from_secs(settings.lease.heartbeat_secs),
            cancel_grace: Duration::from_secs(settings.lease.cancel_grace_secs),
            pipeline_timeout: Duration::from_secs(settings.timeouts.pipeline_secs),
            max_attempts: settings.lease.max_attempts.max(1),
        }
    }
}

/// A request to build and release one revision
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub project_id: String,
    pub revision: SourceRevision,
    /// Derived from the branch when absent
    pub role: Option<RoutingRole>,
    pub trigger: TriggerKind,
    /// Hostname to activate once the deployment is ACTIVE
    pub promote_to: Option<String>,
}

pub struct Scheduler {
    state: Arc<StateStore>,
    queue: DeploymentQueue,
    running: Mutex<HashMap<String, RunControl>>,
    options: SchedulerOptions,
}

impl Scheduler {
    pub fn new(state: Arc<StateStore>, options: SchedulerOptions) -> Self {
        Self {
            state,
            queue: DeploymentQueue::new(),
            running: Mutex::new(HashMap::new()),
            options,
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn queue_depth(&self) -> QueueDepth {
        self.queue.depth()
    }

    /// Deployments this process is currently running
    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Admit a deployment. While a non-terminal deployment exists for the
    /// same (project, revision, role) it is returned instead; the flag tells
    /// whether a new one was queued.
    pub async fn submit(&self, request: SubmitRequest) -> Result<(Deployment, bool), ShipyardError> {
        let project = self
            .state
            .get_project(&request.project_id)
            .await
            .ok_or_else(|| ShipyardError::NotFound(format!("project {}", request.project_id)))?;

        // configuration errors never reach a worker
        project.build.validate()?;
        request.revision.validate()?;
        let promote_to = match &request.promote_to {
            Some(hostname) => Some(normalize_hostname(hostname).ok_or_else(|| {
                ShipyardError::ValidationError(format!("invalid hostname: {}", hostname))
            })?),
            None => None,
        };

        let role = request
            .role
            .unwrap_or_else(|| project.role_for_branch(&request.revision.branch));
        let mut deployment = Deployment::new(
            generate_uuid(),
            project.id.clone(),
            request.revision,
            role,
            request.trigger,
        );
        deployment.promote_to = promote_to;

        let (stored, created) = self.state.insert_or_get(deployment).await?;
        if created {
            self.queue.push(&stored.id, stored.trigger.priority());
            info!(
                "Queued deployment {} of {}@{} ({}, {:?})",
                stored.id,
                project.slug,
                stored.revision.commit,
                stored.role,
                stored.trigger.priority()
            );
        }
        Ok((stored, created))
    }

    /// Cancel a non-terminal deployment.
    ///
    /// Queued ones are CANCELLED right away. Running ones are signalled and
    /// forced to CANCELLED if they have not unwound within the grace period.
    pub async fn cancel(&self, id: &str) -> Result<Deployment, ShipyardError> {
        let deployment = self
            .state
            .get_deployment(id)
            .await
            .ok_or_else(|| ShipyardError::NotFound(format!("deployment {}", id)))?;

        match deployment.status {
            status if status.is_terminal() => settled(deployment),
            DeploymentStatus::Queued => {
                self.queue.remove(id);
                let cancelled = self
                    .state
                    .transition(id, Authority::Canceller, DeploymentEvent::Cancel, |_| {})
                    .await?;
                // a worker may have claimed it in between
                self.signal(id, StopReason::Cancelled);
                info!("Cancelled queued deployment {}", id);
                Ok(cancelled)
            }
            _ => {
                // durable before the signal, so a racing completion is refused
                let deployment = self.state.request_cancel(id).await?;
                if !deployment.cancel_requested {
                    return settled(deployment);
                }
                self.signal(id, StopReason::Cancelled);
                let state = self.state.clone();
                let grace = self.options.cancel_grace;
                let id_owned = id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    force_cancel(&state, &id_owned).await;
                });
                info!("Cancellation of running deployment {} requested", id);
                Ok(deployment)
            }
        }
    }

    fn signal(&self, id: &str, reason: StopReason) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(control) = running.get(id) {
            control.stop(reason);
        }
    }

    /// Re-queue deployments that were waiting when the engine stopped.
    /// Running ones are left to the lease reaper.
    pub async fn recover(&self) -> usize {
        let queued = self.state.queued_deployments().await;
        for deployment in &queued {
            self.queue.push(&deployment.id, deployment.trigger.priority());
        }
        if !queued.is_empty() {
            info!("Recovered {} queued deployments", queued.len());
        }
        queued.len()
    }

    /// Fail deployments whose worker stopped renewing its lease and queue a
    /// fresh attempt while attempts remain. Returns the new attempts.
    pub async fn reap_expired_leases(&self) -> Vec<Deployment> {
        let mut retries = Vec::new();
        for expired in self.state.expired_leases(Utc::now()).await {
            let error = DeploymentError::new(
                FailureKind::WorkerLost,
                "The build worker stopped responding",
            );
            let failed = match self
                .state
                .transition(&expired.id, Authority::Reaper, DeploymentEvent::Fail(error), |_| {})
                .await
            {
                Ok(failed) => failed,
                Err(e) => {
                    debug!("Lease of {} no longer reapable: {}", expired.id, e);
                    continue;
                }
            };
            self.signal(&failed.id, StopReason::LeaseLost);
            warn!(
                "Deployment {} lost its worker at {} (attempt {})",
                failed.id, expired.status, failed.attempt
            );

            if failed.attempt >= self.options.max_attempts {
                continue;
            }
            let mut retry = Deployment::new(
                generate_uuid(),
                failed.project_id.clone(),
                failed.revision.clone(),
                failed.role,
                failed.trigger,
            );
            retry.retry_of = Some(failed.id.clone());
            retry.attempt = failed.attempt + 1;
            retry.promote_to = failed.promote_to.clone();
            match self.state.insert_or_get(retry).await {
                Ok((retry, true)) => {
                    self.queue.push(&retry.id, retry.trigger.priority());
                    info!("Queued attempt {} of {} as {}", retry.attempt, failed.id, retry.id);
                    retries.push(retry);
                }
                Ok((existing, false)) => debug!("Retry of {} already covered by {}", failed.id, existing.id),
                Err(e) => warn!("Unable to queue retry of {}: {}", failed.id, e),
            }
        }
        retries
    }

    /// Wait for the next queued deployment id
    pub async fn next_queued(&self) -> String {
        self.queue.pop().await
    }

    /// Claim and run one deployment. Returns `None` when it could not be
    /// claimed (cancelled or taken meanwhile).
    pub async fn run_one(&self, worker_id: &str, id: &str, pipeline: &Pipeline) -> Option<Deployment> {
        let control = RunControl::new();
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), control.clone());
        let _entry = RunningEntry {
            running: &self.running,
            id: id.to_string(),
        };

        let claimed = self.state.claim(id, worker_id, self.options.lease_ttl).await;
        let (deployment, lease) = match claimed {
            Ok(claimed) => claimed,
            Err(e) => {
                debug!("Skipping deployment {}: {}", id, e);
                return None;
            }
        };
        info!("Worker {} claimed deployment {}", worker_id, id);

        // both stop with the run, including when the pipeline panics
        let _heartbeat = AbortOnDropHandle::new(tokio::spawn(heartbeat(
            self.state.clone(),
            id.to_string(),
            lease.token.clone(),
            self.options.lease_ttl,
            self.options.heartbeat_interval,
            control.clone(),
        )));
        let _deadline = {
            let control = control.clone();
            let limit = self.options.pipeline_timeout;
            AbortOnDropHandle::new(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                control.stop(StopReason::TimedOut);
            }))
        };

        let done = pipeline.run(deployment, lease, control).await;
        info!("Worker {} finished deployment {} as {}", worker_id, id, done.status);
        Some(done)
    }
}

/// Answer to cancelling a deployment that already ended
fn settled(deployment: Deployment) -> Result<Deployment, ShipyardError> {
    match deployment.status {
        DeploymentStatus::Cancelled => Ok(deployment),
        status => Err(ShipyardError::Conflict(format!(
            "deployment {} is already {}",
            deployment.id, status
        ))),
    }
}

/// Removes a deployment from the running set when its run ends, however it ends
struct RunningEntry<'a> {
    running: &'a Mutex<HashMap<String, RunControl>>,
    id: String,
}

impl Drop for RunningEntry<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Renew a lease until aborted. A lost lease stops the run.
async fn heartbeat(
    state: Arc<StateStore>,
    id: String,
    token: String,
    ttl: Duration,
    interval: Duration,
    control: RunControl,
) {
    loop {
        tokio::time::sleep(interval).await;
        match state.renew_lease(&id, &token, ttl).await {
            Ok(_) => debug!("Renewed lease on {}", id),
            Err(ShipyardError::LeaseError(e)) => {
                warn!("Lease on {} lost: {}", id, e);
                control.stop(StopReason::LeaseLost);
                return;
            }
            Err(e) => warn!("Unable to renew lease on {}: {}", id, e),
        }
    }
}

async fn force_cancel(state: &StateStore, id: &str) {
    let Some(deployment) = state.get_deployment(id).await else {
        return;
    };
    if deployment.status.is_terminal() {
        return;
    }
    match state
        .transition(id, Authority::Canceller, DeploymentEvent::Cancel, |_| {})
        .await
    {
        Ok(_) => warn!("Deployment {} did not unwind in time, forced to CANCELLED", id),
        Err(e) => debug!("Forced cancel of {} skipped: {}", id, e),
    }
}
