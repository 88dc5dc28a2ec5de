//! Deployment pipeline
//!
//! Drives one claimed deployment from CLONING to a terminal status. Every
//! transition is made with the worker's lease token; losing the lease stops
//! the run without touching the deployment again.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::deploy::executor::{BuildExecutor, BuildInterrupt, BuildOutput};
use crate::deploy::fsm::DeploymentEvent;
use crate::deploy::logstream::{LogHub, LogStream};
use crate::deploy::sandbox::Sandbox;
use crate::errors::ShipyardError;
use crate::http::notify::{CompletionNotifier, CompletionSummary};
use crate::models::binding::ArtifactLocation;
use crate::models::deployment::{
    BuildStep, Deployment, DeploymentError, FailureKind, Lease,
};
use crate::models::project::Project;
use crate::publish::publisher::ArtifactPublisher;
use crate::routing::directory::ActivationDirectory;
use crate::storage::state::{Authority, StateStore};

/// Why a run was told to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    TimedOut,
    LeaseLost,
}

/// Stop switch shared by a run, its heartbeat and the scheduler.
/// The first reason given wins.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self, reason: StopReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

enum Halt {
    Cancelled,
    Failed(DeploymentError),
    /// Another party owns the deployment now
    Lost(String),
}

impl From<BuildInterrupt> for Halt {
    fn from(interrupt: BuildInterrupt) -> Self {
        match interrupt {
            BuildInterrupt::Cancelled => Halt::Cancelled,
            BuildInterrupt::Failed(error) => Halt::Failed(error),
        }
    }
}

impl From<DeploymentError> for Halt {
    fn from(error: DeploymentError) -> Self {
        Halt::Failed(error)
    }
}

fn state_halt(error: ShipyardError) -> Halt {
    match error {
        ShipyardError::LeaseError(message) | ShipyardError::TransitionError(message) => {
            Halt::Lost(message)
        }
        other => {
            error!("Unable to record deployment progress: {}", other);
            Halt::Failed(DeploymentError::new(
                FailureKind::Internal,
                "Unable to record deployment progress",
            ))
        }
    }
}

pub struct Pipeline {
    state: Arc<StateStore>,
    executor: Arc<BuildExecutor>,
    publisher: Arc<ArtifactPublisher>,
    directory: Arc<ActivationDirectory>,
    logs: Arc<LogHub>,
    notifier: Option<Arc<CompletionNotifier>>,
}

impl Pipeline {
    pub fn new(
        state: Arc<StateStore>,
        executor: Arc<BuildExecutor>,
        publisher: Arc<ArtifactPublisher>,
        directory: Arc<ActivationDirectory>,
        logs: Arc<LogHub>,
        notifier: Option<Arc<CompletionNotifier>>,
    ) -> Self {
        Self {
            state,
            executor,
            publisher,
            directory,
            logs,
            notifier,
        }
    }

    /// Run a claimed deployment to completion. Returns the deployment as
    /// last seen in the state store.
    pub async fn run(&self, deployment: Deployment, lease: Lease, control: RunControl) -> Deployment {
        let id = deployment.id.clone();
        let log = self.logs.open(&id).await;
        info!(deployment_id = %id, "Running deployment of {}", deployment.revision.commit);

        let outcome = match self.state.get_project(&deployment.project_id).await {
            Some(project) => self
                .execute(&deployment, &project, &lease, &log, &control)
                .await
                .map(|done| (done, project)),
            None => Err(Halt::Failed(DeploymentError::new(
                FailureKind::Configuration,
                format!("Project {} no longer exists", deployment.project_id),
            ))),
        };

        let finished = match outcome {
            Ok((done, project)) => {
                log.system(None, "Deployment is ACTIVE").await;
                let hostnames = self.promote(&done, &project, &log).await;
                // promotion may have recorded a service endpoint
                let done = self.state.get_deployment(&id).await.unwrap_or(done);
                self.notify(&done, hostnames);
                Some(done)
            }
            Err(halt) => self.settle(&deployment, &lease, halt, &control, &log).await,
        };

        self.logs.finish(&id);
        match finished {
            Some(done) => done,
            None => self.state.get_deployment(&id).await.unwrap_or(deployment),
        }
    }

    async fn execute(
        &self,
        deployment: &Deployment,
        project: &Project,
        lease: &Lease,
        log: &LogStream,
        control: &RunControl,
    ) -> Result<Deployment, Halt> {
        let sandbox = self
            .executor
            .prepare(&deployment.id, project)
            .await
            .map_err(|e| {
                error!("Unable to prepare sandbox for {}: {}", deployment.id, e);
                Halt::Failed(DeploymentError::new(FailureKind::Internal, "Unable to prepare build sandbox"))
            })?;

        let result = self
            .steps(deployment, project, lease, &sandbox, log, control)
            .await;

        if let Err(e) = sandbox.destroy().await {
            warn!("Unable to remove sandbox of {}: {}", deployment.id, e);
        }
        result
    }

    async fn steps(
        &self,
        deployment: &Deployment,
        project: &Project,
        lease: &Lease,
        sandbox: &Sandbox,
        log: &LogStream,
        control: &RunControl,
    ) -> Result<Deployment, Halt> {
        let cancel = control.token();
        let started = Instant::now();

        // CLONING
        self.executor
            .fetch(sandbox, project, &deployment.revision, log, cancel)
            .await?;
        self.advance(deployment, lease, DeploymentEvent::StartBuild, control, |_| {})
            .await?;

        // BUILDING
        let output = self.executor.build(sandbox, project, log, cancel).await?;
        let elapsed = started.elapsed().as_millis() as u64;
        let stats = output.stats.clone();
        self.advance(deployment, lease, DeploymentEvent::StartUpload, control, |d| {
            d.build_duration_ms = Some(elapsed);
            d.build_stats = Some(stats);
        })
        .await?;

        // UPLOADING
        let location = self.upload(deployment, project, &output, log, control).await?;
        let activated = self
            .activate_artifact(deployment, lease, location, log, control)
            .await;
        if activated.is_err() {
            // an artifact of a deployment that never became ACTIVE is never served
            self.publisher.discard(project, &deployment.id).await;
        }
        activated
    }

    async fn activate_artifact(
        &self,
        deployment: &Deployment,
        lease: &Lease,
        location: ArtifactLocation,
        log: &LogStream,
        control: &RunControl,
    ) -> Result<Deployment, Halt> {
        let recorded = location.clone();
        self.advance(deployment, lease, DeploymentEvent::StartActivation, control, |d| {
            d.artifact = Some(recorded);
        })
        .await?;

        // ACTIVATING
        self.finalize(&location, log).await?;
        if control.is_stopped() {
            return Err(Halt::Cancelled);
        }
        self.state
            .transition(
                &deployment.id,
                Authority::Worker { token: &lease.token },
                DeploymentEvent::Complete,
                |_| {},
            )
            .await
            .map_err(|e| match e {
                // a cancel was accepted while this run was finishing
                ShipyardError::Conflict(_) => Halt::Cancelled,
                other => state_halt(other),
            })
    }

    async fn advance(
        &self,
        deployment: &Deployment,
        lease: &Lease,
        event: DeploymentEvent,
        control: &RunControl,
        update: impl FnOnce(&mut Deployment),
    ) -> Result<Deployment, Halt> {
        if control.is_stopped() {
            return Err(Halt::Cancelled);
        }
        self.state
            .transition(&deployment.id, Authority::Worker { token: &lease.token }, event, update)
            .await
            .map_err(state_halt)
    }

    async fn upload(
        &self,
        deployment: &Deployment,
        project: &Project,
        output: &BuildOutput,
        log: &LogStream,
        control: &RunControl,
    ) -> Result<ArtifactLocation, Halt> {
        tokio::select! {
            result = self.publisher.publish(deployment, project, output, log) => result.map_err(Halt::Failed),
            _ = control.token().cancelled() => {
                self.publisher.discard(project, &deployment.id).await;
                Err(Halt::Cancelled)
            }
        }
    }

    /// Check that every object of the artifact landed. Service bundles stay
    /// in the object store until a hostname activation loads them.
    async fn finalize(&self, location: &ArtifactLocation, log: &LogStream) -> Result<(), Halt> {
        let complete = self.publisher.is_complete(location).await.unwrap_or(false);
        if !complete {
            return Err(Halt::Failed(
                DeploymentError::new(FailureKind::Internal, "Artifact manifest is missing")
                    .at_step(BuildStep::Activate),
            ));
        }
        if matches!(location, ArtifactLocation::Service { .. }) {
            log.system(
                Some(BuildStep::Activate),
                "Service bundle stored; it is loaded when a hostname activates it",
            )
            .await;
        }
        Ok(())
    }

    /// Activate the fresh deployment where it was asked for
    async fn promote(&self, deployment: &Deployment, project: &Project, log: &LogStream) -> Vec<String> {
        let mut hostnames = self.directory.auto_promote(deployment).await;
        if let Some(hostname) = &deployment.promote_to {
            if !hostnames.contains(hostname) {
                match self.directory.activate(hostname, &deployment.id).await {
                    Ok(binding) => hostnames.push(binding.hostname),
                    Err(e) => {
                        warn!("Promotion of {} to {} failed: {}", deployment.id, hostname, e);
                        log.system(
                            Some(BuildStep::Activate),
                            format!("Promotion to {} failed", hostname),
                        )
                        .await;
                    }
                }
            }
        }
        for hostname in &hostnames {
            log.system(
                Some(BuildStep::Activate),
                format!("Serving on {} (project {})", hostname, project.slug),
            )
            .await;
        }
        hostnames
    }

    /// Record how a halted run ended. Returns the terminal deployment when
    /// this worker was the one to write it.
    async fn settle(
        &self,
        deployment: &Deployment,
        lease: &Lease,
        halt: Halt,
        control: &RunControl,
        log: &LogStream,
    ) -> Option<Deployment> {
        let authority = Authority::Worker { token: &lease.token };
        let halt = match (halt, control.reason()) {
            (Halt::Cancelled, Some(StopReason::TimedOut)) => Halt::Failed(DeploymentError::new(
                FailureKind::Timeout,
                "Deployment exceeded the pipeline time limit",
            )),
            (Halt::Cancelled, Some(StopReason::LeaseLost)) => {
                Halt::Lost("lease expired during the run".to_string())
            }
            (halt, _) => halt,
        };

        let result = match halt {
            Halt::Lost(reason) => {
                warn!(deployment_id = %deployment.id, "Stopped without a final transition: {}", reason);
                log.system(None, "Worker lost ownership of the deployment").await;
                return None;
            }
            Halt::Cancelled => {
                log.system(None, "Deployment cancelled").await;
                self.state
                    .transition(&deployment.id, authority, DeploymentEvent::Cancel, |_| {})
                    .await
            }
            Halt::Failed(failure) => {
                log.system(failure.step, format!("Deployment failed: {}", failure)).await;
                self.state
                    .transition(&deployment.id, authority, DeploymentEvent::Fail(failure), |_| {})
                    .await
            }
        };

        match result {
            Ok(done) => {
                info!(deployment_id = %done.id, "Deployment finished as {}", done.status);
                self.notify(&done, Vec::new());
                Some(done)
            }
            Err(e) => {
                // a forced cancel or the reaper got there first
                warn!(deployment_id = %deployment.id, "Final transition skipped: {}", e);
                None
            }
        }
    }

    fn notify(&self, deployment: &Deployment, hostnames: Vec<String>) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        if !deployment.status.is_terminal() {
            return;
        }
        let summary = CompletionSummary::new(deployment, hostnames);
        tokio::spawn(async move {
            let _ = notifier.notify(&summary).await;
        });
    }
}
