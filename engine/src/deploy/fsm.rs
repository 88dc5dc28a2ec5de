//! Finite State Machine for the deployment lifecycle
//!
//! ```text
//! QUEUED -> CLONING -> BUILDING -> UPLOADING -> ACTIVATING -> ACTIVE -> PURGED
//!    \________\___________\___________\____________\-> FAILED | CANCELLED
//! ```

use crate::models::deployment::{DeploymentError, DeploymentStatus};

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// A worker claimed the deployment and starts fetching sources
    StartClone,

    /// Sources fetched, dependency install and build begin
    StartBuild,

    /// Build verified, upload begins
    StartUpload,

    /// Upload complete, artifact is being finalized
    StartActivation,

    /// Artifact fully published
    Complete,

    /// A step errored
    Fail(DeploymentError),

    /// Explicit cancellation
    Cancel,

    /// Retention reclaimed the artifact bytes
    Purge,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    status: DeploymentStatus,
    error: Option<DeploymentError>,
}

impl DeploymentFsm {
    /// Create a new FSM in queued state
    pub fn new() -> Self {
        Self {
            status: DeploymentStatus::Queued,
            error: None,
        }
    }

    /// Resume the FSM of a stored deployment
    pub fn resume(status: DeploymentStatus, error: Option<DeploymentError>) -> Self {
        Self { status, error }
    }

    /// Get current status
    pub fn status(&self) -> DeploymentStatus {
        self.status
    }

    /// Get error detail if any
    pub fn error(&self) -> Option<&DeploymentError> {
        self.error.as_ref()
    }

    /// Consume the FSM, returning its status and error detail
    pub fn into_parts(self) -> (DeploymentStatus, Option<DeploymentError>) {
        (self.status, self.error)
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        use DeploymentStatus::*;

        let new_status = match (&self.status, event) {
            // Success path, one step at a time
            (Queued, DeploymentEvent::StartClone) => Cloning,
            (Cloning, DeploymentEvent::StartBuild) => Building,
            (Building, DeploymentEvent::StartUpload) => Uploading,
            (Uploading, DeploymentEvent::StartActivation) => Activating,
            (Activating, DeploymentEvent::Complete) => Active,

            // Interrupts from any non-terminal status
            (status, DeploymentEvent::Fail(err)) if !status.is_terminal() => {
                self.error = Some(err);
                Failed
            }
            (status, DeploymentEvent::Cancel) if !status.is_terminal() => Cancelled,

            // Retention
            (Active, DeploymentEvent::Purge) => Purged,

            // Invalid transitions
            (status, event) => {
                return Err(format!("{} -> {:?}", status, event));
            }
        };

        self.status = new_status;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
