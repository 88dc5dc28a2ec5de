//! Deployment models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ShipyardError;
use crate::models::binding::ArtifactLocation;

/// Routing slot a deployment is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingRole {
    Production,
    Staging,
}

impl RoutingRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingRole::Production => "production",
            RoutingRole::Staging => "staging",
        }
    }
}

impl fmt::Display for RoutingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(RoutingRole::Production),
            "staging" | "stage" => Ok(RoutingRole::Staging),
            _ => Err(format!("Invalid routing role: {}", s)),
        }
    }
}

/// Lifecycle status of a deployment.
///
/// This is the only declaration of the status set; storage, the HTTP API and
/// completion notifications all serialize this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Queued,
    Cloning,
    Building,
    Uploading,
    Activating,
    Active,
    Failed,
    Cancelled,
    Purged,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Active
                | DeploymentStatus::Failed
                | DeploymentStatus::Cancelled
                | DeploymentStatus::Purged
        )
    }

    /// Statuses during which a worker owns the deployment
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Cloning
                | DeploymentStatus::Building
                | DeploymentStatus::Uploading
                | DeploymentStatus::Activating
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Queued => "QUEUED",
            DeploymentStatus::Cloning => "CLONING",
            DeploymentStatus::Building => "BUILDING",
            DeploymentStatus::Uploading => "UPLOADING",
            DeploymentStatus::Activating => "ACTIVATING",
            DeploymentStatus::Active => "ACTIVE",
            DeploymentStatus::Failed => "FAILED",
            DeploymentStatus::Cancelled => "CANCELLED",
            DeploymentStatus::Purged => "PURGED",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What created the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Promotion,
}

impl TriggerKind {
    pub fn priority(&self) -> Priority {
        match self {
            TriggerKind::Manual | TriggerKind::Promotion => Priority::Interactive,
            TriggerKind::Webhook => Priority::Automated,
        }
    }
}

/// Dispatch class; interactive work is served before automated work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Interactive,
    Automated,
}

/// Pipeline step a failure or log line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStep {
    Fetch,
    Install,
    Build,
    Verify,
    Publish,
    Activate,
}

impl BuildStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStep::Fetch => "fetch",
            BuildStep::Install => "install",
            BuildStep::Build => "build",
            BuildStep::Verify => "verify",
            BuildStep::Publish => "publish",
            BuildStep::Activate => "activate",
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy surfaced on failed deployments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Infrastructure blip that outlived its retries
    Transient,
    /// Non-zero exit or missing output
    Build,
    /// Malformed or missing build configuration
    Configuration,
    /// A step or the whole pipeline ran out of time
    Timeout,
    /// Worker lost its lease (crash or stall)
    WorkerLost,
    Internal,
}

/// User-visible error detail of a failed deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentError {
    pub kind: FailureKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<BuildStep>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    pub message: String,

    /// Last log lines before the failure
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_tail: Vec<String>,
}

impl DeploymentError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            step: None,
            exit_code: None,
            message: message.into(),
            log_tail: Vec::new(),
        }
    }

    pub fn at_step(mut self, step: BuildStep) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_log_tail(mut self, log_tail: Vec<String>) -> Self {
        self.log_tail = log_tail;
        self
    }
}

impl fmt::Display for DeploymentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.step, &self.exit_code) {
            (Some(step), Some(code)) => {
                write!(f, "{} step failed with exit code {}: {}", step, code, self.message)
            }
            (Some(step), None) => write!(f, "{} step failed: {}", step, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Exact source revision to build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRevision {
    pub commit: String,
    pub branch: String,
}

impl SourceRevision {
    /// Both values end up as git arguments: the commit must be a (possibly
    /// abbreviated) hex object name and the branch must not look like an option.
    pub fn validate(&self) -> Result<(), ShipyardError> {
        let commit = &self.commit;
        if !(4..=64).contains(&commit.len()) || !commit.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ShipyardError::ValidationError(format!(
                "commit must be 4 to 64 hex characters: {:?}",
                commit
            )));
        }
        if self.branch.starts_with('-') || self.branch.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ShipyardError::ValidationError(format!(
                "invalid branch name: {:?}",
                self.branch
            )));
        }
        Ok(())
    }
}

/// Time-bounded ownership of a deployment by one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Build statistics of a successful build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    pub file_count: u64,
    pub byte_count: u64,
    pub cache_hit: bool,
}

/// One build-and-release attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub project_id: String,
    pub revision: SourceRevision,
    pub role: RoutingRole,
    pub status: DeploymentStatus,
    pub trigger: TriggerKind,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// When the deployment reached ACTIVE
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub build_duration_ms: Option<u64>,

    #[serde(default)]
    pub build_stats: Option<BuildStats>,

    /// Key of the durable log stream
    pub log_ref: String,

    #[serde(default)]
    pub error: Option<DeploymentError>,

    #[serde(default)]
    pub artifact: Option<ArtifactLocation>,

    #[serde(default)]
    pub lease: Option<Lease>,

    /// Hostname to activate once the deployment succeeds
    #[serde(default)]
    pub promote_to: Option<String>,

    /// Deployment this one retries after a lost worker
    #[serde(default)]
    pub retry_of: Option<String>,

    #[serde(default = "default_attempt")]
    pub attempt: u32,

    /// Set once a cancel of the running deployment was accepted; the worker
    /// may no longer complete it
    #[serde(default)]
    pub cancel_requested: bool,

    /// The artifact bytes of a PURGED deployment were deleted
    #[serde(default)]
    pub bytes_reclaimed: bool,
}

fn default_attempt() -> u32 {
    1
}

impl Deployment {
    /// Create a new queued deployment
    pub fn new(
        id: String,
        project_id: String,
        revision: SourceRevision,
        role: RoutingRole,
        trigger: TriggerKind,
    ) -> Self {
        Self {
            log_ref: format!("{}.log", id),
            id,
            project_id,
            revision,
            role,
            status: DeploymentStatus::Queued,
            trigger,
            created_at: Utc::now(),
            started_at: None,
            activated_at: None,
            finished_at: None,
            build_duration_ms: None,
            build_stats: None,
            error: None,
            artifact: None,
            lease: None,
            promote_to: None,
            retry_of: None,
            attempt: 1,
            cancel_requested: false,
            bytes_reclaimed: false,
        }
    }

    /// Idempotency key: (project, revision, role)
    pub fn matches_key(&self, project_id: &str, commit: &str, role: RoutingRole) -> bool {
        self.project_id == project_id && self.revision.commit == commit && self.role == role
    }
}
