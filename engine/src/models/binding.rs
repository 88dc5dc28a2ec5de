//! Hostname binding and artifact location models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::deployment::RoutingRole;

/// Where a published deployment lives. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArtifactLocation {
    /// Versioned directory tree in the object store
    Static { prefix: String },

    /// Bundle stored under `prefix`, registered as `function` and answering
    /// at the runtime-assigned `endpoint`
    Service {
        prefix: String,
        function: String,
        endpoint: String,
    },
}

impl ArtifactLocation {
    /// Object store prefix holding the artifact bytes
    pub fn prefix(&self) -> &str {
        match self {
            ArtifactLocation::Static { prefix } => prefix,
            ArtifactLocation::Service { prefix, .. } => prefix,
        }
    }

    /// Object whose presence marks the artifact as completely written
    pub fn manifest_path(&self) -> String {
        format!("{}/{}", self.prefix(), MANIFEST_OBJECT)
    }
}

/// Name of the completeness marker written last by the publisher
pub const MANIFEST_OBJECT: &str = "_shipyard_manifest.json";

/// The value the edge serves for a hostname
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingValue {
    pub target: ArtifactLocation,
    pub deployment_id: String,
    pub revision: String,
    pub activated_at: DateTime<Utc>,
}

/// Durable record of which deployment answers a hostname
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostnameBinding {
    pub hostname: String,
    pub project_id: String,
    pub role: RoutingRole,

    /// Activate every newly succeeded deployment of `role` automatically
    #[serde(default)]
    pub auto_promote: bool,

    #[serde(default)]
    pub active_deployment: Option<String>,

    #[serde(default)]
    pub value: Option<BindingValue>,
}

impl HostnameBinding {
    pub fn new(hostname: String, project_id: String, role: RoutingRole, auto_promote: bool) -> Self {
        Self {
            hostname,
            project_id,
            role,
            auto_promote,
            active_deployment: None,
            value: None,
        }
    }
}

/// Normalize a hostname for use as a directory key
pub fn normalize_hostname(hostname: &str) -> Option<String> {
    let host = hostname.trim().trim_end_matches('.').to_lowercase();
    if host.is_empty() || host.len() > 253 {
        return None;
    }
    let labels_ok = host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    labels_ok.then_some(host)
}
