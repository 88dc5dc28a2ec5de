//! Signed completion notifications

use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::authn::signature::{sign, SIGNATURE_HEADER};
use crate::errors::{RemoteError, ShipyardError};
use crate::http::client::HttpClient;
use crate::models::deployment::{Deployment, DeploymentError, DeploymentStatus, RoutingRole};
use crate::utils::{retry_with_backoff, RetryOptions};

/// Body of a completion notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub deployment_id: String,
    pub project_id: String,
    pub commit: String,
    pub branch: String,
    pub role: RoutingRole,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeploymentError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_duration_ms: Option<u64>,
    /// Hostnames that now serve the deployment
    #[serde(default)]
    pub hostnames: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl CompletionSummary {
    pub fn new(deployment: &Deployment, hostnames: Vec<String>) -> Self {
        Self {
            deployment_id: deployment.id.clone(),
            project_id: deployment.project_id.clone(),
            commit: deployment.revision.commit.clone(),
            branch: deployment.revision.branch.clone(),
            role: deployment.role,
            status: deployment.status,
            error: deployment.error.clone(),
            build_duration_ms: deployment.build_duration_ms,
            hostnames,
            finished_at: deployment.finished_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Posts terminal deployment summaries to the configured callback URL.
///
/// Transient failures are retried with backoff; a 4xx answer is final.
pub struct CompletionNotifier {
    client: HttpClient,
    secret: Option<SecretString>,
    retry: RetryOptions,
}

impl CompletionNotifier {
    pub fn new(
        url: &str,
        secret: Option<SecretString>,
        timeout: Duration,
        retry: RetryOptions,
    ) -> Result<Self, ShipyardError> {
        Ok(Self {
            client: HttpClient::new(url, None, timeout)?,
            secret,
            retry,
        })
    }

    pub async fn notify(&self, summary: &CompletionSummary) -> Result<(), RemoteError> {
        let body = serde_json::to_vec(summary).map_err(|e| RemoteError::Rejected {
            status: 0,
            message: e.to_string(),
        })?;
        let mut headers = vec![("content-type", "application/json".to_string())];
        if let Some(secret) = &self.secret {
            let signature = sign(secret.expose_secret().as_bytes(), &body).map_err(|e| {
                RemoteError::Rejected {
                    status: 0,
                    message: e.to_string(),
                }
            })?;
            headers.push((SIGNATURE_HEADER, signature));
        }

        let label = format!("notify {}", summary.deployment_id);
        let result = retry_with_backoff(&self.retry, &label, |_| {
            self.client.post_bytes("", body.clone(), &headers)
        })
        .await;
        match &result {
            Ok(()) => info!(
                "Delivered completion of {} ({})",
                summary.deployment_id, summary.status
            ),
            Err(e) => warn!(
                "Giving up on completion notification for {}: {}",
                summary.deployment_id, e
            ),
        }
        result
    }
}
