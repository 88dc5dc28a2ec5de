//! Signed push webhook

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::authn::signature::{verify, SIGNATURE_HEADER};
use crate::errors::ShipyardError;
use crate::models::deployment::{Deployment, SourceRevision, TriggerKind};
use crate::scheduler::dispatch::SubmitRequest;
use crate::server::error::ApiError;
use crate::server::state::ServerState;

/// A pushed ref
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    /// Project id or slug
    pub project: String,

    /// `refs/heads/<branch>` or a bare branch name
    #[serde(rename = "ref", alias = "branch")]
    pub git_ref: String,

    /// Commit the ref now points at
    #[serde(alias = "commit")]
    pub after: String,

    #[serde(default)]
    pub deleted: bool,
}

impl PushEvent {
    /// Branch name, or `None` for tags and other refs
    pub fn branch(&self) -> Option<&str> {
        if let Some(branch) = self.git_ref.strip_prefix("refs/heads/") {
            return Some(branch);
        }
        (!self.git_ref.starts_with("refs/")).then_some(self.git_ref.as_str())
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Deployment>,
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl WebhookResponse {
    fn skipped(reason: &str) -> Self {
        debug!("Ignoring push: {}", reason);
        Self {
            deployment: None,
            created: false,
            skipped: Some(reason.to_string()),
        }
    }
}

/// Verify the signature over the raw body, then submit the pushed revision
/// at automated priority. Redelivered pushes map onto the same deployment.
pub async fn push_webhook(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), ApiError> {
    let secret = state
        .app
        .webhook_secret
        .as_ref()
        .ok_or_else(|| ShipyardError::SignatureError("webhooks are not configured".to_string()))?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ShipyardError::SignatureError(format!("missing {} header", SIGNATURE_HEADER)))?;
    verify(secret.expose_secret().as_bytes(), &body, signature)?;

    let event: PushEvent = serde_json::from_slice(&body).map_err(ShipyardError::from)?;
    if event.deleted || event.after.chars().all(|c| c == '0') {
        return Ok((StatusCode::OK, Json(WebhookResponse::skipped("ref deleted"))));
    }
    let Some(branch) = event.branch() else {
        return Ok((StatusCode::OK, Json(WebhookResponse::skipped("not a branch"))));
    };

    let project = match state.app.state.get_project(&event.project).await {
        Some(project) => project,
        None => state
            .app
            .state
            .list_projects()
            .await
            .into_iter()
            .find(|p| p.slug == event.project)
            .ok_or_else(|| ShipyardError::NotFound(format!("project {}", event.project)))?,
    };

    let (deployment, created) = state
        .app
        .scheduler
        .submit(SubmitRequest {
            project_id: project.id.clone(),
            revision: SourceRevision {
                commit: event.after.clone(),
                branch: branch.to_string(),
            },
            role: None,
            trigger: TriggerKind::Webhook,
            promote_to: None,
        })
        .await?;
    info!(
        "Push to {}@{} accepted as deployment {}",
        project.slug, branch, deployment.id
    );

    let status = if created { StatusCode::ACCEPTED } else { StatusCode::OK };
    Ok((
        status,
        Json(WebhookResponse {
            deployment: Some(deployment),
            created,
            skipped: None,
        }),
    ))
}
