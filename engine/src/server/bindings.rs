//! Hostname binding handlers: bind, promote, rollback and deactivate

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::app::state::Promotion;
use crate::errors::ShipyardError;
use crate::models::binding::HostnameBinding;
use crate::models::deployment::RoutingRole;
use crate::retention::sweeper::SweepReport;
use crate::routing::directory::ResyncReport;
use crate::server::error::ApiError;
use crate::server::state::ServerState;

#[derive(Debug, Deserialize)]
pub struct BindBody {
    pub project_id: String,
    pub role: RoutingRole,
    #[serde(default)]
    pub auto_promote: bool,
}

pub async fn bind_hostname(
    State(state): State<Arc<ServerState>>,
    Path(hostname): Path<String>,
    Json(body): Json<BindBody>,
) -> Result<Json<HostnameBinding>, ApiError> {
    let binding = HostnameBinding::new(hostname, body.project_id, body.role, body.auto_promote);
    Ok(Json(state.app.directory.bind(binding).await?))
}

pub async fn lookup_hostname(
    State(state): State<Arc<ServerState>>,
    Path(hostname): Path<String>,
) -> Result<Json<HostnameBinding>, ApiError> {
    let binding = state
        .app
        .directory
        .lookup(&hostname)
        .await
        .ok_or_else(|| ShipyardError::NotFound(format!("hostname {}", hostname)))?;
    Ok(Json(binding))
}

pub async fn list_bindings(State(state): State<Arc<ServerState>>) -> Json<Vec<HostnameBinding>> {
    Json(state.app.state.list_bindings().await)
}

pub async fn unbind_hostname(
    State(state): State<Arc<ServerState>>,
    Path(hostname): Path<String>,
) -> Result<Json<HostnameBinding>, ApiError> {
    Ok(Json(state.app.directory.unbind(&hostname).await?))
}

pub async fn deactivate_hostname(
    State(state): State<Arc<ServerState>>,
    Path(hostname): Path<String>,
) -> Result<Json<HostnameBinding>, ApiError> {
    Ok(Json(state.app.directory.deactivate(&hostname).await?))
}

#[derive(Debug, Deserialize)]
pub struct PromoteBody {
    pub deployment_id: String,
}

pub async fn promote(
    State(state): State<Arc<ServerState>>,
    Path(hostname): Path<String>,
    Json(body): Json<PromoteBody>,
) -> Result<Json<Promotion>, ApiError> {
    Ok(Json(state.app.promote(&hostname, &body.deployment_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackBody {
    #[serde(default)]
    pub deployment_id: Option<String>,
}

pub async fn rollback(
    State(state): State<Arc<ServerState>>,
    Path(hostname): Path<String>,
    body: Bytes,
) -> Result<Json<HostnameBinding>, ApiError> {
    // the body is optional
    let body: RollbackBody = if body.is_empty() {
        RollbackBody::default()
    } else {
        serde_json::from_slice(&body).map_err(ShipyardError::from)?
    };
    let binding = state
        .app
        .rollback(&hostname, body.deployment_id.as_deref())
        .await?;
    Ok(Json(binding))
}

/// Re-derive every edge mapping from the durable bindings
pub async fn resync(State(state): State<Arc<ServerState>>) -> Json<ResyncReport> {
    Json(state.app.directory.resync().await)
}

/// Run a retention sweep over every project now
pub async fn sweep_all(State(state): State<Arc<ServerState>>) -> Json<SweepReport> {
    Json(state.app.sweeper.sweep_all().await)
}
