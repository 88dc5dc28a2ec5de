//! Project handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app::state::ProjectRequest;
use crate::errors::ShipyardError;
use crate::models::deployment::Deployment;
use crate::models::project::Project;
use crate::retention::sweeper::SweepReport;
use crate::server::error::ApiError;
use crate::server::state::ServerState;

pub async fn create_project(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let project = state.app.register_project(None, request).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn update_project(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<ProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    if state.app.state.get_project(&id).await.is_none() {
        return Err(ShipyardError::NotFound(format!("project {}", id)).into());
    }
    Ok(Json(state.app.register_project(Some(id), request).await?))
}

pub async fn get_project(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    let project = state
        .app
        .state
        .get_project(&id)
        .await
        .ok_or_else(|| ShipyardError::NotFound(format!("project {}", id)))?;
    Ok(Json(project))
}

pub async fn list_projects(State(state): State<Arc<ServerState>>) -> Json<Vec<Project>> {
    Json(state.app.state.list_projects().await)
}

/// Deployment history of a project, newest first
pub async fn list_project_deployments(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Deployment>>, ApiError> {
    if state.app.state.get_project(&id).await.is_none() {
        return Err(ShipyardError::NotFound(format!("project {}", id)).into());
    }
    Ok(Json(state.app.state.list_deployments(&id).await))
}

pub async fn sweep_project(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<SweepReport>, ApiError> {
    Ok(Json(state.app.sweeper.sweep_project(&id).await?))
}
