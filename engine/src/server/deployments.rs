//! Deployment handlers: submit, inspect, cancel and logs

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::deploy::logstream::LogLine;
use crate::errors::ShipyardError;
use crate::models::deployment::{Deployment, RoutingRole, SourceRevision, TriggerKind};
use crate::scheduler::dispatch::SubmitRequest;
use crate::server::error::ApiError;
use crate::server::state::ServerState;

const DEFAULT_LOG_LIMIT: usize = 500;
const MAX_LOG_LIMIT: usize = 5000;

/// Manual deployment request
#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub commit: String,
    pub branch: String,
    #[serde(default)]
    pub role: Option<RoutingRole>,
    #[serde(default)]
    pub promote_to: Option<String>,
}

/// Answer to a submit: the deployment and whether it was newly queued
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub deployment: Deployment,
    pub created: bool,
}

pub async fn submit_deployment(
    State(state): State<Arc<ServerState>>,
    Path(project_id): Path<String>,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let (deployment, created) = state
        .app
        .scheduler
        .submit(SubmitRequest {
            project_id,
            revision: SourceRevision {
                commit: body.commit,
                branch: body.branch,
            },
            role: body.role,
            trigger: TriggerKind::Manual,
            promote_to: body.promote_to,
        })
        .await?;
    let status = if created { StatusCode::ACCEPTED } else { StatusCode::OK };
    Ok((status, Json(SubmitResponse { deployment, created })))
}

pub async fn get_deployment(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment = state
        .app
        .state
        .get_deployment(&id)
        .await
        .ok_or_else(|| ShipyardError::NotFound(format!("deployment {}", id)))?;
    Ok(Json(deployment))
}

pub async fn cancel_deployment(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let deployment = state.app.scheduler.cancel(&id).await?;
    let status = if deployment.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(deployment)))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// A page of log lines and where the next page starts
#[derive(Debug, Serialize)]
pub struct LogPage {
    pub lines: Vec<LogLine>,
    pub next_offset: u64,
    /// False once the deployment is terminal and the log is complete
    pub live: bool,
}

pub async fn read_logs(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>, ApiError> {
    let deployment = state
        .app
        .state
        .get_deployment(&id)
        .await
        .ok_or_else(|| ShipyardError::NotFound(format!("deployment {}", id)))?;

    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_LOG_LIMIT);
    let lines = state.app.logs.read(&id, query.offset, limit).await?;
    let next_offset = lines.last().map(|l| l.seq + 1).unwrap_or(query.offset);
    Ok(Json(LogPage {
        lines,
        next_offset,
        live: !deployment.status.is_terminal(),
    }))
}

/// Server-sent events: the persisted log from `offset`, then new lines as
/// they are written until the deployment's log closes
pub async fn tail_logs(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if state.app.state.get_deployment(&id).await.is_none() {
        return Err(ShipyardError::NotFound(format!("deployment {}", id)).into());
    }

    // subscribe before reading the backlog so no line falls in between
    let live = state.app.logs.live(&id).map(|stream| stream.subscribe());
    let backlog = state.app.logs.read(&id, query.offset, usize::MAX).await?;
    let mut last_seq = backlog.last().map(|l| l.seq);
    if last_seq.is_none() && query.offset > 0 {
        last_seq = Some(query.offset - 1);
    }

    let backlog = stream::iter(backlog);
    let tail = stream::unfold((live, last_seq), |(receiver, last_seq)| async move {
        let mut receiver = receiver?;
        loop {
            match receiver.recv().await {
                Ok(line) if last_seq.is_some_and(|seen| line.seq <= seen) => continue,
                Ok(line) => {
                    let seq = Some(line.seq);
                    return Some((line, (Some(receiver), seq)));
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let events = backlog.chain(tail).map(|line| Ok(line_event(&line)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn line_event(line: &LogLine) -> Event {
    let event = Event::default().id(line.seq.to_string());
    match serde_json::to_string(line) {
        Ok(json) => event.data(json),
        Err(_) => event.data(line.message.clone()),
    }
}
