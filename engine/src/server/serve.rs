//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::ShipyardError;
use crate::server::bindings::{
    bind_hostname, deactivate_hostname, list_bindings, lookup_hostname, promote, resync, rollback,
    sweep_all, unbind_hostname,
};
use crate::server::deployments::{
    cancel_deployment, get_deployment, read_logs, submit_deployment, tail_logs,
};
use crate::server::handlers::{health_handler, metrics_handler, version_handler};
use crate::server::projects::{
    create_project, get_project, list_project_deployments, list_projects, sweep_project,
    update_project,
};
use crate::server::state::ServerState;
use crate::server::webhook::push_webhook;

/// Routes of the control API
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/metrics", get(metrics_handler))
        // Projects
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/{id}", get(get_project).put(update_project))
        .route(
            "/projects/{id}/deployments",
            get(list_project_deployments).post(submit_deployment),
        )
        .route("/projects/{id}/sweep", post(sweep_project))
        // Deployments
        .route("/deployments/{id}", get(get_deployment))
        .route("/deployments/{id}/cancel", post(cancel_deployment))
        .route("/deployments/{id}/logs", get(read_logs))
        .route("/deployments/{id}/logs/live", get(tail_logs))
        // Hostnames
        .route("/bindings", get(list_bindings))
        .route(
            "/bindings/{hostname}",
            put(bind_hostname).get(lookup_hostname).delete(unbind_hostname),
        )
        .route("/bindings/{hostname}/promote", post(promote))
        .route("/bindings/{hostname}/rollback", post(rollback))
        .route("/bindings/{hostname}/deactivate", post(deactivate_hostname))
        // Maintenance
        .route("/admin/resync", post(resync))
        .route("/admin/sweep", post(sweep_all))
        // Triggers
        .route("/webhooks/push", post(push_webhook))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), ShipyardError>>, ShipyardError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ShipyardError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ShipyardError::ServerError(e.to_string()))
    });

    Ok(handle)
}
