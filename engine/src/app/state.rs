//! Application state management

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::cache::dependency::DependencyCache;
use crate::deploy::executor::BuildExecutor;
use crate::deploy::git::{GitFetcher, SourceFetcher};
use crate::deploy::logstream::LogHub;
use crate::deploy::pipeline::Pipeline;
use crate::errors::ShipyardError;
use crate::http::client::HttpClient;
use crate::http::notify::CompletionNotifier;
use crate::models::binding::HostnameBinding;
use crate::models::deployment::{Deployment, DeploymentStatus, RoutingRole, TriggerKind};
use crate::models::project::{validate_slug, Project};
use crate::publish::object_store::{HttpObjectStore, LocalObjectStore, ObjectStore};
use crate::publish::publisher::ArtifactPublisher;
use crate::publish::runtime::{ComputeRuntime, HttpComputeRuntime, LocalComputeRuntime};
use crate::retention::sweeper::RetentionSweeper;
use crate::routing::directory::ActivationDirectory;
use crate::routing::edge::{EdgeControlPlane, HttpEdge, LocalEdge};
use crate::scheduler::dispatch::{Scheduler, SubmitRequest};
use crate::storage::settings::{BackendKind, BackendSettings};
use crate::storage::state::StateStore;
use crate::utils::generate_uuid;

/// Routing changes on the HTTP edge are visible everywhere within this window
const HTTP_EDGE_PROPAGATION: Duration = Duration::from_secs(60);

/// External systems the engine talks to
pub struct Backends {
    pub store: Arc<dyn ObjectStore>,
    pub runtime: Arc<dyn ComputeRuntime>,
    pub edge: Arc<dyn EdgeControlPlane>,
    pub fetcher: Arc<dyn SourceFetcher>,
}

impl Backends {
    /// Build the backends named in the settings
    pub async fn from_options(options: &AppOptions) -> Result<Self, ShipyardError> {
        let settings = &options.settings;
        let layout = &options.layout;
        let timeout = Duration::from_secs(settings.timeouts.remote_secs);

        let store: Arc<dyn ObjectStore> = match settings.object_store.kind {
            BackendKind::Local => Arc::new(LocalObjectStore::new(layout.objects_dir())),
            BackendKind::Http => Arc::new(HttpObjectStore::new(http_backend(
                "object_store",
                &settings.object_store,
                timeout,
            )?)),
        };
        let runtime: Arc<dyn ComputeRuntime> = match settings.runtime.kind {
            BackendKind::Local => Arc::new(LocalComputeRuntime::new(layout.functions_dir())),
            BackendKind::Http => Arc::new(HttpComputeRuntime::new(http_backend(
                "runtime",
                &settings.runtime,
                timeout,
            )?)),
        };
        let edge: Arc<dyn EdgeControlPlane> = match settings.edge.kind {
            BackendKind::Local => Arc::new(LocalEdge::open(layout.routes_file()).await?),
            BackendKind::Http => Arc::new(HttpEdge::new(
                http_backend("edge", &settings.edge, timeout)?,
                HTTP_EDGE_PROPAGATION,
            )),
        };

        Ok(Self {
            store,
            runtime,
            edge,
            fetcher: Arc::new(GitFetcher),
        })
    }
}

fn http_backend(
    name: &str,
    settings: &BackendSettings,
    timeout: Duration,
) -> Result<HttpClient, ShipyardError> {
    let base_url = settings
        .base_url
        .as_deref()
        .ok_or_else(|| ShipyardError::ConfigError(format!("{}.base_url is required for http", name)))?;
    HttpClient::new(base_url, settings.token.clone(), timeout)
}

/// A project registration or update
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProjectRequest {
    pub slug: String,
    pub repo_url: String,
    #[serde(default)]
    pub production_branch: Option<String>,
    #[serde(default)]
    pub build: crate::models::project::BuildConfig,
}

/// Main application state
pub struct AppState {
    pub version: String,
    pub state: Arc<StateStore>,
    pub logs: Arc<LogHub>,
    pub cache: Arc<DependencyCache>,
    pub publisher: Arc<ArtifactPublisher>,
    pub directory: Arc<ActivationDirectory>,
    pub scheduler: Arc<Scheduler>,
    pub pipeline: Arc<Pipeline>,
    pub sweeper: Arc<RetentionSweeper>,
    pub webhook_secret: Option<SecretString>,
    pub platform_domain: String,
}

impl AppState {
    /// Initialize application state from the data directory
    pub async fn init(version: String, options: &AppOptions) -> Result<Self, ShipyardError> {
        info!("Initializing application state...");

        options.layout.setup().await?;
        let state = Arc::new(StateStore::open(options.layout.state_file()).await?);
        let backends = Backends::from_options(options).await?;
        Self::assemble(version, options, state, backends).await
    }

    /// Wire the engine's components around a state store and backends
    pub async fn assemble(
        version: String,
        options: &AppOptions,
        state: Arc<StateStore>,
        backends: Backends,
    ) -> Result<Self, ShipyardError> {
        let layout = &options.layout;
        let settings = &options.settings;

        let logs = Arc::new(LogHub::new(layout.deployment_logs_dir()));
        let cache = Arc::new(DependencyCache::open(layout.dependency_cache_dir()).await?);
        let publisher = Arc::new(ArtifactPublisher::new(
            backends.store,
            backends.runtime,
            options.publisher.clone(),
        ));
        let directory = Arc::new(ActivationDirectory::new(
            state.clone(),
            backends.edge,
            publisher.clone(),
            options.directory.clone(),
        ));
        let executor = Arc::new(BuildExecutor::new(
            options.executor.clone(),
            backends.fetcher,
            cache.clone(),
            layout.workspaces_dir(),
        ));

        let notifier = match &settings.callback {
            Some(callback) => Some(Arc::new(CompletionNotifier::new(
                &callback.url,
                callback.secret.clone(),
                Duration::from_secs(settings.timeouts.remote_secs),
                options.notify_retry.clone(),
            )?)),
            None => None,
        };

        let pipeline = Arc::new(Pipeline::new(
            state.clone(),
            executor,
            publisher.clone(),
            directory.clone(),
            logs.clone(),
            notifier,
        ));
        let scheduler = Arc::new(Scheduler::new(state.clone(), options.scheduler.clone()));
        let sweeper = Arc::new(RetentionSweeper::new(
            state.clone(),
            directory.clone(),
            publisher.clone(),
            Some(cache.clone()),
            options.retention.clone(),
        ));

        Ok(Self {
            version,
            state,
            logs,
            cache,
            publisher,
            directory,
            scheduler,
            pipeline,
            sweeper,
            webhook_secret: settings.webhook_secret.clone(),
            platform_domain: settings.platform_domain.clone(),
        })
    }

    /// Requeue waiting deployments and re-derive the edge from durable bindings
    pub async fn recover(&self) {
        self.scheduler.recover().await;
        let report = self.directory.resync().await;
        if !report.failed.is_empty() {
            warn!("Edge resync left {} hostnames unmapped", report.failed.len());
        }
    }

    /// Register or update a project. New projects get their default
    /// production and staging hostnames, both auto-promoting.
    pub async fn register_project(
        &self,
        id: Option<String>,
        request: ProjectRequest,
    ) -> Result<Project, ShipyardError> {
        validate_slug(&request.slug)?;
        request.build.validate()?;
        if request.repo_url.trim().is_empty() {
            return Err(ShipyardError::ValidationError("repo_url is required".to_string()));
        }

        let existing = match &id {
            Some(id) => self.state.get_project(id).await,
            None => None,
        };
        let project = Project {
            id: id.unwrap_or_else(generate_uuid),
            slug: request.slug,
            repo_url: request.repo_url,
            production_branch: request
                .production_branch
                .unwrap_or_else(|| "main".to_string()),
            build: request.build,
            active_production: None,
            active_staging: None,
            created_at: Utc::now(),
        };
        let project = self.state.upsert_project(project).await?;

        if existing.is_none() {
            for role in [RoutingRole::Production, RoutingRole::Staging] {
                let hostname = project.default_hostname(role, &self.platform_domain);
                if self.directory.lookup(&hostname).await.is_some() {
                    continue;
                }
                let binding = HostnameBinding::new(hostname, project.id.clone(), role, true);
                self.directory.bind(binding).await?;
            }
            info!("Registered project {} ({})", project.slug, project.id);
        }
        Ok(project)
    }

    /// Put a deployment in front of a hostname.
    ///
    /// A deployment built for the hostname's role is activated directly.
    /// One built for the other role is rebuilt for it, and the new
    /// deployment activates the hostname once it succeeds.
    pub async fn promote(&self, hostname: &str, deployment_id: &str) -> Result<Promotion, ShipyardError> {
        let binding = self
            .directory
            .lookup(hostname)
            .await
            .ok_or_else(|| ShipyardError::NotFound(format!("hostname {}", hostname)))?;
        let deployment = self
            .state
            .get_deployment(deployment_id)
            .await
            .ok_or_else(|| ShipyardError::NotFound(format!("deployment {}", deployment_id)))?;

        if deployment.role == binding.role || deployment.project_id != binding.project_id {
            let binding = self.directory.activate(&binding.hostname, deployment_id).await?;
            return Ok(Promotion::Activated(binding));
        }

        if deployment.status != DeploymentStatus::Active {
            return Err(ShipyardError::Conflict(format!(
                "deployment {} is {}, only ACTIVE deployments can be promoted",
                deployment.id, deployment.status
            )));
        }
        let (rebuild, _) = self
            .scheduler
            .submit(SubmitRequest {
                project_id: deployment.project_id.clone(),
                revision: deployment.revision.clone(),
                role: Some(binding.role),
                trigger: TriggerKind::Promotion,
                promote_to: Some(binding.hostname.clone()),
            })
            .await?;
        info!(
            "Promotion of {} to {} rebuilds as {} deployment {}",
            deployment.id, binding.hostname, binding.role, rebuild.id
        );
        Ok(Promotion::Queued(rebuild))
    }

    /// Activate an earlier artifact on a hostname without rebuilding.
    /// Without an explicit target the newest ACTIVE deployment created
    /// before the current one is used.
    pub async fn rollback(
        &self,
        hostname: &str,
        target: Option<&str>,
    ) -> Result<HostnameBinding, ShipyardError> {
        let binding = self
            .directory
            .lookup(hostname)
            .await
            .ok_or_else(|| ShipyardError::NotFound(format!("hostname {}", hostname)))?;

        let target = match target {
            Some(id) => id.to_string(),
            None => self
                .previous_deployment(&binding)
                .await
                .map(|d| d.id)
                .ok_or_else(|| {
                    ShipyardError::Conflict(format!("no earlier deployment to roll {} back to", hostname))
                })?,
        };
        info!("Rolling {} back to deployment {}", binding.hostname, target);
        self.directory.activate(&binding.hostname, &target).await
    }

    async fn previous_deployment(&self, binding: &HostnameBinding) -> Option<Deployment> {
        let history = self.state.list_deployments(&binding.project_id).await;
        let current = binding
            .active_deployment
            .as_deref()
            .and_then(|id| history.iter().find(|d| d.id == id))
            .map(|d| d.created_at);

        history
            .iter()
            .filter(|d| d.status == DeploymentStatus::Active && d.role == binding.role)
            .filter(|d| Some(d.id.as_str()) != binding.active_deployment.as_deref())
            .filter(|d| current.is_none_or(|at| d.created_at < at))
            .max_by_key(|d| d.created_at)
            .cloned()
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), ShipyardError> {
        info!("Shutting down application state...");
        Ok(())
    }
}

/// Outcome of a promotion request
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Promotion {
    /// The hostname now serves the deployment
    Activated(HostnameBinding),
    /// A rebuild for the hostname's role was queued
    Queued(Deployment),
}
