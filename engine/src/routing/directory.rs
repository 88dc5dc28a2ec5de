//! Activation directory: which deployment answers each hostname
//!
//! The durable binding in the state store is the source of truth; the edge
//! mapping is derived from it and can always be rebuilt with
//! [`ActivationDirectory::resync`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::errors::{RemoteError, ShipyardError};
use crate::models::binding::{normalize_hostname, ArtifactLocation, BindingValue, HostnameBinding};
use crate::models::deployment::{Deployment, DeploymentStatus};
use crate::models::project::Project;
use crate::publish::publisher::ArtifactPublisher;
use crate::routing::edge::EdgeControlPlane;
use crate::storage::state::StateStore;
use crate::utils::{retry_with_backoff, RetryOptions};

/// Async locks handed out per key
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Deployments with an activation in progress, counted per id
#[derive(Default)]
struct ActivatingSet {
    ids: Mutex<HashMap<String, usize>>,
}

impl ActivatingSet {
    fn enter(self: &Arc<Self>, id: &str) -> ActivatingGuard {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        *ids.entry(id.to_string()).or_insert(0) += 1;
        ActivatingGuard {
            set: self.clone(),
            id: id.to_string(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }
}

struct ActivatingGuard {
    set: Arc<ActivatingSet>,
    id: String,
}

impl Drop for ActivatingGuard {
    fn drop(&mut self) {
        let mut ids = self.set.ids.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = ids.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                ids.remove(&self.id);
            }
        }
    }
}

/// Directory options
#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    pub retry: RetryOptions,
    /// Bound on every single edge call
    pub call_timeout: Duration,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of re-deriving the edge from durable bindings
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResyncReport {
    pub mapped: usize,
    pub cleared: usize,
    pub failed: Vec<String>,
}

pub struct ActivationDirectory {
    state: Arc<StateStore>,
    edge: Arc<dyn EdgeControlPlane>,
    publisher: Arc<ArtifactPublisher>,
    options: DirectoryOptions,
    hostnames: KeyedLocks,
    functions: KeyedLocks,
    activating: Arc<ActivatingSet>,
}

impl ActivationDirectory {
    pub fn new(
        state: Arc<StateStore>,
        edge: Arc<dyn EdgeControlPlane>,
        publisher: Arc<ArtifactPublisher>,
        options: DirectoryOptions,
    ) -> Self {
        Self {
            state,
            edge,
            publisher,
            options,
            hostnames: KeyedLocks::default(),
            functions: KeyedLocks::default(),
            activating: Arc::new(ActivatingSet::default()),
        }
    }

    pub fn edge(&self) -> &Arc<dyn EdgeControlPlane> {
        &self.edge
    }

    /// Serialise work on one hostname
    pub async fn lock_hostname(&self, hostname: &str) -> OwnedMutexGuard<()> {
        self.hostnames.lock(hostname).await
    }

    /// Whether an activation of `deployment_id` is in progress
    pub fn is_activating(&self, deployment_id: &str) -> bool {
        self.activating.contains(deployment_id)
    }

    /// Create or reconfigure a hostname binding
    pub async fn bind(&self, binding: HostnameBinding) -> Result<HostnameBinding, ShipyardError> {
        let hostname = normalize_hostname(&binding.hostname).ok_or_else(|| {
            ShipyardError::ValidationError(format!("invalid hostname: {}", binding.hostname))
        })?;
        let _guard = self.lock_hostname(&hostname).await;
        let binding = HostnameBinding { hostname, ..binding };
        let stored = self.state.upsert_binding(binding).await?;
        info!(
            "Bound {} to project {} ({})",
            stored.hostname, stored.project_id, stored.role
        );
        Ok(stored)
    }

    pub async fn lookup(&self, hostname: &str) -> Option<HostnameBinding> {
        let hostname = normalize_hostname(hostname)?;
        self.state.get_binding(&hostname).await
    }

    /// Make `deployment_id` the deployment served for `hostname`.
    ///
    /// Works for fresh promotions and rollbacks alike: any ACTIVE deployment
    /// of the binding's project and role qualifies, nothing is rebuilt.
    pub async fn activate(
        &self,
        hostname: &str,
        deployment_id: &str,
    ) -> Result<HostnameBinding, ShipyardError> {
        let hostname = normalize_hostname(hostname)
            .ok_or_else(|| ShipyardError::ValidationError(format!("invalid hostname: {}", hostname)))?;
        let _host = self.lock_hostname(&hostname).await;

        // entering the set before reading the status keeps the sweeper off it
        let _activating = self.activating.enter(deployment_id);

        let binding = self
            .state
            .get_binding(&hostname)
            .await
            .ok_or_else(|| ShipyardError::NotFound(format!("binding {}", hostname)))?;
        let deployment = self
            .state
            .get_deployment(deployment_id)
            .await
            .ok_or_else(|| ShipyardError::NotFound(format!("deployment {}", deployment_id)))?;
        check_activatable(&binding, &deployment)?;
        if binding.active_deployment.as_deref() == Some(deployment_id) {
            debug!("{} already serves {}, refreshing", hostname, deployment_id);
        }

        let project = self
            .state
            .get_project(&deployment.project_id)
            .await
            .ok_or_else(|| ShipyardError::NotFound(format!("project {}", deployment.project_id)))?;
        let location = deployment.artifact.clone().ok_or_else(|| {
            ShipyardError::ActivationError(format!("deployment {} has no artifact", deployment.id))
        })?;
        let complete = self
            .publisher
            .is_complete(&location)
            .await
            .map_err(|e| ShipyardError::ActivationError(format!("unable to verify artifact: {}", e)))?;
        if !complete {
            return Err(ShipyardError::ActivationError(format!(
                "artifact of deployment {} is incomplete",
                deployment.id
            )));
        }
        // the only place a service bundle is loaded into its runtime function
        let target = self.ensure_loaded(&project, &deployment.id, &location).await?;

        let value = BindingValue {
            target,
            deployment_id: deployment.id.clone(),
            revision: deployment.revision.commit.clone(),
            activated_at: Utc::now(),
        };
        if let Err(e) = self.write_edge(&hostname, Some(&value)).await {
            self.restore_function(&project, &binding).await;
            return Err(e);
        }

        let stored = match self.state.set_binding_active(&hostname, value).await {
            Ok(stored) => stored,
            Err(e) => {
                // durable state did not move, put the edge back where it was
                if let Err(restore) = self.write_edge(&hostname, binding.value.as_ref()).await {
                    error!("Unable to restore edge mapping of {}: {}", hostname, restore);
                }
                self.restore_function(&project, &binding).await;
                return Err(e);
            }
        };

        if let Err(e) = self.edge.purge_cache(&hostname).await {
            warn!("Unable to purge edge cache for {}: {}", hostname, e);
        }
        info!(
            "Activated deployment {} ({}) on {}",
            deployment.id, deployment.revision.commit, hostname
        );
        Ok(stored)
    }

    /// Stop serving anything for `hostname`; the binding itself stays
    pub async fn deactivate(&self, hostname: &str) -> Result<HostnameBinding, ShipyardError> {
        let hostname = normalize_hostname(hostname)
            .ok_or_else(|| ShipyardError::ValidationError(format!("invalid hostname: {}", hostname)))?;
        let _host = self.lock_hostname(&hostname).await;
        self.deactivate_locked(&hostname).await
    }

    /// Deactivate and forget a binding
    pub async fn unbind(&self, hostname: &str) -> Result<HostnameBinding, ShipyardError> {
        let hostname = normalize_hostname(hostname)
            .ok_or_else(|| ShipyardError::ValidationError(format!("invalid hostname: {}", hostname)))?;
        let _host = self.lock_hostname(&hostname).await;
        let binding = self.deactivate_locked(&hostname).await?;
        self.state.remove_binding(&hostname).await?;
        info!("Unbound {}", hostname);
        Ok(binding)
    }

    async fn deactivate_locked(&self, hostname: &str) -> Result<HostnameBinding, ShipyardError> {
        if self.state.get_binding(hostname).await.is_none() {
            return Err(ShipyardError::NotFound(format!("binding {}", hostname)));
        }
        self.write_edge(hostname, None).await?;
        let binding = self.state.clear_binding(hostname).await?;
        if let Err(e) = self.edge.purge_cache(hostname).await {
            warn!("Unable to purge edge cache for {}: {}", hostname, e);
        }
        info!("Deactivated {}", hostname);
        Ok(binding)
    }

    /// Activate a freshly succeeded deployment on every auto-promote binding
    /// of its project and role. Returns the hostnames that now serve it.
    pub async fn auto_promote(&self, deployment: &Deployment) -> Vec<String> {
        let targets: Vec<String> = self
            .state
            .list_bindings()
            .await
            .into_iter()
            .filter(|b| b.auto_promote && b.project_id == deployment.project_id && b.role == deployment.role)
            .map(|b| b.hostname)
            .collect();

        let mut promoted = Vec::new();
        for hostname in targets {
            match self.activate(&hostname, &deployment.id).await {
                Ok(_) => promoted.push(hostname),
                Err(e) => warn!("Auto-promotion of {} to {} failed: {}", deployment.id, hostname, e),
            }
        }
        promoted
    }

    /// Load a service bundle into its runtime function unless the function
    /// already runs it; returns the location with the current endpoint.
    pub async fn ensure_loaded(
        &self,
        project: &Project,
        deployment_id: &str,
        location: &ArtifactLocation,
    ) -> Result<ArtifactLocation, ShipyardError> {
        let ArtifactLocation::Service { function, endpoint, .. } = location else {
            return Ok(location.clone());
        };
        let _function = self.functions.lock(function).await;
        let current = self.state.function_deployment(function).await;
        if current.as_deref() == Some(deployment_id) && !endpoint.is_empty() {
            return Ok(location.clone());
        }
        let loaded = self
            .publisher
            .register_service(project, location)
            .await
            .map_err(|e| ShipyardError::ActivationError(e.message))?;
        self.state
            .record_function_load(function, deployment_id, &loaded)
            .await?;
        Ok(loaded)
    }

    /// Reload the bundle a binding served before a failed activation
    async fn restore_function(&self, project: &Project, binding: &HostnameBinding) {
        let Some(previous) = &binding.value else {
            return;
        };
        if !matches!(previous.target, ArtifactLocation::Service { .. }) {
            return;
        }
        if let Err(e) = self
            .ensure_loaded(project, &previous.deployment_id, &previous.target)
            .await
        {
            error!(
                "Unable to reload {} for {} after a failed activation: {}",
                previous.deployment_id, binding.hostname, e
            );
        }
    }

    /// Rewrite every edge mapping from the durable bindings
    pub async fn resync(&self) -> ResyncReport {
        let mut report = ResyncReport::default();
        for binding in self.state.list_bindings().await {
            let _host = self.lock_hostname(&binding.hostname).await;
            // re-read under the lock, an activation may have finished meanwhile
            let Some(binding) = self.state.get_binding(&binding.hostname).await else {
                continue;
            };
            match self.write_edge(&binding.hostname, binding.value.as_ref()).await {
                Ok(()) if binding.value.is_some() => report.mapped += 1,
                Ok(()) => report.cleared += 1,
                Err(e) => {
                    warn!("Unable to resync {}: {}", binding.hostname, e);
                    report.failed.push(binding.hostname.clone());
                }
            }
        }
        info!(
            "Edge resync: {} mapped, {} cleared, {} failed",
            report.mapped,
            report.cleared,
            report.failed.len()
        );
        report
    }

    /// Mark a deployment PURGED unless it is pinned or being activated
    pub async fn purge_if_unpinned(&self, deployment_id: &str) -> Result<Option<Deployment>, ShipyardError> {
        let activating = self.activating.clone();
        self.state
            .purge_if_unpinned(deployment_id, move |id| activating.contains(id))
            .await
    }

    async fn write_edge(&self, hostname: &str, value: Option<&BindingValue>) -> Result<(), ShipyardError> {
        let label = format!("edge mapping {}", hostname);
        let timeout = self.options.call_timeout;
        retry_with_backoff(&self.options.retry, &label, |_| async move {
            let call = async {
                match value {
                    Some(value) => self.edge.set_mapping(hostname, value).await,
                    None => self.edge.delete_mapping(hostname).await,
                }
            };
            match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Transient(format!("timed out after {:?}", timeout))),
            }
        })
        .await
        .map_err(|e| ShipyardError::ActivationError(format!("edge update for {} failed: {}", hostname, e)))
    }
}

fn check_activatable(binding: &HostnameBinding, deployment: &Deployment) -> Result<(), ShipyardError> {
    if deployment.project_id != binding.project_id {
        return Err(ShipyardError::Conflict(format!(
            "deployment {} belongs to project {}, {} is bound to {}",
            deployment.id, deployment.project_id, binding.hostname, binding.project_id
        )));
    }
    if deployment.role != binding.role {
        return Err(ShipyardError::Conflict(format!(
            "deployment {} was built for {}, {} serves {}",
            deployment.id, deployment.role, binding.hostname, binding.role
        )));
    }
    match deployment.status {
        DeploymentStatus::Active => Ok(()),
        DeploymentStatus::Purged => Err(ShipyardError::ActivationError(format!(
            "deployment {} was purged and can no longer be activated",
            deployment.id
        ))),
        status => Err(ShipyardError::ActivationError(format!(
            "deployment {} is {}, only ACTIVE deployments can be activated",
            deployment.id, status
        ))),
    }
}
