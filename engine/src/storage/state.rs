//! Durable engine state: projects, deployments and hostname bindings
//!
//! Every mutation runs against a copy of the snapshot, is persisted with an
//! atomic file replace, and only then becomes visible. A failed write leaves
//! the previous state untouched.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm};
use crate::errors::ShipyardError;
use crate::filesys::file::File;
use crate::models::binding::{ArtifactLocation, BindingValue, HostnameBinding};
use crate::models::deployment::{Deployment, DeploymentStatus, Lease};
use crate::models::project::Project;
use crate::utils::generate_uuid;

/// Everything the engine must remember across restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,

    #[serde(default)]
    pub deployments: BTreeMap<String, Deployment>,

    #[serde(default)]
    pub bindings: BTreeMap<String, HostnameBinding>,

    /// Runtime function name -> deployment whose bundle it currently runs
    #[serde(default)]
    pub functions: BTreeMap<String, String>,
}

impl StateSnapshot {
    /// Deployments referenced by any binding or project active pointer
    pub fn pinned(&self) -> HashSet<String> {
        let from_bindings = self
            .bindings
            .values()
            .filter_map(|b| b.active_deployment.clone());
        let from_projects = self.projects.values().flat_map(|p| {
            [p.active_production.clone(), p.active_staging.clone()]
                .into_iter()
                .flatten()
        });
        from_bindings.chain(from_projects).collect()
    }

    fn deployment_mut(&mut self, id: &str) -> Result<&mut Deployment, ShipyardError> {
        self.deployments
            .get_mut(id)
            .ok_or_else(|| ShipyardError::NotFound(format!("deployment {}", id)))
    }
}

/// Who is asking for a transition
#[derive(Debug, Clone, Copy)]
pub enum Authority<'a> {
    /// The worker holding the lease with this token
    Worker { token: &'a str },
    /// An explicit cancel request
    Canceller,
    /// The retention sweeper
    Sweeper,
    /// The lease reaper, acting on an expired lease
    Reaper,
}

/// Durable state store
pub struct StateStore {
    file: Option<File>,
    data: RwLock<StateSnapshot>,
}

impl StateStore {
    /// Create a store that is never persisted
    pub fn in_memory() -> Self {
        Self {
            file: None,
            data: RwLock::new(StateSnapshot::default()),
        }
    }

    /// Open (or create) a store persisted to `file`
    pub async fn open(file: File) -> Result<Self, ShipyardError> {
        let snapshot = if file.exists().await {
            file.read_json::<StateSnapshot>().await?
        } else {
            StateSnapshot::default()
        };
        info!(
            "Loaded state: {} projects, {} deployments, {} bindings",
            snapshot.projects.len(),
            snapshot.deployments.len(),
            snapshot.bindings.len()
        );
        Ok(Self {
            file: Some(file),
            data: RwLock::new(snapshot),
        })
    }

    /// Read from the current snapshot
    pub async fn read<R>(&self, f: impl FnOnce(&StateSnapshot) -> R) -> R {
        let data = self.data.read().await;
        f(&data)
    }

    /// Apply a mutation transactionally
    pub async fn mutate<R>(
        &self,
        f: impl FnOnce(&mut StateSnapshot) -> Result<R, ShipyardError>,
    ) -> Result<R, ShipyardError> {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        let result = f(&mut next)?;
        if let Some(file) = &self.file {
            file.write_json(&next).await?;
        }
        *data = next;
        Ok(result)
    }

    // ================================ PROJECTS ================================ //

    /// Insert or replace a project; slugs stay globally unique
    pub async fn upsert_project(&self, project: Project) -> Result<Project, ShipyardError> {
        self.mutate(|data| {
            if let Some(other) = data
                .projects
                .values()
                .find(|p| p.slug == project.slug && p.id != project.id)
            {
                return Err(ShipyardError::Conflict(format!(
                    "slug {} is already used by project {}",
                    project.slug, other.id
                )));
            }
            let mut project = project;
            // active pointers are owned by the activation protocol
            if let Some(existing) = data.projects.get(&project.id) {
                project.active_production = existing.active_production.clone();
                project.active_staging = existing.active_staging.clone();
                project.created_at = existing.created_at;
            }
            data.projects.insert(project.id.clone(), project.clone());
            Ok(project)
        })
        .await
    }

    pub async fn get_project(&self, id: &str) -> Option<Project> {
        self.read(|data| data.projects.get(id).cloned()).await
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        self.read(|data| data.projects.values().cloned().collect()).await
    }

    // ============================== DEPLOYMENTS =============================== //

    pub async fn get_deployment(&self, id: &str) -> Option<Deployment> {
        self.read(|data| data.deployments.get(id).cloned()).await
    }

    /// Deployments of a project, newest first
    pub async fn list_deployments(&self, project_id: &str) -> Vec<Deployment> {
        self.read(|data| {
            let mut deployments: Vec<Deployment> = data
                .deployments
                .values()
                .filter(|d| d.project_id == project_id)
                .cloned()
                .collect();
            deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            deployments
        })
        .await
    }

    /// Queued deployments, oldest first
    pub async fn queued_deployments(&self) -> Vec<Deployment> {
        self.read(|data| {
            let mut queued: Vec<Deployment> = data
                .deployments
                .values()
                .filter(|d| d.status == DeploymentStatus::Queued)
                .cloned()
                .collect();
            queued.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            queued
        })
        .await
    }

    /// Insert `deployment` unless a non-terminal deployment already exists for
    /// its (project, revision, role). Returns the stored deployment and
    /// whether it was newly created.
    pub async fn insert_or_get(
        &self,
        deployment: Deployment,
    ) -> Result<(Deployment, bool), ShipyardError> {
        self.mutate(|data| {
            if !data.projects.contains_key(&deployment.project_id) {
                return Err(ShipyardError::NotFound(format!(
                    "project {}",
                    deployment.project_id
                )));
            }
            let existing = data.deployments.values().find(|d| {
                !d.status.is_terminal()
                    && d.matches_key(&deployment.project_id, &deployment.revision.commit, deployment.role)
            });
            if let Some(existing) = existing {
                debug!(
                    "Deployment for {}@{} ({}) already in flight: {}",
                    existing.project_id, existing.revision.commit, existing.role, existing.id
                );
                return Ok((existing.clone(), false));
            }
            data.deployments
                .insert(deployment.id.clone(), deployment.clone());
            Ok((deployment, true))
        })
        .await
    }

    /// Take ownership of a queued deployment and move it to CLONING
    pub async fn claim(
        &self,
        id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<(Deployment, Lease), ShipyardError> {
        self.mutate(|data| {
            let deployment = data.deployment_mut(id)?;
            if deployment.status != DeploymentStatus::Queued {
                return Err(ShipyardError::LeaseError(format!(
                    "deployment {} is {}, not claimable",
                    id, deployment.status
                )));
            }
            apply_event(deployment, DeploymentEvent::StartClone)?;
            let lease = Lease {
                worker_id: worker_id.to_string(),
                token: generate_uuid(),
                expires_at: Utc::now() + to_chrono(ttl),
            };
            deployment.lease = Some(lease.clone());
            deployment.started_at = Some(Utc::now());
            Ok((deployment.clone(), lease))
        })
        .await
    }

    /// Extend a lease; fails once the lease was lost
    pub async fn renew_lease(
        &self,
        id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<Lease, ShipyardError> {
        self.mutate(|data| {
            let deployment = data.deployment_mut(id)?;
            check_lease(deployment, token)?;
            let lease = deployment
                .lease
                .as_mut()
                .ok_or_else(|| ShipyardError::LeaseError(format!("deployment {} has no lease", id)))?;
            lease.expires_at = Utc::now() + to_chrono(ttl);
            Ok(lease.clone())
        })
        .await
    }

    /// Transition a deployment, applying `update` in the same write
    pub async fn transition(
        &self,
        id: &str,
        authority: Authority<'_>,
        event: DeploymentEvent,
        update: impl FnOnce(&mut Deployment),
    ) -> Result<Deployment, ShipyardError> {
        self.mutate(|data| {
            let deployment = data.deployment_mut(id)?;
            authorize(deployment, authority, &event, Utc::now())?;
            apply_event(deployment, event)?;
            update(deployment);
            Ok(deployment.clone())
        })
        .await
    }

    /// Durably mark a running deployment as cancelled so that its worker can
    /// no longer complete it. Returns the deployment as it stands.
    pub async fn request_cancel(&self, id: &str) -> Result<Deployment, ShipyardError> {
        self.mutate(|data| {
            let deployment = data.deployment_mut(id)?;
            if deployment.status.is_running() {
                deployment.cancel_requested = true;
            }
            Ok(deployment.clone())
        })
        .await
    }

    pub async fn mark_bytes_reclaimed(&self, id: &str) -> Result<(), ShipyardError> {
        self.mutate(|data| {
            data.deployment_mut(id)?.bytes_reclaimed = true;
            Ok(())
        })
        .await
    }

    /// Running deployments whose lease expired (or never existed)
    pub async fn expired_leases(&self, now: DateTime<Utc>) -> Vec<Deployment> {
        self.read(|data| {
            data.deployments
                .values()
                .filter(|d| d.status.is_running())
                .filter(|d| d.lease.as_ref().is_none_or(|l| l.is_expired(now)))
                .cloned()
                .collect()
        })
        .await
    }

    // ================================ BINDINGS ================================ //

    /// Create or reconfigure a binding, keeping its current activation
    pub async fn upsert_binding(
        &self,
        binding: HostnameBinding,
    ) -> Result<HostnameBinding, ShipyardError> {
        self.mutate(|data| {
            if !data.projects.contains_key(&binding.project_id) {
                return Err(ShipyardError::NotFound(format!("project {}", binding.project_id)));
            }
            let mut binding = binding;
            if let Some(existing) = data.bindings.get(&binding.hostname) {
                if existing.project_id != binding.project_id {
                    return Err(ShipyardError::Conflict(format!(
                        "hostname {} is bound to project {}",
                        binding.hostname, existing.project_id
                    )));
                }
                if existing.role == binding.role {
                    binding.active_deployment = existing.active_deployment.clone();
                    binding.value = existing.value.clone();
                }
            }
            data.bindings.insert(binding.hostname.clone(), binding.clone());
            Ok(binding)
        })
        .await
    }

    pub async fn get_binding(&self, hostname: &str) -> Option<HostnameBinding> {
        self.read(|data| data.bindings.get(hostname).cloned()).await
    }

    pub async fn list_bindings(&self) -> Vec<HostnameBinding> {
        self.read(|data| data.bindings.values().cloned().collect()).await
    }

    /// Point a binding (and its project's role pointer) at a deployment.
    ///
    /// The deployment must still be ACTIVE; this is the durable source of
    /// truth the edge mapping is derived from.
    pub async fn set_binding_active(
        &self,
        hostname: &str,
        value: BindingValue,
    ) -> Result<HostnameBinding, ShipyardError> {
        self.mutate(|data| {
            let deployment = data
                .deployments
                .get(&value.deployment_id)
                .ok_or_else(|| ShipyardError::NotFound(format!("deployment {}", value.deployment_id)))?;
            if deployment.status != DeploymentStatus::Active {
                return Err(ShipyardError::ActivationError(format!(
                    "deployment {} is {}, only ACTIVE deployments can be activated",
                    deployment.id, deployment.status
                )));
            }
            let role = deployment.role;
            let project_id = deployment.project_id.clone();

            let binding = data
                .bindings
                .get_mut(hostname)
                .ok_or_else(|| ShipyardError::NotFound(format!("binding {}", hostname)))?;
            binding.active_deployment = Some(value.deployment_id.clone());
            binding.value = Some(value.clone());
            let binding = binding.clone();

            if let Some(project) = data.projects.get_mut(&project_id) {
                project.set_active_pointer(role, Some(value.deployment_id.clone()));
            }
            Ok(binding)
        })
        .await
    }

    /// Clear a binding's activation. The project pointer is cleared too when
    /// no other binding of the same project and role still references it.
    pub async fn clear_binding(&self, hostname: &str) -> Result<HostnameBinding, ShipyardError> {
        self.mutate(|data| {
            let binding = data
                .bindings
                .get_mut(hostname)
                .ok_or_else(|| ShipyardError::NotFound(format!("binding {}", hostname)))?;
            let previous = binding.active_deployment.take();
            binding.value = None;
            let binding = binding.clone();

            if let Some(previous) = previous {
                let still_bound = data.bindings.values().any(|b| {
                    b.project_id == binding.project_id
                        && b.role == binding.role
                        && b.active_deployment.as_deref() == Some(previous.as_str())
                });
                if let Some(project) = data.projects.get_mut(&binding.project_id) {
                    if !still_bound && project.active_pointer(binding.role) == Some(previous.as_str()) {
                        project.set_active_pointer(binding.role, None);
                    }
                }
            }
            Ok(binding)
        })
        .await
    }

    /// Remove a binding entirely
    pub async fn remove_binding(&self, hostname: &str) -> Result<Option<HostnameBinding>, ShipyardError> {
        self.clear_binding(hostname).await?;
        self.mutate(|data| Ok(data.bindings.remove(hostname))).await
    }

    // ================================ RETENTION =============================== //

    /// Mark a deployment PURGED unless it is pinned or `is_protected` says so.
    ///
    /// Both checks and the status change happen under the state write lock,
    /// so a concurrent activation either sees PURGED or is seen as protected.
    pub async fn purge_if_unpinned(
        &self,
        id: &str,
        is_protected: impl Fn(&str) -> bool,
    ) -> Result<Option<Deployment>, ShipyardError> {
        self.mutate(|data| {
            if is_protected(id) || data.pinned().contains(id) {
                return Ok(None);
            }
            let deployment = data.deployment_mut(id)?;
            if deployment.status != DeploymentStatus::Active {
                return Ok(None);
            }
            authorize(deployment, Authority::Sweeper, &DeploymentEvent::Purge, Utc::now())?;
            apply_event(deployment, DeploymentEvent::Purge)?;
            Ok(Some(deployment.clone()))
        })
        .await
    }

    // ================================ RUNTIME ================================= //

    /// Deployment whose bundle a runtime function currently runs
    pub async fn function_deployment(&self, function: &str) -> Option<String> {
        self.read(|data| data.functions.get(function).cloned()).await
    }

    /// Record that `function` now runs the bundle of `deployment_id`, along
    /// with the endpoint the runtime gave it
    pub async fn record_function_load(
        &self,
        function: &str,
        deployment_id: &str,
        loaded: &ArtifactLocation,
    ) -> Result<(), ShipyardError> {
        self.mutate(|data| {
            data.functions
                .insert(function.to_string(), deployment_id.to_string());
            if let Some(deployment) = data.deployments.get_mut(deployment_id) {
                deployment.artifact = Some(loaded.clone());
            }
            Ok(())
        })
        .await
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn check_lease(deployment: &Deployment, token: &str) -> Result<(), ShipyardError> {
    match &deployment.lease {
        Some(lease) if lease.token == token && !deployment.status.is_terminal() => Ok(()),
        _ => Err(ShipyardError::LeaseError(format!(
            "lease on deployment {} is not held by this worker",
            deployment.id
        ))),
    }
}

fn authorize(
    deployment: &Deployment,
    authority: Authority<'_>,
    event: &DeploymentEvent,
    now: DateTime<Utc>,
) -> Result<(), ShipyardError> {
    let allowed = match (authority, event) {
        (Authority::Worker { .. }, DeploymentEvent::Complete) if deployment.cancel_requested => {
            return Err(ShipyardError::Conflict(format!(
                "deployment {} was cancelled before it completed",
                deployment.id
            )));
        }
        (Authority::Worker { token }, _) => return check_lease(deployment, token),
        (Authority::Canceller, DeploymentEvent::Cancel) => true,
        (Authority::Sweeper, DeploymentEvent::Purge) => true,
        (Authority::Reaper, DeploymentEvent::Fail(_)) => {
            deployment.status.is_running()
                && deployment.lease.as_ref().is_none_or(|l| l.is_expired(now))
        }
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(ShipyardError::TransitionError(format!(
            "{:?} may not apply {:?} to deployment {} ({})",
            authority, event, deployment.id, deployment.status
        )))
    }
}

fn apply_event(deployment: &mut Deployment, event: DeploymentEvent) -> Result<(), ShipyardError> {
    let mut fsm = DeploymentFsm::resume(deployment.status, deployment.error.take());
    let result = fsm.process(event);
    let (status, error) = fsm.into_parts();
    deployment.status = status;
    deployment.error = error;
    result.map_err(ShipyardError::TransitionError)?;

    let now = Utc::now();
    if status == DeploymentStatus::Active {
        deployment.activated_at = Some(now);
    }
    if status.is_terminal() && status != DeploymentStatus::Purged {
        deployment.lease = None;
        deployment.finished_at = Some(now);
    }
    Ok(())
}
