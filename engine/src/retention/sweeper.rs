//! Retention sweeper
//!
//! Per project, every ACTIVE deployment outside the keep set loses its
//! artifact bytes and becomes PURGED. The keep set is the newest
//! `keep_recent` ACTIVE deployments, everything pinned by a binding or a
//! project pointer, and anything with an activation in flight. The row and
//! its logs stay.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::dependency::{CacheLimits, DependencyCache};
use crate::errors::ShipyardError;
use crate::models::deployment::{Deployment, DeploymentStatus};
use crate::publish::publisher::ArtifactPublisher;
use crate::routing::directory::ActivationDirectory;
use crate::storage::settings::Settings;
use crate::storage::state::StateStore;

/// Sweeper options
#[derive(Debug, Clone)]
pub struct SweeperOptions {
    /// Most recent ACTIVE deployments always kept per project
    pub keep_recent: usize,
    pub cache_limits: CacheLimits,
}

impl From<&Settings> for SweeperOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            keep_recent: settings.retention.keep_recent,
            cache_limits: CacheLimits::from(&settings.cache),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub projects: usize,
    /// Deployments marked PURGED
    pub purged: Vec<String>,
    /// ACTIVE deployments kept
    pub kept: usize,
    pub deleted_objects: u64,
    /// Purged deployments whose bytes were deleted, including retries of
    /// earlier sweeps
    pub reclaimed: Vec<String>,
    /// Purged deployments whose bytes could not be deleted; retried next sweep
    pub failed: Vec<String>,
    pub evicted_cache_entries: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.projects += other.projects;
        self.purged.extend(other.purged);
        self.kept += other.kept;
        self.deleted_objects += other.deleted_objects;
        self.reclaimed.extend(other.reclaimed);
        self.failed.extend(other.failed);
        self.evicted_cache_entries += other.evicted_cache_entries;
    }
}

pub struct RetentionSweeper {
    state: Arc<StateStore>,
    directory: Arc<ActivationDirectory>,
    publisher: Arc<ArtifactPublisher>,
    cache: Option<Arc<DependencyCache>>,
    options: SweeperOptions,
}

impl RetentionSweeper {
    pub fn new(
        state: Arc<StateStore>,
        directory: Arc<ActivationDirectory>,
        publisher: Arc<ArtifactPublisher>,
        cache: Option<Arc<DependencyCache>>,
        options: SweeperOptions,
    ) -> Self {
        Self {
            state,
            directory,
            publisher,
            cache,
            options,
        }
    }

    /// Sweep every project, then evict stale dependency cache entries
    pub async fn sweep_all(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for project in self.state.list_projects().await {
            match self.sweep_project(&project.id).await {
                Ok(project_report) => report.merge(project_report),
                Err(e) => error!("Retention sweep of project {} failed: {}", project.slug, e),
            }
        }

        if let Some(cache) = &self.cache {
            match cache.evict(&self.options.cache_limits).await {
                Ok(evicted) => report.evicted_cache_entries = evicted.len(),
                Err(e) => warn!("Dependency cache eviction failed: {}", e),
            }
        }

        info!(
            "Retention sweep: {} projects, {} purged, {} kept, {} objects deleted",
            report.projects,
            report.purged.len(),
            report.kept,
            report.deleted_objects
        );
        report
    }

    pub async fn sweep_project(&self, project_id: &str) -> Result<SweepReport, ShipyardError> {
        if self.state.get_project(project_id).await.is_none() {
            return Err(ShipyardError::NotFound(format!("project {}", project_id)));
        }
        let mut report = SweepReport {
            projects: 1,
            ..Default::default()
        };

        {
            // hold the project's hostnames so no binding moves mid-decision;
            // sorted order keeps concurrent sweeps from deadlocking
            let mut hostnames: Vec<String> = self
                .state
                .list_bindings()
                .await
                .into_iter()
                .filter(|b| b.project_id == project_id)
                .map(|b| b.hostname)
                .collect();
            hostnames.sort();
            let mut guards = Vec::with_capacity(hostnames.len());
            for hostname in &hostnames {
                guards.push(self.directory.lock_hostname(hostname).await);
            }

            let deployments = self.state.list_deployments(project_id).await;
            let active = deployments
                .iter()
                .filter(|d| d.status == DeploymentStatus::Active)
                .count();
            report.kept = active.min(self.options.keep_recent);
            let candidates = purge_candidates(deployments, self.options.keep_recent);

            for candidate in candidates {
                match self.directory.purge_if_unpinned(&candidate.id).await {
                    Ok(Some(deployment)) => report.purged.push(deployment.id),
                    Ok(None) => report.kept += 1,
                    Err(e) => warn!("Unable to purge deployment {}: {}", candidate.id, e),
                }
            }
        }

        // bytes go after the status flip, outside the hostname locks. Deletes
        // that failed in an earlier sweep are picked up again here.
        let unreclaimed = pending_reclaim(self.state.list_deployments(project_id).await);
        for deployment in unreclaimed {
            let deleted = match &deployment.artifact {
                Some(location) => self.publisher.delete(location).await,
                None => Ok(0),
            };
            match deleted {
                Ok(count) => {
                    if let Err(e) = self.state.mark_bytes_reclaimed(&deployment.id).await {
                        warn!("Unable to record reclaimed bytes of {}: {}", deployment.id, e);
                    }
                    report.deleted_objects += count;
                    report.reclaimed.push(deployment.id.clone());
                    info!("Purged deployment {} ({} objects)", deployment.id, count);
                }
                Err(e) => {
                    error!("Deployment {} is PURGED but its bytes remain: {}", deployment.id, e);
                    report.failed.push(deployment.id.clone());
                }
            }
        }
        Ok(report)
    }
}

/// PURGED deployments whose artifact bytes are still stored
pub fn pending_reclaim(deployments: Vec<Deployment>) -> Vec<Deployment> {
    deployments
        .into_iter()
        .filter(|d| d.status == DeploymentStatus::Purged && !d.bytes_reclaimed)
        .collect()
}

/// ACTIVE deployments beyond the `keep_recent` newest ones, newest first.
/// Pins are checked later, atomically with the purge.
pub fn purge_candidates(deployments: Vec<Deployment>, keep_recent: usize) -> Vec<Deployment> {
    let mut active: Vec<Deployment> = deployments
        .into_iter()
        .filter(|d| d.status == DeploymentStatus::Active)
        .collect();
    active.sort_by(|a, b| {
        let a_at = a.activated_at.unwrap_or(a.created_at);
        let b_at = b.activated_at.unwrap_or(b.created_at);
        b_at.cmp(&a_at)
    });
    active.into_iter().skip(keep_recent).collect()
}
