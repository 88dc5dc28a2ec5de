//! Telemetry and metrics collection

use std::collections::BTreeMap;

use serde::Serialize;
use sysinfo::{Disks, System};

use crate::app::state::AppState;
use crate::scheduler::queue::QueueDepth;

/// Host metrics
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    /// CPU usage percentage (0-100)
    pub cpu_usage: f32,

    /// Memory usage in bytes
    pub memory_used: u64,

    /// Total memory in bytes
    pub memory_total: u64,

    /// Memory usage percentage
    pub memory_percent: f32,

    /// Disk usage in bytes
    pub disk_used: u64,

    /// Total disk space in bytes
    pub disk_total: u64,

    /// Disk usage percentage
    pub disk_percent: f32,

    /// System uptime in seconds
    pub uptime_secs: u64,

    /// Number of CPU cores
    pub cpu_count: usize,

    pub hostname: String,
}

/// Collect host metrics
pub fn collect_metrics() -> SystemMetrics {
    let mut sys = System::new_all();
    sys.refresh_all();

    let disks = Disks::new_with_refreshed_list();
    let (disk_used, disk_total) = disks.iter().fold((0u64, 0u64), |(used, total), disk| {
        (
            used + disk.total_space().saturating_sub(disk.available_space()),
            total + disk.total_space(),
        )
    });

    let memory_used = sys.used_memory();
    let memory_total = sys.total_memory();

    SystemMetrics {
        cpu_usage: sys.global_cpu_usage(),
        memory_used,
        memory_total,
        memory_percent: percent(memory_used, memory_total),
        disk_used,
        disk_total,
        disk_percent: percent(disk_used, disk_total),
        uptime_secs: System::uptime(),
        cpu_count: sys.cpus().len(),
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
    }
}

fn percent(used: u64, total: u64) -> f32 {
    if total > 0 {
        (used as f32 / total as f32) * 100.0
    } else {
        0.0
    }
}

/// Engine metrics
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    pub system: SystemMetrics,

    pub version: String,

    /// Deployments waiting for a worker, per priority class
    pub queue: QueueDepth,

    /// Deployments being run by this process
    pub running: usize,

    pub projects: usize,

    pub bindings: usize,

    /// Deployment count per status
    pub deployments: BTreeMap<String, usize>,

    pub cache_entries: usize,

    pub cache_bytes: u64,
}

/// Collect host and engine metrics
pub async fn collect_engine_metrics(app: &AppState) -> EngineMetrics {
    let system = tokio::task::spawn_blocking(collect_metrics)
        .await
        .unwrap_or_else(|_| SystemMetrics {
            cpu_usage: 0.0,
            memory_used: 0,
            memory_total: 0,
            memory_percent: 0.0,
            disk_used: 0,
            disk_total: 0,
            disk_percent: 0.0,
            uptime_secs: 0,
            cpu_count: 0,
            hostname: "unknown".to_string(),
        });

    let (projects, bindings, deployments) = app
        .state
        .read(|data| {
            let mut by_status = BTreeMap::new();
            for deployment in data.deployments.values() {
                *by_status.entry(deployment.status.to_string()).or_insert(0) += 1;
            }
            (data.projects.len(), data.bindings.len(), by_status)
        })
        .await;

    EngineMetrics {
        system,
        version: app.version.clone(),
        queue: app.scheduler.queue_depth(),
        running: app.scheduler.running_count(),
        projects,
        bindings,
        deployments,
        cache_entries: app.cache.len(),
        cache_bytes: app.cache.total_bytes(),
    }
}
