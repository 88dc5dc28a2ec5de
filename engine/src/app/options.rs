//! Application configuration options

use std::time::Duration;

use crate::deploy::executor::ExecutorOptions;
use crate::publish::publisher::PublisherOptions;
use crate::retention::sweeper::SweeperOptions;
use crate::routing::directory::DirectoryOptions;
use crate::scheduler::dispatch::SchedulerOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::RetryOptions;
use crate::workers::{reaper, sweeper};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Settings the collaborators are built from
    pub settings: Settings,

    /// Enable the HTTP control API
    pub enable_server: bool,

    /// Enable the retention sweeper worker
    pub enable_sweeper: bool,

    /// Server configuration
    pub server: ServerOptions,

    pub scheduler: SchedulerOptions,

    pub executor: ExecutorOptions,

    pub publisher: PublisherOptions,

    pub directory: DirectoryOptions,

    pub retention: SweeperOptions,

    /// Lease reaper worker options
    pub reaper_worker: reaper::Options,

    /// Retention sweeper worker options
    pub sweeper_worker: sweeper::Options,

    /// Retry policy of completion notifications
    pub notify_retry: RetryOptions,
}

impl AppOptions {
    pub fn from_settings(layout: StorageLayout, settings: Settings) -> Self {
        let call_timeout = Duration::from_secs(settings.timeouts.remote_secs);
        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            enable_server: true,
            enable_sweeper: true,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            scheduler: SchedulerOptions::from(&settings),
            executor: ExecutorOptions::from(&settings),
            publisher: PublisherOptions {
                call_timeout,
                ..Default::default()
            },
            directory: DirectoryOptions {
                call_timeout,
                ..Default::default()
            },
            retention: SweeperOptions::from(&settings),
            reaper_worker: reaper::Options {
                interval: Duration::from_secs(settings.lease.reaper_interval_secs),
            },
            sweeper_worker: sweeper::Options {
                interval: Duration::from_secs(settings.retention.interval_secs),
                ..Default::default()
            },
            notify_retry: RetryOptions::default(),
            settings,
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(StorageLayout::default(), Settings::default())
    }
}

/// Lifecycle options for the engine
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8470,
        }
    }
}
