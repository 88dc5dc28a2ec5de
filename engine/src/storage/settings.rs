//! Settings file management

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Write logs as JSON
    #[serde(default)]
    pub json_logs: bool,

    /// Also write a daily rolling log file
    #[serde(default)]
    pub log_to_file: bool,

    /// HTTP control API
    #[serde(default)]
    pub server: ServerSettings,

    /// Number of concurrent build workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Step and pipeline timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Worker leases
    #[serde(default)]
    pub lease: LeaseSettings,

    /// Artifact retention
    #[serde(default)]
    pub retention: RetentionSettings,

    /// Dependency cache limits
    #[serde(default)]
    pub cache: CacheSettings,

    /// Build sandbox
    #[serde(default)]
    pub sandbox: SandboxSettings,

    /// Where static artifacts and service bundles are stored
    #[serde(default)]
    pub object_store: BackendSettings,

    /// Where service artifacts run
    #[serde(default)]
    pub runtime: BackendSettings,

    /// Edge routing control plane
    #[serde(default)]
    pub edge: BackendSettings,

    /// Shared secret for webhook signatures
    #[serde(default, skip_serializing)]
    pub webhook_secret: Option<SecretString>,

    /// Completion notification target
    #[serde(default)]
    pub callback: Option<CallbackSettings>,

    /// Domain under which default hostnames are created
    #[serde(default = "default_platform_domain")]
    pub platform_domain: String,

    /// Commands used when a project leaves install/build unset
    #[serde(default)]
    pub defaults: CommandDefaults,
}

fn default_concurrency() -> usize {
    2
}

fn default_platform_domain() -> String {
    "shipyard.local".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            log_to_file: false,
            server: ServerSettings::default(),
            concurrency: default_concurrency(),
            timeouts: TimeoutSettings::default(),
            lease: LeaseSettings::default(),
            retention: RetentionSettings::default(),
            cache: CacheSettings::default(),
            sandbox: SandboxSettings::default(),
            object_store: BackendSettings::default(),
            runtime: BackendSettings::default(),
            edge: BackendSettings::default(),
            webhook_secret: None,
            callback: None,
            platform_domain: default_platform_domain(),
            defaults: CommandDefaults::default(),
        }
    }
}

/// HTTP server bind settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8470
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_fetch_secs")]
    pub fetch_secs: u64,

    #[serde(default = "default_install_secs")]
    pub install_secs: u64,

    #[serde(default = "default_build_secs")]
    pub build_secs: u64,

    /// Upper bound for a whole deployment, end to end
    #[serde(default = "default_pipeline_secs")]
    pub pipeline_secs: u64,

    /// Bound on each call to storage, runtime, edge or callback
    #[serde(default = "default_remote_secs")]
    pub remote_secs: u64,
}

fn default_fetch_secs() -> u64 {
    120
}

fn default_install_secs() -> u64 {
    600
}

fn default_build_secs() -> u64 {
    1800
}

fn default_pipeline_secs() -> u64 {
    45 * 60
}

fn default_remote_secs() -> u64 {
    30
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            fetch_secs: default_fetch_secs(),
            install_secs: default_install_secs(),
            build_secs: default_build_secs(),
            pipeline_secs: default_pipeline_secs(),
            remote_secs: default_remote_secs(),
        }
    }
}

/// Lease and cancellation timing in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSettings {
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// How often expired leases are looked for
    #[serde(default = "default_reaper_secs")]
    pub reaper_interval_secs: u64,

    /// How long a cancelled worker gets to unwind
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Attempts per (project, revision, role) before a lost worker fails it
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_lease_ttl_secs() -> u64 {
    30
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_reaper_secs() -> u64 {
    15
}

fn default_cancel_grace_secs() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    2
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            reaper_interval_secs: default_reaper_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Retention sweeper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// Most recent ACTIVE deployments kept per project
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,

    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
}

fn default_keep_recent() -> usize {
    3
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            keep_recent: default_keep_recent(),
            interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Dependency cache limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,

    #[serde(default = "default_cache_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_cache_max_entries() -> usize {
    64
}

fn default_cache_max_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_cache_max_age_secs() -> u64 {
    14 * 24 * 3600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
            max_age_secs: default_cache_max_age_secs(),
        }
    }
}

/// Build sandbox settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// CPU seconds per build step
    #[serde(default)]
    pub cpu_seconds: Option<u64>,

    /// Virtual memory limit in KiB per build step
    #[serde(default)]
    pub memory_kib: Option<u64>,

    /// Namespace wrapper prepended to each command, e.g. `["unshare", "-n"]`
    #[serde(default)]
    pub wrapper: Vec<String>,

    /// Environment variables passed into the cleared build environment
    #[serde(default)]
    pub pass_env: Vec<String>,
}

/// Kind of backend a collaborator talks to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process implementation backed by the data directory
    #[default]
    Local,
    /// Remote HTTP service
    Http,
}

/// Backend endpoint settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default)]
    pub kind: BackendKind,

    /// Base URL for HTTP backends
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token for HTTP backends
    #[serde(default, skip_serializing)]
    pub token: Option<SecretString>,
}

/// Completion notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSettings {
    pub url: String,

    #[serde(default, skip_serializing)]
    pub secret: Option<SecretString>,
}

/// Commands used for unset build settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDefaults {
    #[serde(default = "default_install_command")]
    pub install: String,

    #[serde(default = "default_build_command")]
    pub build: String,
}

fn default_install_command() -> String {
    "npm ci".to_string()
}

fn default_build_command() -> String {
    "npm run build".to_string()
}

impl Default for CommandDefaults {
    fn default() -> Self {
        Self {
            install: default_install_command(),
            build: default_build_command(),
        }
    }
}
