//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::ShipyardError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// On-disk layout of the engine's data directory
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Durable projects, deployments and bindings
    pub fn state_file(&self) -> File {
        File::new(self.base_dir.join("state.json"))
    }

    /// Routing table of the local edge
    pub fn routes_file(&self) -> File {
        File::new(self.base_dir.join("routes.json"))
    }

    /// Get the dependency cache directory
    pub fn dependency_cache_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("cache").join("deps"))
    }

    /// Per-deployment build sandboxes
    pub fn workspaces_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("workspaces"))
    }

    /// Objects of the local object store
    pub fn objects_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("objects"))
    }

    /// Bundles loaded by the local compute runtime
    pub fn functions_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("functions"))
    }

    /// Durable per-deployment build logs
    pub fn deployment_logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deployment-logs"))
    }

    /// Get the engine logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), ShipyardError> {
        self.dependency_cache_dir().create().await?;
        self.workspaces_dir().create().await?;
        self.objects_dir().create().await?;
        self.functions_dir().create().await?;
        self.deployment_logs_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/shipyard");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shipyard");

        Self::new(base_dir)
    }
}
