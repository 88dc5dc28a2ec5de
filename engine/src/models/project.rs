//! Project models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ShipyardError;
use crate::models::deployment::RoutingRole;

/// A per-project build command override.
///
/// Absent (or `null`) means "use the default", an empty string means
/// "intentionally skip this step", anything else is the command to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CommandSetting {
    #[default]
    Unset,
    Skip,
    Run(String),
}

impl CommandSetting {
    /// Resolve against a default; `None` means the step does not run
    pub fn resolve<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        match self {
            CommandSetting::Unset => default,
            CommandSetting::Skip => None,
            CommandSetting::Run(cmd) => Some(cmd.as_str()),
        }
    }
}

impl From<Option<String>> for CommandSetting {
    fn from(value: Option<String>) -> Self {
        match value {
            None => CommandSetting::Unset,
            Some(cmd) if cmd.trim().is_empty() => CommandSetting::Skip,
            Some(cmd) => CommandSetting::Run(cmd),
        }
    }
}

impl serde::Serialize for CommandSetting {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CommandSetting::Unset => serializer.serialize_none(),
            CommandSetting::Skip => serializer.serialize_str(""),
            CommandSetting::Run(cmd) => serializer.serialize_str(cmd),
        }
    }
}

impl<'de> serde::Deserialize<'de> for CommandSetting {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(CommandSetting::from(value))
    }
}

/// How the build output is served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Directory tree served from the object store
    #[default]
    Static,
    /// Bundle registered with the compute runtime
    Service,
}

/// Build configuration of a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub install_command: CommandSetting,

    #[serde(default)]
    pub build_command: CommandSetting,

    #[serde(default)]
    pub start_command: CommandSetting,

    #[serde(default)]
    pub runtime_version: Option<String>,

    /// Build output directory, relative to the source root
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default)]
    pub kind: ArtifactKind,

    /// Entry point a service bundle must contain, relative to `output_dir`
    #[serde(default)]
    pub entry_point: Option<String>,

    /// Files whose contents key the dependency cache
    #[serde(default = "default_dependency_manifests")]
    pub dependency_manifests: Vec<String>,

    /// Directory produced by the install step
    #[serde(default = "default_dependency_dir")]
    pub dependency_dir: String,
}

fn default_output_dir() -> String {
    "dist".to_string()
}

fn default_dependency_manifests() -> Vec<String> {
    vec!["package-lock.json".to_string(), "package.json".to_string()]
}

fn default_dependency_dir() -> String {
    "node_modules".to_string()
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            install_command: CommandSetting::Unset,
            build_command: CommandSetting::Unset,
            start_command: CommandSetting::Unset,
            runtime_version: None,
            output_dir: default_output_dir(),
            kind: ArtifactKind::Static,
            entry_point: None,
            dependency_manifests: default_dependency_manifests(),
            dependency_dir: default_dependency_dir(),
        }
    }
}

impl BuildConfig {
    /// Reject configurations that cannot produce an artifact
    pub fn validate(&self) -> Result<(), ShipyardError> {
        validate_relative_path("output_dir", &self.output_dir)?;
        validate_relative_path("dependency_dir", &self.dependency_dir)?;
        if let Some(entry) = &self.entry_point {
            validate_relative_path("entry_point", entry)?;
        }
        for manifest in &self.dependency_manifests {
            validate_relative_path("dependency_manifests", manifest)?;
        }

        if self.kind == ArtifactKind::Service
            && !matches!(self.start_command, CommandSetting::Run(_))
        {
            return Err(ShipyardError::ConfigError(
                "service projects require a start_command".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_relative_path(field: &str, path: &str) -> Result<(), ShipyardError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(ShipyardError::ConfigError(format!("{} must not be empty", field)));
    }
    if trimmed.starts_with('/') || trimmed.split('/').any(|part| part == "..") {
        return Err(ShipyardError::ConfigError(format!(
            "{} must be a relative path inside the repository: {}",
            field, path
        )));
    }
    Ok(())
}

/// A deployable unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,

    /// Globally unique; names artifact paths and default hostnames
    pub slug: String,

    pub repo_url: String,

    /// Branch whose webhook pushes deploy to production
    #[serde(default = "default_production_branch")]
    pub production_branch: String,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub active_production: Option<String>,

    #[serde(default)]
    pub active_staging: Option<String>,

    pub created_at: DateTime<Utc>,
}

fn default_production_branch() -> String {
    "main".to_string()
}

impl Project {
    pub fn active_pointer(&self, role: RoutingRole) -> Option<&str> {
        match role {
            RoutingRole::Production => self.active_production.as_deref(),
            RoutingRole::Staging => self.active_staging.as_deref(),
        }
    }

    pub fn set_active_pointer(&mut self, role: RoutingRole, deployment_id: Option<String>) {
        match role {
            RoutingRole::Production => self.active_production = deployment_id,
            RoutingRole::Staging => self.active_staging = deployment_id,
        }
    }

    /// Default hostname of a role under the platform domain
    pub fn default_hostname(&self, role: RoutingRole, domain: &str) -> String {
        match role {
            RoutingRole::Production => format!("{}.{}", self.slug, domain),
            RoutingRole::Staging => format!("{}-staging.{}", self.slug, domain),
        }
    }

    /// Routing role of a pushed branch
    pub fn role_for_branch(&self, branch: &str) -> RoutingRole {
        if branch == self.production_branch {
            RoutingRole::Production
        } else {
            RoutingRole::Staging
        }
    }

    /// Stable runtime function name of a service project
    pub fn function_name(&self, role: RoutingRole) -> String {
        format!("{}-{}", self.slug, role)
    }
}

/// Validate a project slug: lowercase alphanumerics and inner hyphens
pub fn validate_slug(slug: &str) -> Result<(), ShipyardError> {
    let valid_chars = slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if slug.is_empty() || slug.len() > 63 || !valid_chars || slug.starts_with('-') || slug.ends_with('-') {
        return Err(ShipyardError::ValidationError(format!("Invalid project slug: {}", slug)));
    }
    Ok(())
}
