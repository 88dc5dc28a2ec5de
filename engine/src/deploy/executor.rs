//! Build executor
//!
//! Runs fetch, install, build and verify for one revision inside a
//! [`Sandbox`], consulting the dependency cache before installing.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::dependency::{manifest_digest, DependencyCache};
use crate::deploy::git::{FetchContext, SourceFetcher};
use crate::deploy::logstream::LogStream;
use crate::deploy::sandbox::{Sandbox, SandboxOptions, StepError};
use crate::errors::ShipyardError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{BuildStats, BuildStep, DeploymentError, FailureKind, SourceRevision};
use crate::models::project::{ArtifactKind, CommandSetting, Project};
use crate::storage::settings::Settings;
use crate::utils::{retry_with_backoff, Retryable, RetryOptions};

/// Build executor options
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub fetch_timeout: Duration,
    pub install_timeout: Duration,
    pub build_timeout: Duration,
    /// Output lines attached to a failed step
    pub log_tail_lines: usize,
    pub default_install: String,
    pub default_build: String,
    pub sandbox: SandboxOptions,
    pub fetch_retry: RetryOptions,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ExecutorOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            fetch_timeout: Duration::from_secs(settings.timeouts.fetch_secs),
            install_timeout: Duration::from_secs(settings.timeouts.install_secs),
            build_timeout: Duration::from_secs(settings.timeouts.build_secs),
            log_tail_lines: 40,
            default_install: settings.defaults.install.clone(),
            default_build: settings.defaults.build.clone(),
            sandbox: SandboxOptions::from(&settings.sandbox),
            fetch_retry: RetryOptions {
                max_attempts: 3,
                ..Default::default()
            },
        }
    }
}

/// Why a build stopped
#[derive(Debug)]
pub enum BuildInterrupt {
    Cancelled,
    Failed(DeploymentError),
}

impl From<DeploymentError> for BuildInterrupt {
    fn from(error: DeploymentError) -> Self {
        BuildInterrupt::Failed(error)
    }
}

/// A verified build output, ready to publish
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub output_dir: Dir,
    pub kind: ArtifactKind,
    pub stats: BuildStats,
}

struct FetchAttemptError(StepError);

impl Retryable for FetchAttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self.0, StepError::Exit { .. })
    }
}

impl std::fmt::Display for FetchAttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Runs the build steps of a deployment
pub struct BuildExecutor {
    options: ExecutorOptions,
    fetcher: Arc<dyn SourceFetcher>,
    cache: Arc<DependencyCache>,
    workspaces: Dir,
}

impl BuildExecutor {
    pub fn new(
        options: ExecutorOptions,
        fetcher: Arc<dyn SourceFetcher>,
        cache: Arc<DependencyCache>,
        workspaces: Dir,
    ) -> Self {
        Self {
            options,
            fetcher,
            cache,
            workspaces,
        }
    }

    /// Create the sandbox a deployment builds in
    pub async fn prepare(&self, deployment_id: &str, project: &Project) -> Result<Sandbox, ShipyardError> {
        let mut options = self.options.sandbox.clone();
        if let Some(version) = &project.build.runtime_version {
            options.env.push(("RUNTIME_VERSION".to_string(), version.clone()));
        }
        Sandbox::create(&self.workspaces, deployment_id, options).await
    }

    /// Step 1: fetch the exact revision, retrying transient failures
    pub async fn fetch(
        &self,
        sandbox: &Sandbox,
        project: &Project,
        revision: &SourceRevision,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<(), BuildInterrupt> {
        log.system(
            Some(BuildStep::Fetch),
            format!("Fetching {} ({})", revision.commit, revision.branch),
        )
        .await;

        let result = retry_with_backoff(&self.options.fetch_retry, "fetch", |attempt| async move {
            if attempt > 0 {
                let src = sandbox.source_dir();
                src.delete().await.map_err(|e| FetchAttemptError(StepError::Spawn(e.to_string())))?;
                src.create().await.map_err(|e| FetchAttemptError(StepError::Spawn(e.to_string())))?;
            }
            self.fetcher
                .fetch(FetchContext {
                    repo_url: &project.repo_url,
                    revision,
                    sandbox,
                    timeout: self.options.fetch_timeout,
                    log,
                    cancel,
                })
                .await
                .map_err(FetchAttemptError)
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(FetchAttemptError(StepError::Exit { code })) => Err(BuildInterrupt::Failed(
                DeploymentError::new(
                    FailureKind::Transient,
                    format!("Unable to fetch revision {}", revision.commit),
                )
                .at_step(BuildStep::Fetch)
                .with_exit_code(code)
                .with_log_tail(log.tail(self.options.log_tail_lines).await),
            )),
            Err(FetchAttemptError(e)) => Err(self.step_failure(BuildStep::Fetch, e, log).await),
        }
    }

    /// Steps 2 to 4: dependencies, build command, output verification
    pub async fn build(
        &self,
        sandbox: &Sandbox,
        project: &Project,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<BuildOutput, BuildInterrupt> {
        let config = &project.build;
        config.validate().map_err(|e| {
            DeploymentError::new(FailureKind::Configuration, e.to_string()).at_step(BuildStep::Install)
        })?;

        let cache_hit = self.install(sandbox, project, log, cancel).await?;

        let build_command = config
            .build_command
            .resolve(Some(self.options.default_build.as_str()));
        match build_command {
            Some(command) => {
                self.run_step(sandbox, BuildStep::Build, command, self.options.build_timeout, log, cancel)
                    .await?;
            }
            None => debug!("Build command is empty, skipping build step"),
        }

        let mut output = self.verify(sandbox, project, log).await?;
        output.stats.cache_hit = cache_hit;
        Ok(output)
    }

    /// Install dependencies, restoring from the cache when the manifests
    /// are unchanged. Returns whether the cache was hit.
    async fn install(
        &self,
        sandbox: &Sandbox,
        project: &Project,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<bool, BuildInterrupt> {
        let config = &project.build;
        let install_command = config
            .install_command
            .resolve(Some(self.options.default_install.as_str()));
        let Some(command) = install_command else {
            debug!("Install command is empty, skipping install step");
            return Ok(false);
        };

        let src = sandbox.source_dir();
        let dependency_dir = src.subdir(&config.dependency_dir);
        let digest = match manifest_digest(&src, &config.dependency_manifests).await {
            Ok(digest) => digest,
            Err(e) => {
                warn!("Unable to digest dependency manifests: {}", e);
                None
            }
        };

        if let Some(digest) = &digest {
            match self.cache.restore(digest, dependency_dir.path()).await {
                Ok(true) => {
                    log.system(
                        Some(BuildStep::Install),
                        format!("Restored dependencies from cache ({})", short(digest)),
                    )
                    .await;
                    return Ok(true);
                }
                Ok(false) => {
                    log.system(
                        Some(BuildStep::Install),
                        format!("No cached dependencies for {}", short(digest)),
                    )
                    .await;
                }
                Err(e) => {
                    warn!("Dependency cache restore failed, installing instead: {}", e);
                    let _ = dependency_dir.delete().await;
                }
            }
        }

        self.run_step(
            sandbox,
            BuildStep::Install,
            command,
            self.options.install_timeout,
            log,
            cancel,
        )
        .await?;

        if let Some(digest) = &digest {
            if dependency_dir.exists().await {
                match self.cache.put(digest, &dependency_dir).await {
                    Ok(entry) => info!("Cached dependencies {} ({} bytes)", short(digest), entry.size),
                    Err(e) => warn!("Unable to populate dependency cache: {}", e),
                }
            }
        }
        Ok(false)
    }

    async fn verify(
        &self,
        sandbox: &Sandbox,
        project: &Project,
        log: &LogStream,
    ) -> Result<BuildOutput, BuildInterrupt> {
        let config = &project.build;
        let output_dir = sandbox.source_dir().subdir(&config.output_dir);
        let missing = |message: String| {
            BuildInterrupt::Failed(
                DeploymentError::new(FailureKind::Build, message).at_step(BuildStep::Verify),
            )
        };

        if !output_dir.exists().await {
            return Err(missing(format!(
                "Build output directory {} does not exist",
                config.output_dir
            )));
        }
        let files = output_dir
            .walk_files()
            .await
            .map_err(|e| missing(format!("Unable to read build output: {}", e)))?;
        if files.is_empty() {
            return Err(missing(format!("Build output directory {} is empty", config.output_dir)));
        }

        if config.kind == ArtifactKind::Service {
            if !matches!(config.start_command, CommandSetting::Run(_)) {
                return Err(BuildInterrupt::Failed(
                    DeploymentError::new(
                        FailureKind::Configuration,
                        "service projects require a start_command",
                    )
                    .at_step(BuildStep::Verify),
                ));
            }
            if let Some(entry) = &config.entry_point {
                if !files.iter().any(|f| &f.relative == entry) {
                    return Err(missing(format!("Entry point {} not found in build output", entry)));
                }
            }
        }

        let stats = BuildStats {
            file_count: files.len() as u64,
            byte_count: files.iter().map(|f| f.size).sum(),
            cache_hit: false,
        };
        log.system(
            Some(BuildStep::Verify),
            format!("Output verified: {} files, {} bytes", stats.file_count, stats.byte_count),
        )
        .await;

        Ok(BuildOutput {
            output_dir,
            kind: config.kind,
            stats,
        })
    }

    async fn run_step(
        &self,
        sandbox: &Sandbox,
        step: BuildStep,
        command: &str,
        timeout: Duration,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<(), BuildInterrupt> {
        match sandbox.run_shell(command, step, timeout, log, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.step_failure(step, e, log).await),
        }
    }

    async fn step_failure(&self, step: BuildStep, error: StepError, log: &LogStream) -> BuildInterrupt {
        let tail = log.tail(self.options.log_tail_lines).await;
        let failure = match error {
            StepError::Cancelled => return BuildInterrupt::Cancelled,
            StepError::TimedOut(limit) => DeploymentError::new(
                FailureKind::Timeout,
                format!("{} step timed out after {}s", step, limit.as_secs()),
            ),
            StepError::Exit { code } => DeploymentError::new(
                FailureKind::Build,
                format!("{} step failed", step),
            )
            .with_exit_code(code),
            StepError::Spawn(message) => DeploymentError::new(
                FailureKind::Internal,
                format!("{} step could not run: {}", step, message),
            ),
        };
        BuildInterrupt::Failed(failure.at_step(step).with_log_tail(tail))
    }
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
