//! Artifact publisher
//!
//! Static output is uploaded file by file under `{slug}/{deployment_id}/`;
//! service output is bundled, stored next to it and registered with the
//! compute runtime. The manifest object is always written last: an artifact
//! without one is incomplete and is never handed out as a location.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::deploy::executor::BuildOutput;
use crate::deploy::logstream::LogStream;
use crate::errors::RemoteError;
use crate::filesys::dir::{Dir, WalkEntry};
use crate::models::binding::{ArtifactLocation, MANIFEST_OBJECT};
use crate::models::deployment::{BuildStep, Deployment, DeploymentError, FailureKind};
use crate::models::project::{ArtifactKind, CommandSetting, Project};
use crate::publish::object_store::{CachePolicy, ObjectMeta, ObjectStore};
use crate::publish::runtime::{ComputeRuntime, FunctionPackage};
use crate::utils::{retry_with_backoff, sha256_hash, RetryOptions};

pub const BUNDLE_OBJECT: &str = "bundle.tar.gz";

/// Text assets smaller than this are stored uncompressed
const GZIP_MIN_BYTES: usize = 256;

/// Publisher options
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub retry: RetryOptions,
    /// Bound on every single storage or runtime call
    pub call_timeout: Duration,
    /// Concurrent uploads per artifact
    pub upload_concurrency: usize,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            call_timeout: Duration::from_secs(30),
            upload_concurrency: 8,
        }
    }
}

/// One uploaded file as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size: u64,
    pub sha256: String,
    pub content_type: String,
}

/// Completeness marker of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub deployment_id: String,
    pub project_slug: String,
    pub commit: String,
    pub kind: ArtifactKind,
    pub files: Vec<ManifestFile>,
    pub created_at: DateTime<Utc>,
}

/// Uploads build output and registers services
pub struct ArtifactPublisher {
    store: Arc<dyn ObjectStore>,
    runtime: Arc<dyn ComputeRuntime>,
    options: PublisherOptions,
}

impl ArtifactPublisher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        runtime: Arc<dyn ComputeRuntime>,
        options: PublisherOptions,
    ) -> Self {
        Self {
            store,
            runtime,
            options,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Versioned prefix of a deployment's artifact
    pub fn prefix(project: &Project, deployment_id: &str) -> String {
        format!("{}/{}", project.slug, deployment_id)
    }

    /// Upload the build output. Returns the location only once the manifest
    /// is written; on failure the prefix is cleaned up best-effort.
    ///
    /// For services the location's endpoint is empty until
    /// [`ArtifactPublisher::register_service`] runs.
    pub async fn publish(
        &self,
        deployment: &Deployment,
        project: &Project,
        output: &BuildOutput,
        log: &LogStream,
    ) -> Result<ArtifactLocation, DeploymentError> {
        let prefix = Self::prefix(project, &deployment.id);
        let result = match output.kind {
            ArtifactKind::Static => self.upload_static(&prefix, deployment, project, output, log).await,
            ArtifactKind::Service => self.upload_bundle(&prefix, deployment, project, output, log).await,
        };

        match result {
            Ok(location) => Ok(location),
            Err(e) => {
                if let Err(cleanup) = self.store.delete_prefix(&prefix).await {
                    warn!("Unable to clean up partial artifact {}: {}", prefix, cleanup);
                }
                Err(remote_failure(BuildStep::Publish, "Artifact upload failed", e))
            }
        }
    }

    async fn upload_static(
        &self,
        prefix: &str,
        deployment: &Deployment,
        project: &Project,
        output: &BuildOutput,
        log: &LogStream,
    ) -> Result<ArtifactLocation, RemoteError> {
        let files = walk(&output.output_dir).await?;
        log.system(
            Some(BuildStep::Publish),
            format!("Uploading {} files to {}", files.len(), prefix),
        )
        .await;

        // every upload settles before the first error is returned, so the
        // cleanup of a failed publish cannot race a late write
        let results: Vec<Result<ManifestFile, RemoteError>> = stream::iter(files.into_iter().map(|entry| {
            let prefix = prefix.to_string();
            async move { self.upload_file(&prefix, entry).await }
        }))
        .buffer_unordered(self.options.upload_concurrency.max(1))
        .collect()
        .await;

        let mut files = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let bytes: u64 = files.iter().map(|f| f.size).sum();
        let count = files.len();
        self.write_manifest(prefix, deployment, project, ArtifactKind::Static, files)
            .await?;

        log.system(
            Some(BuildStep::Publish),
            format!("Uploaded {} files ({} bytes)", count, bytes),
        )
        .await;
        Ok(ArtifactLocation::Static {
            prefix: prefix.to_string(),
        })
    }

    async fn upload_file(&self, prefix: &str, entry: WalkEntry) -> Result<ManifestFile, RemoteError> {
        let contents = tokio::fs::read(&entry.path)
            .await
            .map_err(|e| RemoteError::Transient(format!("{}: {}", entry.relative, e)))?;
        let sha256 = sha256_hash(&contents);
        let content_type = content_type_for(&entry.relative);
        let mut meta = ObjectMeta::new(content_type, cache_policy_for(&entry.relative));

        let body = if is_compressible(content_type) && contents.len() >= GZIP_MIN_BYTES {
            meta.content_encoding = Some("gzip".to_string());
            gzip(&contents).map_err(|e| RemoteError::Transient(e.to_string()))?
        } else {
            contents
        };

        let path = format!("{}/{}", prefix, entry.relative);
        self.put_with_retry(&path, body, &meta).await?;

        Ok(ManifestFile {
            path: entry.relative,
            size: entry.size,
            sha256,
            content_type: content_type.to_string(),
        })
    }

    async fn upload_bundle(
        &self,
        prefix: &str,
        deployment: &Deployment,
        project: &Project,
        output: &BuildOutput,
        log: &LogStream,
    ) -> Result<ArtifactLocation, RemoteError> {
        let source = output.output_dir.path().to_path_buf();
        let bundle = tokio::task::spawn_blocking(move || bundle_dir(&source))
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?
            .map_err(|e| RemoteError::Transient(format!("unable to bundle output: {}", e)))?;

        log.system(
            Some(BuildStep::Publish),
            format!("Uploading service bundle ({} bytes)", bundle.len()),
        )
        .await;

        let manifest_file = ManifestFile {
            path: BUNDLE_OBJECT.to_string(),
            size: bundle.len() as u64,
            sha256: sha256_hash(&bundle),
            content_type: "application/gzip".to_string(),
        };
        let meta = ObjectMeta::new("application/gzip", CachePolicy::Immutable);
        self.put_with_retry(&format!("{}/{}", prefix, BUNDLE_OBJECT), bundle, &meta)
            .await?;
        self.write_manifest(prefix, deployment, project, ArtifactKind::Service, vec![manifest_file])
            .await?;

        Ok(ArtifactLocation::Service {
            prefix: prefix.to_string(),
            function: project.function_name(deployment.role),
            endpoint: String::new(),
        })
    }

    async fn write_manifest(
        &self,
        prefix: &str,
        deployment: &Deployment,
        project: &Project,
        kind: ArtifactKind,
        files: Vec<ManifestFile>,
    ) -> Result<(), RemoteError> {
        let manifest = ArtifactManifest {
            deployment_id: deployment.id.clone(),
            project_slug: project.slug.clone(),
            commit: deployment.revision.commit.clone(),
            kind,
            files,
            created_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&manifest).map_err(|e| RemoteError::Rejected {
            status: 0,
            message: e.to_string(),
        })?;
        let meta = ObjectMeta::new("application/json", CachePolicy::NoCache);
        self.put_with_retry(&format!("{}/{}", prefix, MANIFEST_OBJECT), body, &meta)
            .await
    }

    async fn put_with_retry(&self, path: &str, body: Vec<u8>, meta: &ObjectMeta) -> Result<(), RemoteError> {
        let label = format!("upload {}", path);
        retry_with_backoff(&self.options.retry, &label, |_| {
            let body = body.clone();
            async move {
                with_timeout(self.options.call_timeout, self.store.put(path, body, meta)).await
            }
        })
        .await
    }

    /// Load the service bundle stored for `location` into the runtime
    /// function it names; returns the location with the runtime's endpoint.
    pub async fn register_service(
        &self,
        project: &Project,
        location: &ArtifactLocation,
    ) -> Result<ArtifactLocation, DeploymentError> {
        let ArtifactLocation::Service { prefix, function, .. } = location else {
            return Ok(location.clone());
        };
        let start_command = match &project.build.start_command {
            CommandSetting::Run(cmd) => cmd.clone(),
            _ => {
                return Err(DeploymentError::new(
                    FailureKind::Configuration,
                    "service projects require a start_command",
                )
                .at_step(BuildStep::Activate))
            }
        };
        let bundle_path = format!("{}/{}", prefix, BUNDLE_OBJECT);
        let bundle = retry_with_backoff(&self.options.retry, "download bundle", |_| {
            with_timeout(self.options.call_timeout, self.store.get(&bundle_path))
        })
        .await
        .map_err(|e| remote_failure(BuildStep::Activate, "Unable to read service bundle", e))?
        .ok_or_else(|| {
            DeploymentError::new(
                FailureKind::Internal,
                format!("Service bundle {} is missing", bundle_path),
            )
            .at_step(BuildStep::Activate)
        })?;

        let package = FunctionPackage {
            name: function.clone(),
            bundle,
            start_command,
            runtime_version: project.build.runtime_version.clone(),
            entry_point: project.build.entry_point.clone(),
        };
        let endpoint = retry_with_backoff(&self.options.retry, "register function", |_| {
            with_timeout(
                self.options.call_timeout,
                self.runtime.create_or_update_function(&package),
            )
        })
        .await
        .map_err(|e| remote_failure(BuildStep::Activate, "Service registration failed", e))?;

        info!("Function {} now serves {} at {}", function, prefix, endpoint);
        Ok(ArtifactLocation::Service {
            prefix: prefix.clone(),
            function: function.clone(),
            endpoint,
        })
    }

    /// Whether the artifact's manifest exists
    pub async fn is_complete(&self, location: &ArtifactLocation) -> Result<bool, RemoteError> {
        with_timeout(self.options.call_timeout, self.store.exists(&location.manifest_path())).await
    }

    /// Drop whatever an interrupted publish left under a deployment's prefix
    pub async fn discard(&self, project: &Project, deployment_id: &str) {
        let prefix = Self::prefix(project, deployment_id);
        if let Err(e) = with_timeout(self.options.call_timeout, self.store.delete_prefix(&prefix)).await {
            warn!("Unable to clean up partial artifact {}: {}", prefix, e);
        }
    }

    /// Delete an artifact's bytes, returning how many objects went away
    pub async fn delete(&self, location: &ArtifactLocation) -> Result<u64, RemoteError> {
        let prefix = location.prefix();
        retry_with_backoff(&self.options.retry, "delete artifact", |_| {
            with_timeout(self.options.call_timeout, self.store.delete_prefix(prefix))
        })
        .await
    }
}

async fn with_timeout<T>(
    limit: Duration,
    call: impl std::future::Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Transient(format!("timed out after {:?}", limit))),
    }
}

fn remote_failure(step: BuildStep, context: &str, error: RemoteError) -> DeploymentError {
    // details stay in the engine log, users get the generic message
    warn!("{} at {}: {}", context, step, error);
    let kind = if error.is_retryable() {
        FailureKind::Transient
    } else {
        FailureKind::Internal
    };
    DeploymentError::new(kind, context).at_step(step)
}

async fn walk(dir: &Dir) -> Result<Vec<WalkEntry>, RemoteError> {
    dir.walk_files()
        .await
        .map_err(|e| RemoteError::Transient(e.to_string()))
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn bundle_dir(source: &Path) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", source)?;
    builder.into_inner()?.finish()
}

fn extension(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Content type by file extension
pub fn content_type_for(path: &str) -> &'static str {
    match extension(path).as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" | "cjs" => "text/javascript; charset=utf-8",
        "json" | "map" | "webmanifest" => "application/json",
        "svg" => "image/svg+xml",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn is_compressible(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type.starts_with("application/json")
        || content_type.starts_with("application/xml")
        || content_type.starts_with("image/svg+xml")
}

/// HTML is revalidated, fingerprinted assets are immutable
pub fn cache_policy_for(path: &str) -> CachePolicy {
    let ext = extension(path);
    if ext == "html" || ext == "htm" {
        return CachePolicy::NoCache;
    }
    if is_fingerprinted(path) {
        CachePolicy::Immutable
    } else {
        CachePolicy::ShortLived
    }
}

/// `app.3f9a1c2b.js`, `index-BVz1_x3Q.css`
fn is_fingerprinted(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
    stem.split(['.', '-']).skip(1).any(|segment| {
        segment.len() >= 8
            && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && segment.chars().any(|c| c.is_ascii_digit())
    })
}
