//! Compute runtime backends for service artifacts

use async_trait::async_trait;
use base64::Engine;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::errors::RemoteError;
use crate::filesys::dir::Dir;
use crate::http::client::HttpClient;

/// A service bundle and how to start it
#[derive(Debug, Clone)]
pub struct FunctionPackage {
    /// Stable function name, `{slug}-{role}`
    pub name: String,
    /// tar.gz of the build output
    pub bundle: Vec<u8>,
    pub start_command: String,
    pub runtime_version: Option<String>,
    pub entry_point: Option<String>,
}

/// Where services run
#[async_trait]
pub trait ComputeRuntime: Send + Sync {
    /// Create the function or update it in place; returns its endpoint
    async fn create_or_update_function(&self, package: &FunctionPackage) -> Result<String, RemoteError>;
}

#[derive(Serialize)]
struct FunctionRequest<'a> {
    bundle: String,
    start_command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry_point: Option<&'a str>,
}

#[derive(Deserialize)]
struct FunctionResponse {
    endpoint: String,
}

/// Runtime behind `PUT /functions/{name}`
pub struct HttpComputeRuntime {
    client: HttpClient,
}

impl HttpComputeRuntime {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ComputeRuntime for HttpComputeRuntime {
    async fn create_or_update_function(&self, package: &FunctionPackage) -> Result<String, RemoteError> {
        let request = FunctionRequest {
            bundle: base64::engine::general_purpose::STANDARD.encode(&package.bundle),
            start_command: &package.start_command,
            runtime_version: package.runtime_version.as_deref(),
            entry_point: package.entry_point.as_deref(),
        };
        let response: FunctionResponse = self
            .client
            .send_json(
                reqwest::Method::PUT,
                &format!("/functions/{}", package.name),
                &request,
            )
            .await?;
        Ok(response.endpoint)
    }
}

fn transient(e: impl std::fmt::Display) -> RemoteError {
    RemoteError::Transient(e.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalFunction {
    name: String,
    start_command: String,
    runtime_version: Option<String>,
    entry_point: Option<String>,
}

/// Unpacks bundles under `functions/{name}/` in the data directory.
///
/// A supervisor outside the engine starts what it finds there.
pub struct LocalComputeRuntime {
    root: Dir,
}

impl LocalComputeRuntime {
    pub fn new(root: Dir) -> Self {
        Self { root }
    }

    /// Directory the function's current bundle is unpacked into
    pub fn function_dir(&self, name: &str) -> Dir {
        self.root.subdir(name)
    }
}

#[async_trait]
impl ComputeRuntime for LocalComputeRuntime {
    async fn create_or_update_function(&self, package: &FunctionPackage) -> Result<String, RemoteError> {
        self.root.create().await.map_err(transient)?;
        let staging = self
            .root
            .subdir(&format!(".{}.{}", package.name, uuid::Uuid::new_v4().simple()));
        let bundle = package.bundle.clone();
        let unpack_to = staging.subdir("bundle").path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            tar::Archive::new(GzDecoder::new(bundle.as_slice())).unpack(&unpack_to)
        })
        .await
        .map_err(transient)?
        .map_err(|e| RemoteError::Rejected {
            status: 400,
            message: format!("invalid bundle: {}", e),
        })?;

        let descriptor = LocalFunction {
            name: package.name.clone(),
            start_command: package.start_command.clone(),
            runtime_version: package.runtime_version.clone(),
            entry_point: package.entry_point.clone(),
        };
        staging
            .file("function.json")
            .write_json(&descriptor)
            .await
            .map_err(transient)?;

        // swap the whole directory so a supervisor never sees a mix
        let target = self.function_dir(&package.name);
        let retired = self
            .root
            .subdir(&format!(".{}.retired.{}", package.name, uuid::Uuid::new_v4().simple()));
        if target.exists().await {
            fs::rename(target.path(), retired.path())
                .await
                .map_err(transient)?;
        }
        fs::rename(staging.path(), target.path())
            .await
            .map_err(transient)?;
        let _ = retired.delete().await;

        info!("Updated local function {}", package.name);
        Ok(format!("local://functions/{}", package.name))
    }
}
