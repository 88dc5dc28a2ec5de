//! Versioned artifact storage backends

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::errors::RemoteError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::http::client::HttpClient;

/// Cache policy attached to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Fingerprinted assets that never change under their name
    Immutable,
    /// Documents that must be revalidated on every request
    NoCache,
    /// Everything else
    ShortLived,
}

impl CachePolicy {
    pub fn header_value(&self) -> &'static str {
        match self {
            CachePolicy::Immutable => "public, max-age=31536000, immutable",
            CachePolicy::NoCache => "no-cache",
            CachePolicy::ShortLived => "public, max-age=300",
        }
    }
}

/// Metadata stored with an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub content_type: String,
    pub cache_policy: CachePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
}

impl ObjectMeta {
    pub fn new(content_type: impl Into<String>, cache_policy: CachePolicy) -> Self {
        Self {
            content_type: content_type.into(),
            cache_policy,
            content_encoding: None,
        }
    }
}

/// Multi-tenant object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write one object, replacing any previous value
    async fn put(&self, path: &str, bytes: Vec<u8>, meta: &ObjectMeta) -> Result<(), RemoteError>;

    /// Read one object
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    async fn exists(&self, path: &str) -> Result<bool, RemoteError>;

    /// Delete every object under `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, RemoteError>;
}

fn check_path(path: &str) -> Result<(), RemoteError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(RemoteError::Rejected {
            status: 400,
            message: format!("invalid object path: {}", path),
        });
    }
    Ok(())
}

fn io_error(e: impl std::fmt::Display) -> RemoteError {
    RemoteError::Transient(e.to_string())
}

/// Object store on the local filesystem.
///
/// Bytes live under `objects/` and metadata under `meta/`, mirroring paths.
pub struct LocalObjectStore {
    objects: Dir,
    meta: Dir,
}

impl LocalObjectStore {
    pub fn new(root: Dir) -> Self {
        Self {
            objects: root.subdir("objects"),
            meta: root.subdir("meta"),
        }
    }

    /// Filesystem location of an object
    pub fn object_path(&self, path: &str) -> PathBuf {
        self.objects.path().join(path)
    }

    fn meta_file(&self, path: &str) -> File {
        File::new(self.meta.path().join(format!("{}.json", path)))
    }

    /// Metadata stored with an object
    pub async fn meta(&self, path: &str) -> Result<Option<ObjectMeta>, RemoteError> {
        check_path(path)?;
        let file = self.meta_file(path);
        if !file.exists().await {
            return Ok(None);
        }
        file.read_json().await.map(Some).map_err(io_error)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, meta: &ObjectMeta) -> Result<(), RemoteError> {
        check_path(path)?;
        self.meta_file(path).write_json(meta).await.map_err(io_error)?;
        File::new(self.object_path(path))
            .write_atomic(&bytes)
            .await
            .map_err(io_error)
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        check_path(path)?;
        match fs::read(self.object_path(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        check_path(path)?;
        Ok(File::new(self.object_path(path)).exists().await)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, RemoteError> {
        check_path(prefix)?;
        let objects = self.objects.subdir(prefix);
        let count = if objects.exists().await {
            objects.walk_files().await.map_err(io_error)?.len() as u64
        } else {
            0
        };
        objects.delete().await.map_err(io_error)?;
        self.meta.subdir(prefix).delete().await.map_err(io_error)?;
        Ok(count)
    }
}

/// Object store behind an HTTP API:
/// `PUT|GET|HEAD /objects/{path}` and `DELETE /prefixes/{prefix}`
pub struct HttpObjectStore {
    client: HttpClient,
}

#[derive(Deserialize)]
struct DeletedResponse {
    #[serde(default)]
    deleted: u64,
}

impl HttpObjectStore {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, meta: &ObjectMeta) -> Result<(), RemoteError> {
        check_path(path)?;
        let mut headers = vec![
            ("content-type", meta.content_type.clone()),
            ("cache-control", meta.cache_policy.header_value().to_string()),
        ];
        if let Some(encoding) = &meta.content_encoding {
            headers.push(("content-encoding", encoding.clone()));
        }
        self.client
            .put_bytes(&format!("/objects/{}", path), bytes, &headers)
            .await
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        check_path(path)?;
        self.client.get_bytes(&format!("/objects/{}", path)).await
    }

    async fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        check_path(path)?;
        self.client.head(&format!("/objects/{}", path)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, RemoteError> {
        check_path(prefix)?;
        let response: DeletedResponse = self
            .client
            .send_json(
                reqwest::Method::DELETE,
                &format!("/prefixes/{}", prefix),
                &serde_json::json!({}),
            )
            .await?;
        Ok(response.deleted)
    }
}
