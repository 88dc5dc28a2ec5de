//! Edge routing control plane backends

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::RemoteError;
use crate::filesys::file::File;
use crate::http::client::HttpClient;
use crate::models::binding::BindingValue;

/// The plane that maps hostnames to what answers them.
///
/// Every `set_mapping` replaces the whole value for a hostname in a single
/// write; edges serve either the previous or the new value, never a mix.
/// A write becomes visible at every edge location within
/// [`EdgeControlPlane::propagation_window`].
#[async_trait]
pub trait EdgeControlPlane: Send + Sync {
    async fn set_mapping(&self, hostname: &str, value: &BindingValue) -> Result<(), RemoteError>;

    async fn delete_mapping(&self, hostname: &str) -> Result<(), RemoteError>;

    async fn get_mapping(&self, hostname: &str) -> Result<Option<BindingValue>, RemoteError>;

    /// Drop cached responses for a hostname
    async fn purge_cache(&self, hostname: &str) -> Result<(), RemoteError>;

    /// Upper bound for a write to reach every edge location
    fn propagation_window(&self) -> Duration;
}

/// Routing table kept in `routes.json`, read by a co-located proxy
pub struct LocalEdge {
    file: Option<File>,
    routes: RwLock<BTreeMap<String, BindingValue>>,
}

impl LocalEdge {
    /// Edge that only lives in memory
    pub fn in_memory() -> Self {
        Self {
            file: None,
            routes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Edge persisted to `file`
    pub async fn open(file: File) -> Result<Self, RemoteError> {
        let routes = if file.exists().await {
            file.read_json()
                .await
                .map_err(|e| RemoteError::Transient(e.to_string()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            file: Some(file),
            routes: RwLock::new(routes),
        })
    }

    /// Snapshot of the routing table
    pub async fn routes(&self) -> BTreeMap<String, BindingValue> {
        self.routes.read().await.clone()
    }

    async fn persist(&self, routes: &BTreeMap<String, BindingValue>) -> Result<(), RemoteError> {
        match &self.file {
            Some(file) => file
                .write_json(routes)
                .await
                .map_err(|e| RemoteError::Transient(e.to_string())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EdgeControlPlane for LocalEdge {
    async fn set_mapping(&self, hostname: &str, value: &BindingValue) -> Result<(), RemoteError> {
        let mut routes = self.routes.write().await;
        let mut next = routes.clone();
        next.insert(hostname.to_string(), value.clone());
        self.persist(&next).await?;
        *routes = next;
        Ok(())
    }

    async fn delete_mapping(&self, hostname: &str) -> Result<(), RemoteError> {
        let mut routes = self.routes.write().await;
        if !routes.contains_key(hostname) {
            return Ok(());
        }
        let mut next = routes.clone();
        next.remove(hostname);
        self.persist(&next).await?;
        *routes = next;
        Ok(())
    }

    async fn get_mapping(&self, hostname: &str) -> Result<Option<BindingValue>, RemoteError> {
        Ok(self.routes.read().await.get(hostname).cloned())
    }

    async fn purge_cache(&self, hostname: &str) -> Result<(), RemoteError> {
        debug!("Local edge has no response cache to purge for {}", hostname);
        Ok(())
    }

    fn propagation_window(&self) -> Duration {
        Duration::ZERO
    }
}

/// Edge behind an HTTP API:
/// `PUT|GET|DELETE /mappings/{hostname}` and `POST /purge/{hostname}`
pub struct HttpEdge {
    client: HttpClient,
    propagation_window: Duration,
}

impl HttpEdge {
    pub fn new(client: HttpClient, propagation_window: Duration) -> Self {
        Self {
            client,
            propagation_window,
        }
    }
}

#[async_trait]
impl EdgeControlPlane for HttpEdge {
    async fn set_mapping(&self, hostname: &str, value: &BindingValue) -> Result<(), RemoteError> {
        self.client
            .send_json_unit(reqwest::Method::PUT, &format!("/mappings/{}", hostname), value)
            .await
    }

    async fn delete_mapping(&self, hostname: &str) -> Result<(), RemoteError> {
        self.client.delete(&format!("/mappings/{}", hostname)).await
    }

    async fn get_mapping(&self, hostname: &str) -> Result<Option<BindingValue>, RemoteError> {
        match self.client.get_bytes(&format!("/mappings/{}", hostname)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| RemoteError::Rejected {
                    status: 0,
                    message: format!("malformed mapping: {}", e),
                }),
            None => Ok(None),
        }
    }

    async fn purge_cache(&self, hostname: &str) -> Result<(), RemoteError> {
        self.client
            .send_json_unit(
                reqwest::Method::POST,
                &format!("/purge/{}", hostname),
                &serde_json::json!({}),
            )
            .await
    }

    fn propagation_window(&self) -> Duration {
        self.propagation_window
    }
}
