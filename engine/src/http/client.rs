//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::{RemoteError, ShipyardError};

/// HTTP client for a remote collaborator's API
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(
        base_url: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ShipyardError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| ShipyardError::ConfigError(format!("invalid URL {}: {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ShipyardError::ConfigError(format!(
                "unsupported URL scheme {} in {}",
                parsed.scheme(),
                base_url
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        let request = self.client.request(method, &url);
        match &self.token {
            Some(token) => request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            ),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("HTTP request failed: {} - {}", status, body);
            return Err(RemoteError::from_status(status.as_u16(), body));
        }
        Ok(response)
    }

    /// Send a JSON body and decode a JSON response
    pub async fn send_json<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let response = self.send(self.request(method, path).json(body)).await?;
        response.json().await.map_err(|e| RemoteError::from_reqwest(&e))
    }

    /// Send a JSON body, ignoring the response body
    pub async fn send_json_unit<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<(), RemoteError> {
        self.send(self.request(method, path).json(body)).await?;
        Ok(())
    }

    /// Upload raw bytes with extra headers
    pub async fn put_bytes(
        &self,
        path: &str,
        bytes: Vec<u8>,
        headers: &[(&'static str, String)],
    ) -> Result<(), RemoteError> {
        let mut request = self.request(Method::PUT, path).body(bytes);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        self.send(request).await?;
        Ok(())
    }

    /// POST raw bytes with extra headers
    pub async fn post_bytes(
        &self,
        path: &str,
        bytes: Vec<u8>,
        headers: &[(&'static str, String)],
    ) -> Result<(), RemoteError> {
        let mut request = self.request(Method::POST, path).body(bytes);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        self.send(request).await?;
        Ok(())
    }

    /// Download raw bytes; `None` when the object does not exist
    pub async fn get_bytes(&self, path: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        match self.send(self.request(Method::GET, path)).await {
            Ok(response) => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| RemoteError::from_reqwest(&e))?;
                Ok(Some(bytes.to_vec()))
            }
            Err(RemoteError::Rejected { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Check whether a resource exists
    pub async fn head(&self, path: &str) -> Result<bool, RemoteError> {
        match self.send(self.request(Method::HEAD, path)).await {
            Ok(_) => Ok(true),
            Err(RemoteError::Rejected { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a resource; a missing one counts as deleted
    pub async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        match self.send(self.request(Method::DELETE, path)).await {
            Ok(_) => Ok(()),
            Err(RemoteError::Rejected { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
