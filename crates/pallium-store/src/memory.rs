//! Remote memory store client.
//!
//! The memory store is an external HTTP service holding durable semantic
//! memories for one user namespace. When no endpoint is configured the
//! client is a no-op: queries return an empty item list and writes return an
//! empty ID, so memory tools degrade gracefully instead of failing.
//!
//! The namespace is always an explicit configuration value, never derived
//! from a credential.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::StoreError;

/// A memory read request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
}

/// A memory write request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryWrite {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Backend seam so tests can script responses without a server.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Query memories; items are `{id, text, score, meta}` objects.
    async fn query(&self, namespace: &str, query: &MemoryQuery) -> Result<Vec<Value>, StoreError>;

    /// Store one memory; returns its ID.
    async fn store(&self, namespace: &str, write: &MemoryWrite) -> Result<String, StoreError>;
}

/// HTTP backend for a configured `memory_endpoint`.
pub struct HttpMemoryBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMemoryBackend {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Memory {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl MemoryBackend for HttpMemoryBackend {
    async fn query(&self, namespace: &str, query: &MemoryQuery) -> Result<Vec<Value>, StoreError> {
        let body = json!({
            "user": namespace,
            "query": query.query,
            "k": query.k.unwrap_or(5),
            "filters": query.filters,
        });
        let response = self.post("/query", &body).await?;
        Ok(response
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn store(&self, namespace: &str, write: &MemoryWrite) -> Result<String, StoreError> {
        let body = json!({
            "user": namespace,
            "text": write.text,
            "tags": write.tags,
            "meta": write.meta,
        });
        let response = self.post("/store", &body).await?;
        Ok(response
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned())
    }
}

/// Client handed to memory tools. Carries the user namespace and either a
/// backend or the disabled no-op behavior.
#[derive(Clone)]
pub struct MemoryClient {
    backend: Option<Arc<dyn MemoryBackend>>,
    namespace: String,
}

impl MemoryClient {
    /// Client for a configured endpoint.
    #[must_use]
    pub fn http(endpoint: &str, namespace: impl Into<String>) -> Self {
        Self {
            backend: Some(Arc::new(HttpMemoryBackend::new(endpoint))),
            namespace: namespace.into(),
        }
    }

    /// No-op client used when `memory_endpoint` is absent.
    #[must_use]
    pub fn disabled(namespace: impl Into<String>) -> Self {
        Self {
            backend: None,
            namespace: namespace.into(),
        }
    }

    /// Client over an explicit backend (tests).
    #[must_use]
    pub fn with_backend(backend: Arc<dyn MemoryBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend: Some(backend),
            namespace: namespace.into(),
        }
    }

    /// The configured user namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether a backend is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Query memories. Disabled clients return an empty list.
    pub async fn query(&self, query: &MemoryQuery) -> Result<Vec<Value>, StoreError> {
        match &self.backend {
            Some(backend) => backend.query(&self.namespace, query).await,
            None => {
                debug!("memory disabled, returning empty query result");
                Ok(Vec::new())
            }
        }
    }

    /// Store a memory. Disabled clients return an empty ID.
    pub async fn store(&self, write: &MemoryWrite) -> Result<String, StoreError> {
        match &self.backend {
            Some(backend) => backend.store(&self.namespace, write).await,
            None => {
                debug!("memory disabled, dropping store request");
                Ok(String::new())
            }
        }
    }
}
