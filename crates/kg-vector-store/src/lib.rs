#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kg-vector-store** – Vector store adapter (C3).
//!
//! Wraps a semantic vector index (Qdrant-shaped HTTP API) behind a small
//! trait so the enrichment orchestrator (C5) never has to know which
//! product is behind it. Point ids are derived deterministically from
//! `(project_name, content_hash)` so re-embedding identical content is a
//! pure upsert, never a duplicate point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use kg_net::{retry, FailureClass, RetryPolicy};
use kg_types::{VectorPayload, VectorRecord};
use tracing::debug;
use url::Url;

//─────────────────────────────
//  Point id derivation
//─────────────────────────────

/// Derive the deterministic point id for a file's vector record: the low
/// 64 bits of `BLAKE3(project_name || "\0" || content_hash)`.
pub fn vector_point_id(project_name: &str, content_hash: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(project_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(content_hash.as_bytes());
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    u64::from_be_bytes(bytes[..8].try_into().expect("blake3 digest is 32 bytes"))
}

//─────────────────────────────
//  Client trait
//─────────────────────────────

/// Errors surfaced by a [`VectorStoreClient`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    /// The embedding dimension did not match the collection's configured
    /// dimension. Never retried.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension configured on the collection.
        expected: usize,
        /// Dimension of the embedding actually supplied.
        actual: usize,
    },
    /// Requested point does not exist.
    #[error("point not found for path {0}")]
    NotFound(String),
    /// The transport or remote service failed.
    #[error("vector store request failed: {0}")]
    Transport(String),
    /// The remote service returned a response this client couldn't parse.
    #[error("failed to decode vector store response: {0}")]
    Decode(String),
}

impl VectorStoreError {
    /// Classify this error for [`kg_net::retry`]: dimension mismatches are
    /// a caller bug and never retried, everything else is transient.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            VectorStoreError::DimensionMismatch { .. } => FailureClass::Fatal,
            _ => FailureClass::Transient,
        }
    }
}

/// Adapter to a semantic vector index, keyed by deterministic point id.
#[async_trait]
pub trait VectorStoreClient: Send + Sync {
    /// Upsert a vector record. Idempotent: re-upserting the same point id
    /// with the same payload is a no-op from the caller's perspective.
    async fn upsert_point(&self, record: VectorRecord) -> Result<(), VectorStoreError>;

    /// Look up points whose `project_name` matches `project` and whose
    /// `absolute_path` contains `path_substring`, most recently indexed
    /// first, capped at `limit`.
    async fn query_by_path(
        &self,
        project: &str,
        path_substring: &str,
        limit: usize,
    ) -> Result<Vec<VectorPayload>, VectorStoreError>;

    /// Number of points currently stored, surfaced on `/metrics`.
    async fn point_count(&self) -> Result<u64, VectorStoreError>;
}

//─────────────────────────────
//  HTTP implementation
//─────────────────────────────

#[derive(Debug, serde::Serialize)]
struct UpsertRequest {
    points: Vec<UpsertPoint>,
}

#[derive(Debug, serde::Serialize)]
struct UpsertPoint {
    id: u64,
    vector: Vec<f32>,
    payload: VectorPayload,
}

#[derive(Debug, serde::Deserialize)]
struct ScrollResponse {
    points: Vec<ScrollPoint>,
}

#[derive(Debug, serde::Deserialize)]
struct ScrollPoint {
    payload: VectorPayload,
}

#[derive(Debug, serde::Deserialize)]
struct CountResponse {
    count: u64,
}

/// HTTP-backed [`VectorStoreClient`] for a Qdrant-shaped collection API.
pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: Url,
    collection: String,
    expected_dimension: usize,
    retry_policy: RetryPolicy,
}

impl HttpVectorStore {
    /// Construct a client bound to `base_url`'s `collection`, rejecting
    /// embeddings that don't match `expected_dimension`.
    pub fn new(base_url: Url, collection: impl Into<String>, expected_dimension: usize, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builder should not fail with static config"),
            base_url,
            collection: collection.into(),
            expected_dimension,
            retry_policy: RetryPolicy::default(),
        }
    }

    fn collection_url(&self, path: &str) -> Result<Url, VectorStoreError> {
        self.base_url
            .join(&format!("/collections/{}/{}", self.collection, path))
            .map_err(|e| VectorStoreError::Transport(e.to_string()))
    }
}

#[async_trait]
impl VectorStoreClient for HttpVectorStore {
    async fn upsert_point(&self, record: VectorRecord) -> Result<(), VectorStoreError> {
        if record.embedding.len() != self.expected_dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.expected_dimension,
                actual: record.embedding.len(),
            });
        }

        let url = self.collection_url("points")?;
        let body = UpsertRequest {
            points: vec![UpsertPoint {
                id: record.point_id,
                vector: record.embedding.clone(),
                payload: record.payload.clone(),
            }],
        };

        retry(
            self.retry_policy,
            |e: &VectorStoreError| e.failure_class(),
            || async {
                let response = self
                    .client
                    .put(url.clone())
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| VectorStoreError::Transport(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(VectorStoreError::Transport(format!(
                        "upsert returned status {}",
                        response.status()
                    )));
                }
                Ok(())
            },
        )
        .await
    }

    async fn query_by_path(
        &self,
        project: &str,
        path_substring: &str,
        limit: usize,
    ) -> Result<Vec<VectorPayload>, VectorStoreError> {
        let url = self.collection_url("points/scroll")?;
        let filter = serde_json::json!({
            "filter": {
                "must": [
                    {"key": "project_name", "match": {"value": project}},
                    {"key": "absolute_path", "match": {"text": path_substring}},
                ]
            },
            "limit": limit,
            "with_payload": true,
        });

        let outcome = retry(
            self.retry_policy,
            |e: &VectorStoreError| e.failure_class(),
            || async {
                let response = self
                    .client
                    .post(url.clone())
                    .json(&filter)
                    .send()
                    .await
                    .map_err(|e| VectorStoreError::Transport(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(VectorStoreError::Transport(format!(
                        "scroll returned status {}",
                        response.status()
                    )));
                }
                response
                    .json::<ScrollResponse>()
                    .await
                    .map_err(|e| VectorStoreError::Decode(e.to_string()))
            },
        )
        .await?;

        Ok(outcome.points.into_iter().map(|p| p.payload).collect())
    }

    async fn point_count(&self) -> Result<u64, VectorStoreError> {
        let url = self.collection_url("points/count")?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({"exact": true}))
            .send()
            .await
            .map_err(|e| VectorStoreError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(VectorStoreError::Transport(format!(
                "count returned status {}",
                response.status()
            )));
        }
        let count: CountResponse = response
            .json()
            .await
            .map_err(|e| VectorStoreError::Decode(e.to_string()))?;
        Ok(count.count)
    }
}

//─────────────────────────────
//  In-memory test double
//─────────────────────────────

/// In-memory [`VectorStoreClient`] used by tests and local development.
#[derive(Default)]
pub struct InMemoryVectorStore {
    expected_dimension: Option<usize>,
    points: Mutex<HashMap<u64, VectorRecord>>,
}

impl InMemoryVectorStore {
    /// Construct a store with no dimension enforcement.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a store that rejects embeddings not matching `dimension`.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            expected_dimension: Some(dimension),
            points: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorStoreClient for InMemoryVectorStore {
    async fn upsert_point(&self, record: VectorRecord) -> Result<(), VectorStoreError> {
        if let Some(expected) = self.expected_dimension {
            if record.embedding.len() != expected {
                return Err(VectorStoreError::DimensionMismatch {
                    expected,
                    actual: record.embedding.len(),
                });
            }
        }
        debug!(point_id = record.point_id, "upserting in-memory vector point");
        self.points
            .lock()
            .expect("in-memory vector store mutex poisoned")
            .insert(record.point_id, record);
        Ok(())
    }

    async fn query_by_path(
        &self,
        project: &str,
        path_substring: &str,
        limit: usize,
    ) -> Result<Vec<VectorPayload>, VectorStoreError> {
        let points = self.points.lock().expect("in-memory vector store mutex poisoned");
        Ok(points
            .values()
            .filter(|r| r.payload.project_name == project && r.payload.absolute_path.contains(path_substring))
            .take(limit)
            .map(|r| r.payload.clone())
            .collect())
    }

    async fn point_count(&self) -> Result<u64, VectorStoreError> {
        Ok(self.points.lock().expect("in-memory vector store mutex poisoned").len() as u64)
    }
}
