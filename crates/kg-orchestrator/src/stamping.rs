//! Stamping-service client: marks a file as processed on the legacy
//! HTTP-fallback surface and doubles as the orchestrator's mode probe.

use std::time::Duration;

use async_trait::async_trait;
use kg_net::{retry, FailureClass, RetryPolicy};
use serde::Serialize;
use url::Url;

/// Errors from the stamping-service client.
#[derive(Debug, thiserror::Error)]
pub enum StampingError {
    /// The transport or remote service failed.
    #[error("stamping service request failed: {0}")]
    Transport(String),
}

impl StampingError {
    /// All stamping failures are transient network conditions.
    pub fn failure_class(&self) -> FailureClass {
        FailureClass::Transient
    }
}

/// Client that records a file as processed, used by the HTTP-fallback
/// execution mode and by [`crate::Orchestrator`]'s mode probe at startup.
#[async_trait]
pub trait StampingClient: Send + Sync {
    /// Mark `entity_id` as processed.
    async fn mark_processed(&self, entity_id: &str) -> Result<(), StampingError>;
    /// Liveness probe; `Orchestrator::new` uses this to decide
    /// [`crate::Mode`].
    async fn health_check(&self) -> Result<(), StampingError>;
}

#[derive(Debug, Serialize)]
struct MarkProcessedRequest<'a> {
    entity_id: &'a str,
}

/// HTTP-backed [`StampingClient`].
pub struct HttpStampingClient {
    client: reqwest::Client,
    base_url: Url,
    retry_policy: RetryPolicy,
}

impl HttpStampingClient {
    /// Construct a client against `base_url`.
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builder should not fail with static config"),
            base_url,
            retry_policy: RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl StampingClient for HttpStampingClient {
    async fn mark_processed(&self, entity_id: &str) -> Result<(), StampingError> {
        let url = self
            .base_url
            .join("/process/document")
            .map_err(|e| StampingError::Transport(e.to_string()))?;
        let body = MarkProcessedRequest { entity_id };
        retry(
            self.retry_policy,
            |e: &StampingError| e.failure_class(),
            || async {
                let response = self
                    .client
                    .post(url.clone())
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| StampingError::Transport(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(StampingError::Transport(format!(
                        "mark-processed returned status {}",
                        response.status()
                    )));
                }
                Ok(())
            },
        )
        .await
    }

    async fn health_check(&self) -> Result<(), StampingError> {
        let url = self
            .base_url
            .join("/health")
            .map_err(|e| StampingError::Transport(e.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StampingError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StampingError::Transport(format!(
                "health check returned status {}",
                response.status()
            )))
        }
    }
}
