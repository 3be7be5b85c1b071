//! Intelligence-service client: the five analysis sub-requests stage 2
//! fans out to, guarded by a shared circuit breaker.

use std::time::Duration;

use async_trait::async_trait;
use kg_net::{retry, BreakerState, CircuitBreaker, FailureClass, RetryPolicy};
use kg_types::FileRecord;
use serde::{Deserialize, Serialize};
use url::Url;

/// Errors from the intelligence-service client.
#[derive(Debug, thiserror::Error)]
pub enum IntelligenceError {
    /// The circuit breaker is open; the call was never attempted.
    #[error("intelligence service circuit breaker is open")]
    CircuitOpen,
    /// The transport or remote service failed.
    #[error("intelligence service request failed: {0}")]
    Transport(String),
    /// The response could not be decoded.
    #[error("failed to decode intelligence service response: {0}")]
    Decode(String),
}

impl IntelligenceError {
    /// Classify for [`kg_net::retry`]: everything here is transport-level
    /// and transient except an already-open breaker.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            IntelligenceError::CircuitOpen => FailureClass::Fatal,
            _ => FailureClass::Transient,
        }
    }
}

/// Symbol-level structure extracted from a file (functions, classes,
/// methods, variables).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureAnalysis {
    /// Fully-qualified names of top-level functions.
    pub functions: Vec<String>,
    /// Fully-qualified names of classes.
    pub classes: Vec<String>,
    /// Fully-qualified names of methods, keyed by owning class.
    pub methods: Vec<String>,
}

/// Concept/theme extraction result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConceptExtraction {
    /// Extracted abstract concepts.
    pub concepts: Vec<String>,
    /// Extracted themes.
    pub themes: Vec<String>,
}

/// Quality scoring result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityScoring {
    /// Quality score in `[0, 1]`.
    pub quality_score: f32,
    /// ONEX compliance score in `[0, 1]`.
    pub onex_compliance: f32,
}

/// One resolved or unresolved import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportEdge {
    /// Import path as written in source.
    pub imported_path: String,
    /// Absolute path the import statically resolved to, `None` if the
    /// intelligence service couldn't resolve it. The orchestrator still
    /// looks this path up in the graph store before creating an edge —
    /// a resolved path with no indexed FILE node yet is not an error.
    pub resolved_path: Option<String>,
}

/// Import resolution result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportResolution {
    /// Every import statement found, resolved or not.
    pub imports: Vec<ImportEdge>,
}

/// Documentation generation result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentationGeneration {
    /// Generated free-text description for the file.
    pub description: String,
}

/// Client for the intelligence service's five independent analysis
/// sub-requests. Implementations MUST be safe to call concurrently; the
/// orchestrator bounds concurrency with a semaphore, not serialization
/// here.
#[async_trait]
pub trait IntelligenceClient: Send + Sync {
    /// Extract top-level functions/classes/methods.
    async fn structure_analysis(&self, file: &FileRecord) -> Result<StructureAnalysis, IntelligenceError>;
    /// Extract concepts and themes.
    async fn concept_extraction(&self, file: &FileRecord) -> Result<ConceptExtraction, IntelligenceError>;
    /// Score quality and ONEX compliance.
    async fn quality_scoring(&self, file: &FileRecord) -> Result<QualityScoring, IntelligenceError>;
    /// Resolve imports to other known entities.
    async fn import_resolution(&self, file: &FileRecord) -> Result<ImportResolution, IntelligenceError>;
    /// Generate a human-readable description.
    async fn documentation_generation(&self, file: &FileRecord) -> Result<DocumentationGeneration, IntelligenceError>;
    /// Lightweight liveness probe used to pick the orchestrator's mode.
    async fn health_check(&self) -> Result<(), IntelligenceError>;
    /// Current circuit-breaker state, for `/ready` and `/metrics` to report
    /// live without reaching into implementation details. Clients with no
    /// breaker of their own (fakes, tests) are always `Closed`.
    fn circuit_breaker_state(&self) -> BreakerState {
        BreakerState::Closed
    }
}

#[derive(Debug, Serialize)]
struct GenerateIntelligenceRequest<'a> {
    kind: &'static str,
    file_path: &'a str,
    content: &'a str,
}

/// HTTP-backed [`IntelligenceClient`] for `/api/bridge/generate-intelligence`,
/// guarded by a shared circuit breaker.
pub struct HttpIntelligenceClient {
    client: reqwest::Client,
    base_url: Url,
    breaker: CircuitBreaker,
    retry_policy: RetryPolicy,
}

impl HttpIntelligenceClient {
    /// Construct a client against `base_url` with the default circuit
    /// breaker thresholds (5 consecutive failures to open, 30s half-open).
    pub fn new(base_url: Url, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builder should not fail with static config"),
            base_url,
            breaker: CircuitBreaker::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        kind: &'static str,
        file: &FileRecord,
    ) -> Result<T, IntelligenceError> {
        if !self.breaker.allow_request() {
            return Err(IntelligenceError::CircuitOpen);
        }
        let content = String::from_utf8_lossy(&file.content).into_owned();
        let url = self
            .base_url
            .join("/api/bridge/generate-intelligence")
            .map_err(|e| IntelligenceError::Transport(e.to_string()))?;
        let body = GenerateIntelligenceRequest {
            kind,
            file_path: &file.absolute_path,
            content: &content,
        };

        let outcome = retry(
            self.retry_policy,
            |e: &IntelligenceError| e.failure_class(),
            || async {
                let response = self
                    .client
                    .post(url.clone())
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| IntelligenceError::Transport(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(IntelligenceError::Transport(format!(
                        "generate-intelligence({kind}) returned status {}",
                        response.status()
                    )));
                }
                response
                    .json::<T>()
                    .await
                    .map_err(|e| IntelligenceError::Decode(e.to_string()))
            },
        )
        .await;

        match &outcome {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        outcome
    }
}

#[async_trait]
impl IntelligenceClient for HttpIntelligenceClient {
    async fn structure_analysis(&self, file: &FileRecord) -> Result<StructureAnalysis, IntelligenceError> {
        self.call("structure", file).await
    }

    async fn concept_extraction(&self, file: &FileRecord) -> Result<ConceptExtraction, IntelligenceError> {
        self.call("concepts", file).await
    }

    async fn quality_scoring(&self, file: &FileRecord) -> Result<QualityScoring, IntelligenceError> {
        self.call("quality", file).await
    }

    async fn import_resolution(&self, file: &FileRecord) -> Result<ImportResolution, IntelligenceError> {
        self.call("imports", file).await
    }

    async fn documentation_generation(&self, file: &FileRecord) -> Result<DocumentationGeneration, IntelligenceError> {
        self.call("documentation", file).await
    }

    async fn health_check(&self) -> Result<(), IntelligenceError> {
        let url = self
            .base_url
            .join("/health")
            .map_err(|e| IntelligenceError::Transport(e.to_string()))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IntelligenceError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(IntelligenceError::Transport(format!(
                "health check returned status {}",
                response.status()
            )))
        }
    }

    fn circuit_breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }
}
