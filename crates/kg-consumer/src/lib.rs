#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kg-consumer** – Consumer runtime (C6): N worker tasks pulling
//! enrichment events off the bus, validating them (C1), handing valid
//! work to the orchestrator (C5), and committing offsets strictly after
//! that work returns. Exposes `/health`, `/ready`, `/metrics` over HTTP
//! and shuts down on Ctrl-C/SIGTERM with a bounded drain deadline.

pub mod config;
pub mod http;
pub mod metrics;
pub mod shutdown;
pub mod worker;

use std::sync::Arc;

use kg_bus_core::Bus;
use kg_orchestrator::Orchestrator;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub use config::{ConfigError, ConsumerConfig};
pub use http::Readiness;
pub use metrics::{ConsumerMetrics, MetricsSnapshot};
pub use worker::Worker;

/// Clean shutdown after the drain deadline elapsed without error.
pub const EXIT_OK: i32 = 0;
/// Configuration failed to load.
pub const EXIT_CONFIG_ERROR: i32 = 1;
/// The health/ready/metrics listener failed to bind.
pub const EXIT_HEALTH_BIND_ERROR: i32 = 2;
/// An unrecoverable runtime error occurred (worker panic, HTTP server crash).
pub const EXIT_RUNTIME_ERROR: i32 = 3;

/// Errors from running a [`ConsumerRuntime`] to completion.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The health/ready/metrics listener could not be bound.
    #[error("failed to bind health endpoint on port {port}: {source}")]
    HealthBind {
        /// Port that failed to bind.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The HTTP server task ended unexpectedly.
    #[error("health endpoint server failed: {0}")]
    Server(std::io::Error),
}

impl RuntimeError {
    /// Map this error to the process exit code it corresponds to.
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::HealthBind { .. } => EXIT_HEALTH_BIND_ERROR,
            RuntimeError::Server(_) => EXIT_RUNTIME_ERROR,
        }
    }
}

/// Owns the worker pool and the health/ready/metrics HTTP surface for one
/// consumer process.
pub struct ConsumerRuntime {
    config: ConsumerConfig,
    bus: Arc<dyn Bus>,
    orchestrator: Arc<Orchestrator>,
    metrics: Arc<ConsumerMetrics>,
    readiness: Readiness,
}

impl ConsumerRuntime {
    /// Construct a runtime from its config, bus, and orchestrator.
    pub fn new(config: ConsumerConfig, bus: Arc<dyn Bus>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            bus,
            orchestrator,
            metrics: Arc::new(ConsumerMetrics::new()),
            readiness: Readiness::new(),
        }
    }

    /// Metrics handle, for callers that want to observe counters
    /// independently of the HTTP surface (e.g. in tests).
    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    /// Run the worker pool and HTTP surface until a shutdown signal
    /// arrives, then drain for up to `config.drain_timeout` before
    /// returning. Runs until an external caller race this future against
    /// [`shutdown::signal`] or another cancellation source — this method
    /// itself only returns once fully drained.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let app = http::create_app(self.metrics.clone(), self.readiness.clone(), self.orchestrator.clone());
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.health_port))
            .await
            .map_err(|source| RuntimeError::HealthBind {
                port: self.config.health_port,
                source,
            })?;
        info!(port = self.config.health_port, "health endpoint listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut worker_handles = Vec::with_capacity(self.config.workers);
        for id in 0..self.config.workers {
            let worker = Worker::new(
                id,
                self.config.topic.clone(),
                self.config.max_messages_per_poll,
                self.config.poll_idle_backoff,
                self.bus.clone(),
                self.orchestrator.clone(),
                self.metrics.clone(),
            );
            let rx = shutdown_rx.clone();
            worker_handles.push(tokio::spawn(async move { worker.run_loop(rx).await }));
        }
        self.readiness.set_ready();

        let mut server_shutdown_rx = shutdown_rx.clone();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = server_shutdown_rx.changed().await;
        });

        let server_error = tokio::select! {
            result = server => result.err(),
            _ = shutdown::signal() => {
                self.readiness.set_draining();
                None
            }
        };
        let _ = shutdown_tx.send(true);
        if let Some(err) = &server_error {
            error!(%err, "health endpoint server exited unexpectedly");
        }

        let drain = async {
            for handle in worker_handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.config.drain_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                drain_timeout_secs = self.config.drain_timeout.as_secs(),
                "drain deadline exceeded; exiting with in-flight work abandoned"
            );
        }

        match server_error {
            Some(err) => Err(RuntimeError::Server(err)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use kg_bus_core::{Bus, InMemoryBus};
    use kg_graph_store::InMemoryGraphStore;
    use kg_orchestrator::cache::NoopCacheWarmer;
    use kg_orchestrator::intelligence::{
        ConceptExtraction, DocumentationGeneration, ImportResolution, IntelligenceClient,
        IntelligenceError, QualityScoring, StructureAnalysis,
    };
    use kg_orchestrator::stamping::{StampingClient, StampingError};
    use kg_orchestrator::Orchestrator;
    use kg_schema::validate;
    use kg_types::{topics, EventEnvelope, EventType};
    use kg_vector_store::InMemoryVectorStore;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    struct NoopIntelligence;

    #[async_trait::async_trait]
    impl IntelligenceClient for NoopIntelligence {
        async fn structure_analysis(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<StructureAnalysis, IntelligenceError> {
            Ok(StructureAnalysis::default())
        }
        async fn concept_extraction(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<ConceptExtraction, IntelligenceError> {
            Ok(ConceptExtraction::default())
        }
        async fn quality_scoring(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<QualityScoring, IntelligenceError> {
            Ok(QualityScoring::default())
        }
        async fn import_resolution(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<ImportResolution, IntelligenceError> {
            Ok(ImportResolution::default())
        }
        async fn documentation_generation(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<DocumentationGeneration, IntelligenceError> {
            Ok(DocumentationGeneration::default())
        }
        async fn health_check(&self) -> Result<(), IntelligenceError> {
            Ok(())
        }
    }

    struct AlwaysHealthyStamping;

    #[async_trait::async_trait]
    impl StampingClient for AlwaysHealthyStamping {
        async fn mark_processed(&self, _entity_id: &str) -> Result<(), StampingError> {
            Ok(())
        }
        async fn health_check(&self) -> Result<(), StampingError> {
            Ok(())
        }
    }

    async fn test_orchestrator() -> Arc<Orchestrator> {
        Arc::new(
            Orchestrator::with_cache_warmer(
                Arc::new(NoopIntelligence),
                Arc::new(AlwaysHealthyStamping),
                Arc::new(InMemoryVectorStore::new()),
                Arc::new(InMemoryGraphStore::new()),
                Arc::new(NoopCacheWarmer),
                kg_orchestrator::OrchestratorConfig {
                    project_root: "/repo".to_string(),
                    intelligence_concurrency: 5,
                    ..Default::default()
                },
            )
            .await,
        )
    }

    #[tokio::test]
    async fn happy_path_single_file_enrichment_commits_and_publishes_completion() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::default());
        let orchestrator = test_orchestrator().await;
        let metrics = Arc::new(ConsumerMetrics::new());
        let worker = Worker::new(
            0,
            topics::ENRICHMENT_FILE_REQUESTED.to_string(),
            32,
            std::time::Duration::from_millis(10),
            bus.clone(),
            orchestrator,
            metrics.clone(),
        );

        bus.publish(EventEnvelope {
            correlation_id: Uuid::new_v4(),
            event_type: EventType::EnrichDocumentRequested,
            topic: topics::ENRICHMENT_FILE_REQUESTED.to_string(),
            timestamp: Utc::now(),
            payload: json!({"file_path": "/src/a.py", "content": "x = 1", "project_name": "demo"}),
        })
        .await
        .unwrap();

        let mut completions = bus.subscribe(topics::ENRICHMENT_FILE_COMPLETED);
        let batch = bus
            .poll(topics::ENRICHMENT_FILE_REQUESTED, 10)
            .await
            .unwrap();
        assert_eq!(batch.messages.len(), 1);
        for (offset, envelope) in batch.messages {
            worker.process_one(&envelope).await;
            bus.commit(topics::ENRICHMENT_FILE_REQUESTED, offset)
                .await
                .unwrap();
        }

        assert_eq!(metrics.snapshot(kg_net::BreakerState::Closed).files_processed, 1);
        let completion = completions.try_recv();
        assert!(completion.is_ok());
    }

    #[tokio::test]
    async fn invalid_legacy_payload_is_counted_and_committed_without_orchestration() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::default());
        let orchestrator = test_orchestrator().await;
        let metrics = Arc::new(ConsumerMetrics::new());
        let worker = Worker::new(
            0,
            topics::ENRICHMENT_FILE_REQUESTED.to_string(),
            32,
            std::time::Duration::from_millis(10),
            bus.clone(),
            orchestrator,
            metrics.clone(),
        );

        let envelope = EventEnvelope {
            correlation_id: Uuid::new_v4(),
            event_type: EventType::EnrichDocumentRequested,
            topic: topics::ENRICHMENT_FILE_REQUESTED.to_string(),
            timestamp: Utc::now(),
            payload: json!({"source_path": "/src/a.py", "content": "x"}),
        };
        assert!(matches!(
            validate(&envelope),
            kg_schema::ValidationOutcome::Invalid(
                kg_schema::InvalidReason::LegacyCodeAnalysisOnEnrichmentTopic
            )
        ));

        bus.publish(envelope).await.unwrap();
        let batch = bus
            .poll(topics::ENRICHMENT_FILE_REQUESTED, 10)
            .await
            .unwrap();
        for (offset, envelope) in batch.messages {
            worker.process_one(&envelope).await;
            bus.commit(topics::ENRICHMENT_FILE_REQUESTED, offset)
                .await
                .unwrap();
        }

        assert_eq!(metrics.snapshot(kg_net::BreakerState::Closed).files_processed, 0);
        assert_eq!(metrics.snapshot(kg_net::BreakerState::Closed).invalid_events.total, 1);
        let remaining = bus
            .poll(topics::ENRICHMENT_FILE_REQUESTED, 10)
            .await
            .unwrap();
        assert!(remaining.messages.is_empty());
    }

    #[tokio::test]
    async fn reingesting_identical_file_twice_is_idempotent() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::default());
        let orchestrator = test_orchestrator().await;
        let metrics = Arc::new(ConsumerMetrics::new());
        let worker = Worker::new(
            0,
            topics::ENRICHMENT_FILE_REQUESTED.to_string(),
            32,
            std::time::Duration::from_millis(10),
            bus.clone(),
            orchestrator,
            metrics,
        );

        for _ in 0..2 {
            bus.publish(EventEnvelope {
                correlation_id: Uuid::new_v4(),
                event_type: EventType::EnrichDocumentRequested,
                topic: topics::ENRICHMENT_FILE_REQUESTED.to_string(),
                timestamp: Utc::now(),
                payload: json!({"file_path": "/src/a.py", "content": "x = 1", "project_name": "demo"}),
            })
            .await
            .unwrap();
            let batch = bus
                .poll(topics::ENRICHMENT_FILE_REQUESTED, 10)
                .await
                .unwrap();
            for (offset, envelope) in batch.messages {
                worker.process_one(&envelope).await;
                bus.commit(topics::ENRICHMENT_FILE_REQUESTED, offset)
                    .await
                    .unwrap();
            }
        }
    }

    struct TwoFileImports;

    #[async_trait::async_trait]
    impl IntelligenceClient for TwoFileImports {
        async fn structure_analysis(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<StructureAnalysis, IntelligenceError> {
            Ok(StructureAnalysis::default())
        }
        async fn concept_extraction(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<ConceptExtraction, IntelligenceError> {
            Ok(ConceptExtraction::default())
        }
        async fn quality_scoring(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<QualityScoring, IntelligenceError> {
            Ok(QualityScoring::default())
        }
        async fn import_resolution(
            &self,
            file: &kg_types::FileRecord,
        ) -> Result<ImportResolution, IntelligenceError> {
            if file.absolute_path.ends_with("b.py") {
                Ok(ImportResolution {
                    imports: vec![kg_orchestrator::intelligence::ImportEdge {
                        imported_path: "a".to_string(),
                        resolved_path: Some("/src/a.py".to_string()),
                    }],
                })
            } else {
                Ok(ImportResolution::default())
            }
        }
        async fn documentation_generation(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<DocumentationGeneration, IntelligenceError> {
            Ok(DocumentationGeneration::default())
        }
        async fn health_check(&self) -> Result<(), IntelligenceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn batch_enrichment_resolves_imports_across_two_files() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::default());
        let orchestrator = Arc::new(
            Orchestrator::with_cache_warmer(
                Arc::new(TwoFileImports),
                Arc::new(AlwaysHealthyStamping),
                Arc::new(InMemoryVectorStore::new()),
                Arc::new(InMemoryGraphStore::new()),
                Arc::new(NoopCacheWarmer),
                kg_orchestrator::OrchestratorConfig {
                    project_root: "/repo".to_string(),
                    intelligence_concurrency: 5,
                    ..Default::default()
                },
            )
            .await,
        );
        let metrics = Arc::new(ConsumerMetrics::new());
        let worker = Worker::new(
            0,
            topics::ENRICHMENT_FILE_REQUESTED.to_string(),
            32,
            std::time::Duration::from_millis(10),
            bus.clone(),
            orchestrator,
            metrics.clone(),
        );

        bus.publish(EventEnvelope {
            correlation_id: Uuid::new_v4(),
            event_type: EventType::EnrichDocumentRequested,
            topic: topics::ENRICHMENT_FILE_REQUESTED.to_string(),
            timestamp: Utc::now(),
            payload: json!({"files": [
                {"file_path": "/src/a.py", "content": "x = 1", "project_name": "demo"},
                {"file_path": "/src/b.py", "content": "import a", "project_name": "demo"},
            ]}),
        })
        .await
        .unwrap();

        let batch = bus
            .poll(topics::ENRICHMENT_FILE_REQUESTED, 10)
            .await
            .unwrap();
        for (offset, envelope) in batch.messages {
            worker.process_one(&envelope).await;
            bus.commit(topics::ENRICHMENT_FILE_REQUESTED, offset)
                .await
                .unwrap();
        }

        let snapshot = metrics.snapshot(kg_net::BreakerState::Closed);
        assert_eq!(snapshot.files_processed, 1);
        assert!(snapshot.relationships_created >= 1);
    }

    struct UnhealthyStamping;

    #[async_trait::async_trait]
    impl StampingClient for UnhealthyStamping {
        async fn mark_processed(&self, _entity_id: &str) -> Result<(), StampingError> {
            Ok(())
        }
        async fn health_check(&self) -> Result<(), StampingError> {
            Err(StampingError::Transport("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn stamping_service_unreachable_selects_http_fallback_mode() {
        let orchestrator = Orchestrator::with_cache_warmer(
            Arc::new(NoopIntelligence),
            Arc::new(UnhealthyStamping),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(NoopCacheWarmer),
            kg_orchestrator::OrchestratorConfig::default(),
        )
        .await;
        assert_eq!(orchestrator.mode(), kg_orchestrator::Mode::HttpFallback);
    }

    struct UnhealthyIntelligence;

    #[async_trait::async_trait]
    impl IntelligenceClient for UnhealthyIntelligence {
        async fn structure_analysis(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<StructureAnalysis, IntelligenceError> {
            Ok(StructureAnalysis::default())
        }
        async fn concept_extraction(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<ConceptExtraction, IntelligenceError> {
            Ok(ConceptExtraction::default())
        }
        async fn quality_scoring(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<QualityScoring, IntelligenceError> {
            Ok(QualityScoring::default())
        }
        async fn import_resolution(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<ImportResolution, IntelligenceError> {
            Ok(ImportResolution::default())
        }
        async fn documentation_generation(
            &self,
            _file: &kg_types::FileRecord,
        ) -> Result<DocumentationGeneration, IntelligenceError> {
            Ok(DocumentationGeneration::default())
        }
        async fn health_check(&self) -> Result<(), IntelligenceError> {
            Err(IntelligenceError::Transport("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn readiness_reflects_live_intelligence_health_and_breaker_state() {
        let orchestrator = Orchestrator::with_cache_warmer(
            Arc::new(UnhealthyIntelligence),
            Arc::new(AlwaysHealthyStamping),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(NoopCacheWarmer),
            kg_orchestrator::OrchestratorConfig::default(),
        )
        .await;
        assert!(!orchestrator.intelligence_healthy().await);
        assert_eq!(orchestrator.circuit_breaker_state(), kg_net::BreakerState::Closed);

        let healthy_orchestrator = test_orchestrator().await;
        assert!(healthy_orchestrator.intelligence_healthy().await);
    }

    #[tokio::test]
    async fn worker_stops_within_drain_window_after_shutdown_signal() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::default());
        let orchestrator = test_orchestrator().await;
        let metrics = Arc::new(ConsumerMetrics::new());
        let worker = Worker::new(
            0,
            topics::ENRICHMENT_FILE_REQUESTED.to_string(),
            32,
            std::time::Duration::from_millis(10),
            bus.clone(),
            orchestrator,
            metrics,
        );

        bus.publish(EventEnvelope {
            correlation_id: Uuid::new_v4(),
            event_type: EventType::EnrichDocumentRequested,
            topic: topics::ENRICHMENT_FILE_REQUESTED.to_string(),
            timestamp: Utc::now(),
            payload: json!({"file_path": "/src/a.py", "content": "x = 1", "project_name": "demo"}),
        })
        .await
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run_loop(shutdown_rx).await });
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("worker should stop before the drain deadline")
            .expect("worker task should not panic");
    }
}
