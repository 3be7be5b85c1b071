//! The pull → validate → orchestrate → commit loop (§4.6): one worker
//! owns one topic cursor and never commits an offset until whatever work
//! it implied — nothing for invalid/lifecycle events, a full orchestration
//! for enrichment events — has returned.

use std::sync::Arc;

use chrono::Utc;
use kg_bus_core::Bus;
use kg_orchestrator::{EnrichmentOutcome, Orchestrator};
use kg_schema::{validate, EventClass, FileEnrichRequest, ValidationOutcome};
use kg_types::{topics, EventEnvelope, EventType, FileRecord};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::metrics::ConsumerMetrics;

fn file_record(project_name: String, file_path: String, content: String) -> FileRecord {
    FileRecord {
        relative_path: file_path.clone(),
        absolute_path: file_path,
        project_name,
        content: content.into_bytes(),
        language: String::new(),
        last_modified: Utc::now(),
    }
}

/// One pull-loop worker. Multiple workers may share a topic; the `Bus`
/// implementation is responsible for making concurrent `poll`/`commit`
/// calls on the same topic safe.
pub struct Worker {
    id: usize,
    topic: String,
    max_messages_per_poll: usize,
    poll_idle_backoff: std::time::Duration,
    bus: Arc<dyn Bus>,
    orchestrator: Arc<Orchestrator>,
    metrics: Arc<ConsumerMetrics>,
}

impl Worker {
    /// Construct a worker bound to `topic` on `bus`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        topic: String,
        max_messages_per_poll: usize,
        poll_idle_backoff: std::time::Duration,
        bus: Arc<dyn Bus>,
        orchestrator: Arc<Orchestrator>,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        Self {
            id,
            topic,
            max_messages_per_poll,
            poll_idle_backoff,
            bus,
            orchestrator,
            metrics,
        }
    }

    /// Run until `shutdown` reports true, then return once the in-flight
    /// batch (if any) has finished committing.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = self.id, topic = %self.topic, "worker starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                result = self.bus.poll(&self.topic, self.max_messages_per_poll) => result,
            };
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    error!(worker_id = self.id, topic = %self.topic, %err, "poll failed");
                    tokio::time::sleep(self.poll_idle_backoff).await;
                    continue;
                }
            };
            self.metrics.record_lag(&self.topic, batch.lag_hint);
            if batch.messages.is_empty() {
                tokio::time::sleep(self.poll_idle_backoff).await;
                continue;
            }
            for (offset, envelope) in batch.messages {
                self.process_one(&envelope).await;
                if let Err(err) = self.bus.commit(&self.topic, offset).await {
                    error!(worker_id = self.id, topic = %self.topic, offset, %err, "commit failed");
                }
            }
        }
        info!(worker_id = self.id, topic = %self.topic, "worker stopped");
    }

    /// Validate and, if valid, fully process one envelope. Visible to the
    /// crate's integration tests so they can drive a worker without
    /// spawning its `run_loop`.
    pub(crate) async fn process_one(&self, envelope: &EventEnvelope) {
        match validate(envelope) {
            ValidationOutcome::Invalid(reason) => {
                self.metrics.skip_counter.record(envelope, &reason);
            }
            ValidationOutcome::Valid(parsed) => match parsed.class {
                EventClass::Lifecycle => {}
                EventClass::CodeAnalysisRequested { file_path, content } => {
                    self.enrich_one(envelope, String::new(), file_path, content).await;
                }
                EventClass::EnrichSingle {
                    file_path,
                    content,
                    project_name,
                } => {
                    self.enrich_one(envelope, project_name, file_path, content).await;
                }
                EventClass::EnrichBatch { files } => {
                    self.enrich_many(envelope, files, false).await;
                }
                EventClass::TreeIndexProject { files } => {
                    self.enrich_many(envelope, files, true).await;
                }
            },
        }
    }

    async fn enrich_one(
        &self,
        envelope: &EventEnvelope,
        project_name: String,
        file_path: String,
        content: String,
    ) {
        let file = file_record(project_name, file_path.clone(), content);
        match self
            .orchestrator
            .enrich_file(&file, envelope.correlation_id)
            .await
        {
            Ok(EnrichmentOutcome::Processed(summary)) => {
                self.metrics.record_processed(
                    summary.entities_created as u64,
                    summary.relationships_created as u64,
                );
                let derived = envelope.derive(
                    EventType::EnrichmentFileCompleted,
                    topics::ENRICHMENT_FILE_COMPLETED,
                    json!({
                        "file_path": file_path,
                        "file_entity_id": summary.file_entity_id,
                        "entities_created": summary.entities_created,
                        "relationships_created": summary.relationships_created,
                    }),
                );
                if let Err(err) = self.bus.publish(derived).await {
                    warn!(%err, "failed to publish completion event");
                }
            }
            Ok(EnrichmentOutcome::Skipped(reason)) => {
                self.metrics.record_skipped();
                info!(file_path = %file_path, ?reason, "file skipped");
            }
            Err(err) => {
                self.metrics.record_failed(err.kind());
                error!(file_path = %file_path, %err, "enrichment failed");
                let derived = envelope.derive(
                    EventType::EnrichmentFileFailed,
                    topics::ENRICHMENT_FILE_FAILED,
                    json!({"file_path": file_path, "error": err.to_string()}),
                );
                if let Err(err) = self.bus.publish(derived).await {
                    warn!(%err, "failed to publish failure event");
                }
            }
        }
    }

    async fn enrich_many(&self, envelope: &EventEnvelope, files: Vec<FileEnrichRequest>, is_tree_index: bool) {
        let records: Vec<FileRecord> = files
            .into_iter()
            .map(|f| file_record(f.project_name, f.file_path, f.content))
            .collect();
        let outcome = self
            .orchestrator
            .enrich_batch(&records, envelope.correlation_id)
            .await;
        self.metrics
            .record_processed(outcome.entities_created as u64, outcome.relationships_created as u64);
        for _ in 0..outcome.files_skipped {
            self.metrics.record_skipped();
        }
        for (_, kind, _) in &outcome.failed_files {
            self.metrics.record_failed(kind);
        }
        let (completed_type, completed_topic, failed_type, failed_topic) = if is_tree_index {
            (
                EventType::TreeIndexProjectCompleted,
                topics::TREE_INDEX_PROJECT_COMPLETED,
                EventType::TreeIndexProjectFailed,
                topics::TREE_INDEX_PROJECT_FAILED,
            )
        } else {
            (
                EventType::EnrichmentFileCompleted,
                topics::ENRICHMENT_FILE_COMPLETED,
                EventType::EnrichmentFileFailed,
                topics::ENRICHMENT_FILE_FAILED,
            )
        };
        let derived = if outcome.failed_files.is_empty() {
            envelope.derive(
                completed_type,
                completed_topic,
                json!({
                    "files_indexed": outcome.files_indexed,
                    "files_skipped": outcome.files_skipped,
                    "entities_created": outcome.entities_created,
                    "relationships_created": outcome.relationships_created,
                    "unresolved_imports": outcome.unresolved_imports,
                }),
            )
        } else {
            envelope.derive(
                failed_type,
                failed_topic,
                json!({
                    "files_indexed": outcome.files_indexed,
                    "failed_files": outcome.failed_files,
                }),
            )
        };
        if let Err(err) = self.bus.publish(derived).await {
            warn!(%err, "failed to publish batch result event");
        }
    }
}
