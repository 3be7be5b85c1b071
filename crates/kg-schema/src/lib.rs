#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **kg-schema** – Event envelope classification and schema validation (C1).
//!
//! Accepts a raw bus message (already decoded to JSON by the transport
//! layer), classifies it by topic and event type, and enforces the
//! minimal structural invariants required before the orchestrator (C5)
//! is ever invoked. Invalid messages are never retried and never sent to
//! a dead-letter topic — they are counted and skipped so the consumer
//! can commit past them immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use kg_types::{topics, EventEnvelope, EventType};
use tracing::{error, warn};
use uuid::Uuid;

//─────────────────────────────
//  Parsed event classes
//─────────────────────────────

/// A single file entry inside a batch enrichment or tree-index request.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEnrichRequest {
    /// Absolute or ingester-relative path of the file.
    pub file_path: String,
    /// Inline file content.
    pub content: String,
    /// Owning project name.
    pub project_name: String,
}

/// The event class a validated envelope was recognised as, pre-parsed so
/// C5 never has to re-inspect the raw payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventClass {
    /// Legacy single-file code analysis request.
    CodeAnalysisRequested {
        /// File path (normalised from `file_path` or legacy `source_path`).
        file_path: String,
        /// Inline file content.
        content: String,
    },
    /// Single-file enrichment request.
    EnrichSingle {
        /// File path.
        file_path: String,
        /// Inline file content.
        content: String,
        /// Owning project name.
        project_name: String,
    },
    /// Batch enrichment request.
    EnrichBatch {
        /// Files to enrich.
        files: Vec<FileEnrichRequest>,
    },
    /// Bulk project ingest request.
    TreeIndexProject {
        /// Files to index.
        files: Vec<FileEnrichRequest>,
    },
    /// A pass-through lifecycle event (`...completed`/`...failed`) that
    /// carries no payload validation contract.
    Lifecycle,
}

/// An envelope that passed C1 validation, tagged with its event class.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    /// The original envelope.
    pub envelope: EventEnvelope,
    /// Recognised event class.
    pub class: EventClass,
}

//─────────────────────────────
//  Invalid reasons
//─────────────────────────────

/// Closed set of reasons a message is quarantined (skipped + counted).
///
/// `Display` renders the exact human-readable text used as the
/// `invalid_events.by_reason` metric key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidReason {
    /// Envelope lacks a well-formed `correlation_id`.
    MissingCorrelationId,
    /// Envelope JSON could not be parsed into the expected shape at all.
    MalformedEnvelope,
    /// A recognised event type is missing one or more required fields.
    MissingRequiredFields {
        /// The event type that failed validation.
        event_type: &'static str,
    },
    /// A legacy code-analysis payload landed on an enrichment topic,
    /// classified distinctly from a generic missing-fields error so it can
    /// be tracked and alerted on separately.
    LegacyCodeAnalysisOnEnrichmentTopic,
    /// The event type/topic pair is not recognised at all.
    UnrecognisedEvent,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidReason::MissingCorrelationId => {
                write!(f, "Envelope missing a valid correlation_id")
            }
            InvalidReason::MalformedEnvelope => write!(f, "Envelope payload is not valid JSON"),
            InvalidReason::MissingRequiredFields { event_type } => write!(
                f,
                "Required fields missing for event type \"{event_type}\""
            ),
            InvalidReason::LegacyCodeAnalysisOnEnrichmentTopic => {
                write!(f, "Old code-analysis schema detected in enrichment topic")
            }
            InvalidReason::UnrecognisedEvent => write!(f, "unrecognised_event"),
        }
    }
}

/// Result of validating one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// The envelope is processable; `ParsedEvent` carries its class.
    Valid(ParsedEvent),
    /// The envelope must be skipped and counted under `InvalidReason`.
    Invalid(InvalidReason),
}

//─────────────────────────────
//  Validation entry point
//─────────────────────────────

fn str_field(payload: &serde_json::Value, key: &str) -> Option<String> {
    payload.get(key)?.as_str().map(str::to_owned)
}

fn is_lifecycle_event(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::EnrichmentFileCompleted
            | EventType::EnrichmentFileFailed
            | EventType::TreeIndexProjectCompleted
            | EventType::TreeIndexProjectFailed
    )
}

fn parse_file_entries(payload: &serde_json::Value) -> Option<Vec<FileEnrichRequest>> {
    let files = payload.get("files")?.as_array()?;
    let mut out = Vec::with_capacity(files.len());
    for entry in files {
        let file_path = str_field(entry, "file_path")?;
        let content = str_field(entry, "content")?;
        let project_name = str_field(entry, "project_name").unwrap_or_default();
        out.push(FileEnrichRequest {
            file_path,
            content,
            project_name,
        });
    }
    Some(out)
}

/// Validate an already-decoded envelope against the structural invariants
/// for its event type.
pub fn validate(envelope: &EventEnvelope) -> ValidationOutcome {
    if envelope.correlation_id == Uuid::nil() {
        return ValidationOutcome::Invalid(InvalidReason::MissingCorrelationId);
    }

    let payload = &envelope.payload;

    match envelope.event_type {
        EventType::CodeAnalysisRequested => {
            let file_path = str_field(payload, "file_path").or_else(|| str_field(payload, "source_path"));
            let content = str_field(payload, "content");
            match (file_path, content) {
                (Some(file_path), Some(content)) => {
                    ValidationOutcome::Valid(ParsedEvent {
                        envelope: envelope.clone(),
                        class: EventClass::CodeAnalysisRequested { file_path, content },
                    })
                }
                _ => ValidationOutcome::Invalid(InvalidReason::MissingRequiredFields {
                    event_type: "code-analysis-requested",
                }),
            }
        }
        EventType::EnrichDocumentRequested => {
            let file_path = str_field(payload, "file_path");
            let content = str_field(payload, "content");
            let project_name = str_field(payload, "project_name");
            let source_path = str_field(payload, "source_path");

            if let (Some(file_path), Some(content), Some(project_name)) =
                (file_path.clone(), content.clone(), project_name.clone())
            {
                return ValidationOutcome::Valid(ParsedEvent {
                    envelope: envelope.clone(),
                    class: EventClass::EnrichSingle {
                        file_path,
                        content,
                        project_name,
                    },
                });
            }

            if let Some(files) = parse_file_entries(payload) {
                return ValidationOutcome::Valid(ParsedEvent {
                    envelope: envelope.clone(),
                    class: EventClass::EnrichBatch { files },
                });
            }

            // Anti-pattern: a legacy {source_path, content} payload (no
            // project_name, no file_path, no batch) on an enrichment topic.
            if source_path.is_some() && content.is_some() && file_path.is_none() {
                return ValidationOutcome::Invalid(
                    InvalidReason::LegacyCodeAnalysisOnEnrichmentTopic,
                );
            }

            ValidationOutcome::Invalid(InvalidReason::MissingRequiredFields {
                event_type: "enrich-document-requested",
            })
        }
        EventType::TreeIndexProjectRequested => match parse_file_entries(payload) {
            Some(files) => ValidationOutcome::Valid(ParsedEvent {
                envelope: envelope.clone(),
                class: EventClass::TreeIndexProject { files },
            }),
            None => ValidationOutcome::Invalid(InvalidReason::MissingRequiredFields {
                event_type: "tree.index-project-requested",
            }),
        },
        event_type if is_lifecycle_event(event_type) => ValidationOutcome::Valid(ParsedEvent {
            envelope: envelope.clone(),
            class: EventClass::Lifecycle,
        }),
        _ => ValidationOutcome::Invalid(InvalidReason::UnrecognisedEvent),
    }
}

//─────────────────────────────
//  Skip counter / metrics
//─────────────────────────────

/// Monotonic counter of invalid events skipped this process lifetime, with
/// a per-reason breakdown exposed as the `invalid_events` metric.
#[derive(Default)]
pub struct SkipCounter {
    total: AtomicU64,
    by_reason: Mutex<HashMap<String, u64>>,
}

impl SkipCounter {
    /// Create a fresh, zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one skipped event, logging a structured warning and, every
    /// 100th skip, a higher-severity alert with the full breakdown.
    pub fn record(&self, envelope: &EventEnvelope, reason: &InvalidReason) {
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        let mut by_reason = self.by_reason.lock().expect("skip counter mutex poisoned");
        *by_reason.entry(reason.to_string()).or_insert(0) += 1;

        let payload_keys: Vec<&str> = envelope
            .payload
            .as_object()
            .map(|obj| obj.keys().map(String::as_str).collect())
            .unwrap_or_default();

        warn!(
            correlation_id = %envelope.correlation_id,
            topic = %envelope.topic,
            ?payload_keys,
            total_skipped = total,
            reason = %reason,
            "skipping invalid event"
        );

        if total % 100 == 0 {
            let breakdown = self.breakdown_locked(&by_reason);
            error!(
                total_skipped = total,
                ?breakdown,
                "invalid-event alert threshold reached"
            );
        }
    }

    /// Total events skipped since process start.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Breakdown by reason, ordered descending by count.
    pub fn breakdown(&self) -> Vec<(String, u64)> {
        let by_reason = self.by_reason.lock().expect("skip counter mutex poisoned");
        self.breakdown_locked(&by_reason)
    }

    fn breakdown_locked(&self, by_reason: &HashMap<String, u64>) -> Vec<(String, u64)> {
        let mut entries: Vec<_> = by_reason.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn envelope(event_type: EventType, topic: &str, payload: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            correlation_id: Uuid::new_v4(),
            event_type,
            topic: topic.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    #[test]
    fn valid_single_enrich_request_is_accepted() {
        let env = envelope(
            EventType::EnrichDocumentRequested,
            topics::ENRICHMENT_FILE_REQUESTED,
            json!({"file_path": "/src/main.py", "content": "x", "project_name": "demo"}),
        );
        match validate(&env) {
            ValidationOutcome::Valid(parsed) => {
                assert!(matches!(parsed.class, EventClass::EnrichSingle { .. }));
            }
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[test]
    fn legacy_code_analysis_on_enrichment_topic_is_classified_distinctly() {
        let env = envelope(
            EventType::EnrichDocumentRequested,
            topics::ENRICHMENT_FILE_REQUESTED,
            json!({"source_path": "/src/main.py", "content": "x"}),
        );
        let outcome = validate(&env);
        assert_eq!(
            outcome,
            ValidationOutcome::Invalid(InvalidReason::LegacyCodeAnalysisOnEnrichmentTopic)
        );
        if let ValidationOutcome::Invalid(reason) = outcome {
            assert_eq!(
                reason.to_string(),
                "Old code-analysis schema detected in enrichment topic"
            );
        }
    }

    #[test]
    fn nil_correlation_id_is_invalid() {
        let mut env = envelope(
            EventType::EnrichDocumentRequested,
            topics::ENRICHMENT_FILE_REQUESTED,
            json!({"file_path": "/a", "content": "x", "project_name": "p"}),
        );
        env.correlation_id = Uuid::nil();
        assert_eq!(
            validate(&env),
            ValidationOutcome::Invalid(InvalidReason::MissingCorrelationId)
        );
    }

    #[test]
    fn skip_counter_tracks_breakdown_descending() {
        let counter = SkipCounter::new();
        let env = envelope(
            EventType::EnrichDocumentRequested,
            topics::ENRICHMENT_FILE_REQUESTED,
            json!({}),
        );
        counter.record(&env, &InvalidReason::MissingRequiredFields {
            event_type: "enrich-document-requested",
        });
        counter.record(&env, &InvalidReason::LegacyCodeAnalysisOnEnrichmentTopic);
        counter.record(&env, &InvalidReason::LegacyCodeAnalysisOnEnrichmentTopic);
        assert_eq!(counter.total(), 3);
        let breakdown = counter.breakdown();
        assert_eq!(breakdown[0].0, "Old code-analysis schema detected in enrichment topic");
        assert_eq!(breakdown[0].1, 2);
    }

    #[test]
    fn lifecycle_events_pass_through_without_payload_checks() {
        let env = envelope(
            EventType::EnrichmentFileCompleted,
            topics::ENRICHMENT_FILE_COMPLETED,
            json!({"anything": true}),
        );
        assert!(matches!(
            validate(&env),
            ValidationOutcome::Valid(ParsedEvent { class: EventClass::Lifecycle, .. })
        ));
    }
}
