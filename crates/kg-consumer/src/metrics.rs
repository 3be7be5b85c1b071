//! Process-wide counters backing the `/metrics` HTTP endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use kg_net::BreakerState;
use kg_schema::SkipCounter;
use serde::Serialize;

/// Shared metrics sink updated by every worker task.
pub struct ConsumerMetrics {
    /// Invalid-event skip counter, broken down by [`kg_schema::InvalidReason`].
    pub skip_counter: SkipCounter,
    started_at: Instant,
    files_processed: AtomicU64,
    files_skipped: AtomicU64,
    files_failed: AtomicU64,
    entities_created: AtomicU64,
    relationships_created: AtomicU64,
    per_topic_lag: Mutex<HashMap<String, u64>>,
    errors_by_kind: Mutex<HashMap<String, u64>>,
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self {
            skip_counter: SkipCounter::default(),
            started_at: Instant::now(),
            files_processed: AtomicU64::new(0),
            files_skipped: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            entities_created: AtomicU64::new(0),
            relationships_created: AtomicU64::new(0),
            per_topic_lag: Mutex::new(HashMap::new()),
            errors_by_kind: Mutex::new(HashMap::new()),
        }
    }
}

/// JSON shape returned by `/metrics`.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since this process started.
    pub uptime: u64,
    /// Invalid-event totals.
    pub invalid_events: InvalidEventsSnapshot,
    /// Files fully enriched.
    pub files_processed: u64,
    /// Files skipped (size-gated), not counted as invalid events.
    pub files_skipped: u64,
    /// Files that errored during orchestration.
    pub files_failed: u64,
    /// Graph entities upserted across this process's lifetime.
    pub entities_created: u64,
    /// Graph relationships upserted across this process's lifetime.
    pub relationships_created: u64,
    /// Consumer lag, in uncommitted messages.
    pub lag: LagSnapshot,
    /// Terminal orchestration failures, broken down by [`kg_orchestrator::EnrichmentError::kind`].
    pub errors: ErrorsSnapshot,
    /// Live state of the intelligence-service circuit breaker.
    pub circuit_breaker: CircuitBreakerSnapshot,
}

/// Terminal-failure breakdown, `by_kind` sorted descending by count.
#[derive(Debug, Serialize)]
pub struct ErrorsSnapshot {
    /// Ordered `(kind, count)` pairs, highest count first.
    pub by_kind: Vec<(String, u64)>,
}

/// Circuit-breaker state as reported on `/metrics`.
#[derive(Debug, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// `"closed"`, `"open"`, or `"half_open"`.
    pub state: &'static str,
}

/// Render a [`BreakerState`] the way `/metrics` and `/ready` report it.
pub fn breaker_state_label(state: BreakerState) -> &'static str {
    match state {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half_open",
    }
}

/// Invalid-event breakdown, `by_reason` sorted descending by count.
#[derive(Debug, Serialize)]
pub struct InvalidEventsSnapshot {
    /// Total invalid events skipped since process start.
    pub total: u64,
    /// Ordered `(reason, count)` pairs, highest count first.
    pub by_reason: Vec<(String, u64)>,
}

/// Consumer lag broken down by topic.
#[derive(Debug, Serialize)]
pub struct LagSnapshot {
    /// Sum of `per_topic` lag.
    pub total: u64,
    /// Per-topic uncommitted-message count, from the most recent poll.
    pub per_topic: HashMap<String, u64>,
}

impl ConsumerMetrics {
    /// Create a fresh, zeroed metrics sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the lag hint returned by the most recent `Bus::poll` on `topic`.
    pub fn record_lag(&self, topic: &str, lag_hint: u64) {
        let mut per_topic = self.per_topic_lag.lock().expect("metrics mutex poisoned");
        per_topic.insert(topic.to_string(), lag_hint);
    }

    /// Record one fully enriched file, with its entity/relationship counts.
    pub fn record_processed(&self, entities_created: u64, relationships_created: u64) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
        self.entities_created
            .fetch_add(entities_created, Ordering::Relaxed);
        self.relationships_created
            .fetch_add(relationships_created, Ordering::Relaxed);
    }

    /// Record one size-gated skip.
    pub fn record_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one orchestration failure of the given [`kind`](kg_orchestrator::EnrichmentError::kind).
    pub fn record_failed(&self, kind: &str) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
        let mut by_kind = self.errors_by_kind.lock().expect("metrics mutex poisoned");
        *by_kind.entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Snapshot the current counters for `/metrics`, given the downstream
    /// intelligence service's live circuit-breaker state.
    pub fn snapshot(&self, breaker_state: BreakerState) -> MetricsSnapshot {
        let per_topic = self
            .per_topic_lag
            .lock()
            .expect("metrics mutex poisoned")
            .clone();
        let total_lag = per_topic.values().sum();
        let mut by_kind: Vec<(String, u64)> = self
            .errors_by_kind
            .lock()
            .expect("metrics mutex poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        by_kind.sort_by(|a, b| b.1.cmp(&a.1));
        MetricsSnapshot {
            uptime: self.started_at.elapsed().as_secs(),
            invalid_events: InvalidEventsSnapshot {
                total: self.skip_counter.total(),
                by_reason: self.skip_counter.breakdown(),
            },
            files_processed: self.files_processed.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            entities_created: self.entities_created.load(Ordering::Relaxed),
            relationships_created: self.relationships_created.load(Ordering::Relaxed),
            lag: LagSnapshot {
                total: total_lag,
                per_topic,
            },
            errors: ErrorsSnapshot { by_kind },
            circuit_breaker: CircuitBreakerSnapshot {
                state: breaker_state_label(breaker_state),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_aggregates_lag_across_topics() {
        let metrics = ConsumerMetrics::new();
        metrics.record_lag("a", 3);
        metrics.record_lag("b", 5);
        let snapshot = metrics.snapshot(BreakerState::Closed);
        assert_eq!(snapshot.lag.total, 8);
        assert_eq!(snapshot.lag.per_topic.get("a"), Some(&3));
    }

    #[test]
    fn processed_and_failed_counters_increment_independently() {
        let metrics = ConsumerMetrics::new();
        metrics.record_processed(2, 1);
        metrics.record_failed("graph_store");
        metrics.record_skipped();
        let snapshot = metrics.snapshot(BreakerState::Closed);
        assert_eq!(snapshot.files_processed, 1);
        assert_eq!(snapshot.files_failed, 1);
        assert_eq!(snapshot.files_skipped, 1);
        assert_eq!(snapshot.entities_created, 2);
        assert_eq!(snapshot.relationships_created, 1);
        assert_eq!(snapshot.errors.by_kind, vec![("graph_store".to_string(), 1)]);
    }

    #[test]
    fn snapshot_reports_circuit_breaker_state() {
        let metrics = ConsumerMetrics::new();
        let snapshot = metrics.snapshot(BreakerState::Open);
        assert_eq!(snapshot.circuit_breaker.state, "open");
    }
}
