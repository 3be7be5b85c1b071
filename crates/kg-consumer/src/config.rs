//! Layered configuration for the consumer runtime: defaults, overridden by
//! an optional config file, overridden by `KG_`-prefixed environment
//! variables — the order `config::Config` merges sources in.

use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration for a `kg-consumer` process.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Number of worker tasks pulling from `topic` concurrently.
    pub workers: usize,
    /// Topic this process's workers pull from.
    pub topic: String,
    /// Maximum messages pulled per `Bus::poll` call.
    pub max_messages_per_poll: usize,
    /// Sleep between polls when a poll returns no messages.
    #[serde(with = "duration_millis")]
    pub poll_idle_backoff: Duration,
    /// Port the `/health`, `/ready`, `/metrics` HTTP surface binds to.
    pub health_port: u16,
    /// Deadline for in-flight work to finish after a shutdown signal.
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            topic: kg_types::topics::ENRICHMENT_FILE_REQUESTED.to_string(),
            max_messages_per_poll: 32,
            poll_idle_backoff: Duration::from_millis(250),
            health_port: 8900,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The layered `config` build/deserialize step failed.
    #[error("failed to load consumer configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConsumerConfig {
    /// Load configuration: compiled-in defaults, then `config/consumer.toml`
    /// if present, then `KG_*` environment variables, in that precedence
    /// order (later sources win).
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("workers", defaults.workers as i64)?
            .set_default("topic", defaults.topic.clone())?
            .set_default("max_messages_per_poll", defaults.max_messages_per_poll as i64)?
            .set_default(
                "poll_idle_backoff",
                defaults.poll_idle_backoff.as_millis() as i64,
            )?
            .set_default("health_port", defaults.health_port as i64)?
            .set_default("drain_timeout", defaults.drain_timeout.as_millis() as i64)?
            .add_source(config::File::with_name("config/consumer").required(false))
            .add_source(config::Environment::with_prefix("KG").separator("__"));
        let raw = builder.build()?;
        Ok(raw.try_deserialize()?)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ConsumerConfig::default();
        assert!(cfg.workers > 0);
        assert!(cfg.max_messages_per_poll > 0);
        assert_eq!(cfg.topic, kg_types::topics::ENRICHMENT_FILE_REQUESTED);
    }
}
