//! Offload context configuration.
//!
//! Defaults match a single accelerator with eight active instances. A config
//! can be loaded from JSON or overlaid from `PAILLIER_HYBRID_*` environment
//! variables.

use std::{env, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigError, ContextError},
    hybrid::{HybridConfig, HybridMode},
    offload::DeadlineFlush,
};

pub const ENV_INSTANCES: &str = "PAILLIER_HYBRID_INSTANCES";
pub const ENV_BUFFERS: &str = "PAILLIER_HYBRID_BUFFERS";
pub const ENV_BATCH: &str = "PAILLIER_HYBRID_BATCH";
pub const ENV_QUEUE: &str = "PAILLIER_HYBRID_QUEUE";
pub const ENV_PIN: &str = "PAILLIER_HYBRID_PIN";
pub const ENV_MODE: &str = "PAILLIER_HYBRID_MODE";

/// When a partially filled buffer is handed to the instances.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Flush after this long without a new arrival.
    pub idle_micros: Option<u64>,
    /// Flush once the oldest request has waited this long.
    pub max_age_micros: Option<u64>,
    /// Manager wake-up period while waiting for arrivals.
    pub tick_micros: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            idle_micros: Some(200),
            max_age_micros: Some(2_000),
            tick_micros: 100,
        }
    }
}

impl FlushConfig {
    pub fn policy(&self) -> DeadlineFlush {
        DeadlineFlush {
            idle: self.idle_micros.map(Duration::from_micros),
            max_age: self.max_age_micros.map(Duration::from_micros),
            tick: Duration::from_micros(self.tick_micros.max(1)),
        }
    }
}

/// Completion polling of a submitted batch, with exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_interval_micros: u64,
    pub max_interval_micros: u64,
    /// Polls before the batch is declared lost.
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_micros: 10,
            max_interval_micros: 1_000,
            max_attempts: 20_000,
        }
    }
}

impl PollConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_micros(self.initial_interval_micros)
    }

    pub fn next_interval(&self, current: Duration) -> Duration {
        (current * 2).clamp(
            Duration::from_micros(1),
            Duration::from_micros(self.max_interval_micros.max(1)),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub instances: usize,
    pub buffer_count: usize,
    /// Requests per outstanding buffer; `None` uses the driver's preferred size.
    pub batch_size: Option<usize>,
    pub submission_queue_depth: usize,
    pub flush: FlushConfig,
    pub poll: PollConfig,
    pub pin_threads: bool,
    pub hybrid: HybridConfig,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            instances: 8,
            buffer_count: 16,
            batch_size: None,
            submission_queue_depth: 1024,
            flush: FlushConfig::default(),
            poll: PollConfig::default(),
            pin_threads: true,
            hybrid: HybridConfig::default(),
        }
    }
}

impl OffloadConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overlaid with the `PAILLIER_HYBRID_*` environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| env::var(name).ok())
    }

    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = parse_var(&lookup, ENV_INSTANCES)? {
            self.instances = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_BUFFERS)? {
            self.buffer_count = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_BATCH)? {
            self.batch_size = Some(v);
        }
        if let Some(v) = parse_var(&lookup, ENV_QUEUE)? {
            self.submission_queue_depth = v;
        }
        if let Some(v) = parse_var(&lookup, ENV_PIN)? {
            self.pin_threads = v;
        }
        if let Some(raw) = lookup(ENV_MODE) {
            self.hybrid.mode = raw.parse::<HybridMode>()?;
        }
        Ok(self)
    }

    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_buffers(mut self, count: usize, batch_size: usize) -> Self {
        self.buffer_count = count;
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.submission_queue_depth = depth;
        self
    }

    pub fn with_hybrid(mut self, hybrid: HybridConfig) -> Self {
        self.hybrid = hybrid;
        self
    }

    pub fn with_pinning(mut self, pin: bool) -> Self {
        self.pin_threads = pin;
        self
    }

    pub fn with_flush(mut self, flush: FlushConfig) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if self.instances == 0 {
            return Err(ContextError::InvalidConfig("instances must be non-zero"));
        }
        if self.buffer_count == 0 {
            return Err(ContextError::InvalidConfig("buffer_count must be non-zero"));
        }
        if self.batch_size == Some(0) {
            return Err(ContextError::InvalidConfig("batch_size must be non-zero"));
        }
        if self.submission_queue_depth == 0 {
            return Err(ContextError::InvalidConfig(
                "submission_queue_depth must be non-zero",
            ));
        }
        if self.poll.max_attempts == 0 {
            return Err(ContextError::InvalidConfig("poll.max_attempts must be non-zero"));
        }
        // a partial buffer would wait for more requests indefinitely
        if self.flush.idle_micros.is_none() && self.flush.max_age_micros.is_none() {
            return Err(ContextError::InvalidConfig(
                "flush needs idle_micros or max_age_micros",
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Env { name, value })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let cfg = OffloadConfig::from_json_str(
            r#"{ "instances": 2, "batch_size": 4, "hybrid": { "mode": "Optimal" } }"#,
        )
        .unwrap();
        assert_eq!(cfg.instances, 2);
        assert_eq!(cfg.batch_size, Some(4));
        assert_eq!(cfg.buffer_count, 16);
        assert_eq!(cfg.hybrid.mode, HybridMode::Optimal);
        assert_eq!(cfg.hybrid.workload_threshold, 128);
        assert!(OffloadConfig::from_json_str("{ instances: }").is_err());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_INSTANCES, "3"),
            (ENV_BATCH, "32"),
            (ENV_PIN, "false"),
            (ENV_MODE, "pref_qat40"),
        ]
        .into_iter()
        .collect();
        let cfg = OffloadConfig::default()
            .with_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.instances, 3);
        assert_eq!(cfg.batch_size, Some(32));
        assert!(!cfg.pin_threads);
        assert_eq!(cfg.hybrid.mode, HybridMode::Fixed(40));
    }

    #[test]
    fn bad_env_value_is_reported() {
        let err = OffloadConfig::default()
            .with_overrides(|name| (name == ENV_QUEUE).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: ENV_QUEUE, .. }));
    }

    #[test]
    fn validation_rejects_zero_sizes() {
        assert!(OffloadConfig::default().validate().is_ok());
        assert!(OffloadConfig::default().with_instances(0).validate().is_err());
        assert!(OffloadConfig::default().with_buffers(4, 0).validate().is_err());
        assert!(OffloadConfig::default().with_queue_depth(0).validate().is_err());
    }

    #[test]
    fn validation_requires_a_flush_deadline() {
        let no_deadline = FlushConfig {
            idle_micros: None,
            max_age_micros: None,
            ..FlushConfig::default()
        };
        assert!(matches!(
            OffloadConfig::default().with_flush(no_deadline).validate(),
            Err(ContextError::InvalidConfig(_))
        ));

        let age_only = FlushConfig {
            idle_micros: None,
            ..FlushConfig::default()
        };
        assert!(OffloadConfig::default().with_flush(age_only).validate().is_ok());
    }

    #[test]
    fn poll_backoff_is_capped() {
        let poll = PollConfig::default();
        let mut interval = poll.initial_interval();
        for _ in 0..20 {
            interval = poll.next_interval(interval);
        }
        assert_eq!(interval, Duration::from_micros(1_000));
    }
}
