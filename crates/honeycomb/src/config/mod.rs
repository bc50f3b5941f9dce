//! Configuration for the honeycomb loader.
//!
//! Every section has defaults, so an empty file (or no file) is valid. CLI
//! flags override the values loaded here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use honeycomb_core::config::{KB, MB, MetricsConfig, parse_yaml, read_yaml};
use honeycomb_core::error::InvalidValueSnafu;

use crate::error::ConfigError;

/// Storage target settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Path to the SQLite database.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// How long SQLite waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("honeycomb.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Reading and batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    /// Target records per committed batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Floor for adaptive shrinking.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    /// A batch is committed early once its records exceed this many bytes.
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// Lines sampled for format detection.
    #[serde(default = "default_sample_lines")]
    pub sample_lines: usize,
    /// Largest multi-line object reassembled before it is cut off.
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
    /// Records buffered between reader and committer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Sources read concurrently by the bulk loader.
    #[serde(default = "default_max_concurrent_sources")]
    pub max_concurrent_sources: usize,
    /// Abort a run after this many quarantined records (0 = unlimited).
    #[serde(default)]
    pub max_quarantined: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_bytes: default_max_batch_bytes(),
            sample_lines: default_sample_lines(),
            max_record_bytes: default_max_record_bytes(),
            channel_capacity: default_channel_capacity(),
            max_concurrent_sources: default_max_concurrent_sources(),
            max_quarantined: 0,
        }
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_min_batch_size() -> usize {
    16
}

fn default_max_batch_bytes() -> usize {
    8 * MB
}

fn default_sample_lines() -> usize {
    crate::source::detect::DEFAULT_SAMPLE_LINES
}

fn default_max_record_bytes() -> usize {
    MB
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_max_concurrent_sources() -> usize {
    4
}

/// Schema validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Maximum length in characters for fields stored in fixed-width columns.
    #[serde(default = "default_field_limits")]
    pub field_limits: IndexMap<String, usize>,
    /// Appended to truncated values; counted within the limit.
    #[serde(default = "default_truncation_marker")]
    pub truncation_marker: String,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            field_limits: default_field_limits(),
            truncation_marker: default_truncation_marker(),
        }
    }
}

fn default_field_limits() -> IndexMap<String, usize> {
    [
        ("eventid", 128),
        ("event_type", 128),
        ("session", 64),
        ("session_id", 64),
        ("src_ip", 64),
        ("dst_ip", 64),
        ("protocol", 32),
        ("username", 256),
        ("password", 256),
        ("input", 4 * KB),
        ("version", 256),
        ("url", 2 * KB),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_truncation_marker() -> String {
    "…[truncated]".to_string()
}

/// Backoff for transient storage errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given 1-based attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let base = Duration::from_millis(ms);
        if self.jitter && ms > 0 {
            base + Duration::from_millis(rand::random_range(0..=ms / 2))
        } else {
            base
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

/// Circuit breaker settings for the storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive write failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Failed half-open trials tolerated before the run is aborted.
    #[serde(default = "default_max_open_cycles")]
    pub max_open_cycles: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_open_cycles: default_max_open_cycles(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_max_open_cycles() -> u32 {
    3
}

/// Dead letter queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DlqConfig {
    /// Entries whose retry count exceeds this are discarded.
    #[serde(default = "default_dlq_max_retries")]
    pub max_retries: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: default_dlq_max_retries(),
        }
    }
}

fn default_dlq_max_retries() -> u32 {
    3
}

/// Status document settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusConfig {
    /// Where to write the status document. Logged only when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_status_interval")]
    pub interval_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval_secs: default_status_interval(),
        }
    }
}

fn default_status_interval() -> u64 {
    10
}

/// Delta loader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeltaConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub poll_jitter_secs: u64,
    /// A source lock not refreshed within this window may be taken over.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            poll_jitter_secs: 0,
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_lock_ttl() -> u64 {
    300
}

/// Main configuration for honeycomb.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub delta: DeltaConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load and validate a YAML file, interpolating the process environment.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Config = read_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML, resolving variables with `lookup`.
    pub fn parse<F>(contents: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config: Config = parse_yaml(contents, lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ingest = &self.ingest;
        ensure!(
            ingest.batch_size > 0,
            InvalidValueSnafu {
                field: "ingest.batch_size",
                message: "must be greater than zero",
            }
        );
        ensure!(
            ingest.min_batch_size > 0 && ingest.min_batch_size <= ingest.batch_size,
            InvalidValueSnafu {
                field: "ingest.min_batch_size",
                message: format!("must be between 1 and batch_size ({})", ingest.batch_size),
            }
        );
        ensure!(
            ingest.sample_lines > 0,
            InvalidValueSnafu {
                field: "ingest.sample_lines",
                message: "must be greater than zero",
            }
        );
        ensure!(
            self.breaker.failure_threshold > 0,
            InvalidValueSnafu {
                field: "breaker.failure_threshold",
                message: "must be greater than zero",
            }
        );
        ensure!(
            self.retry.max_attempts > 0,
            InvalidValueSnafu {
                field: "retry.max_attempts",
                message: "must be greater than zero",
            }
        );
        for (field, limit) in &self.validation.field_limits {
            ensure!(
                *limit > self.validation.truncation_marker.chars().count(),
                InvalidValueSnafu {
                    field: format!("validation.field_limits.{field}"),
                    message: "must be longer than the truncation marker",
                }
            );
        }
        Ok(())
    }

    /// Apply a batch size given on the command line.
    pub fn with_batch_size(mut self, batch_size: Option<usize>) -> Result<Self, ConfigError> {
        if let Some(size) = batch_size {
            self.ingest.batch_size = size;
            self.ingest.min_batch_size = self.ingest.min_batch_size.min(size.max(1));
            self.validate()?;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::parse("{}", no_env).unwrap();
        assert_eq!(config.ingest.batch_size, 500);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.validation.field_limits["username"], 256);
        assert!(config.metrics.address.is_none());
    }

    #[test]
    fn test_sections_with_interpolation() {
        let yaml = r#"
storage:
  path: ${STATE_DIR}/cowrie.db
ingest:
  batch_size: 1000
breaker:
  failure_threshold: 3
  cooldown_secs: 5
status:
  path: ${STATE_DIR:-/tmp}/status.json
"#;
        let config = Config::parse(yaml, |name| {
            (name == "STATE_DIR").then(|| "/var/lib/honeycomb".to_string())
        })
        .unwrap();
        assert_eq!(config.storage.path, PathBuf::from("/var/lib/honeycomb/cowrie.db"));
        assert_eq!(config.ingest.batch_size, 1000);
        assert_eq!(config.breaker.cooldown(), Duration::from_secs(5));
        assert_eq!(
            config.status.path,
            Some(PathBuf::from("/var/lib/honeycomb/status.json"))
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = Config::parse("ingest:\n  batchsize: 10\n", no_env).unwrap_err();
        assert!(matches!(err, ConfigError::YamlParse { .. }));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = Config::parse("ingest:\n  batch_size: 0\n", no_env).unwrap_err();
        assert!(err.to_string().contains("ingest.batch_size"));
    }

    #[test]
    fn test_cli_batch_size_clamps_minimum() {
        let config = Config::default().with_batch_size(Some(8)).unwrap();
        assert_eq!(config.ingest.batch_size, 8);
        assert_eq!(config.ingest.min_batch_size, 8);
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            jitter: false,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(9), Duration::from_millis(1000));
    }
}
