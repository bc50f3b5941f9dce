//! honeycomb-core: Shared infrastructure for the honeycomb log loader.
//!
//! - `config/` - YAML helpers and environment variable interpolation
//! - `metrics/` - Internal metric events and the Prometheus endpoint
//! - `polling` - Generic polling loop trait and runner
//! - `signal` - Signal handling for graceful shutdown
//! - `tracing` - Subscriber initialization
//! - `error` - Config and metrics errors

pub mod config;
pub mod error;
pub mod metrics;
pub mod polling;
pub mod signal;
pub mod tracing;

pub use config::{KB, MB, MetricsConfig, interpolate_with, parse_yaml, read_yaml};
pub use error::{ConfigError, MetricsError};
pub use metrics::{MetricsController, init_global as init_metrics, init_test as init_metrics_test};
pub use polling::{IterationResult, PollingProcessor, random_jitter, run_polling_loop};
pub use signal::{cancel_on_signal, shutdown_signal};
pub use tracing::init_tracing;
