//! Configuration helpers shared across honeycomb components.

mod vars;

pub use vars::{InterpolationResult, interpolate_with};

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{ConfigError, EnvInterpolationSnafu, ReadFileSnafu, YamlParseSnafu};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Metrics configuration for the Prometheus endpoint.
///
/// The endpoint is only started when an address is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP server (e.g. "0.0.0.0:9090").
    #[serde(default)]
    pub address: Option<String>,
}

/// Interpolate environment variables in `contents` and deserialize the YAML.
///
/// `lookup` resolves variable names; pass `|name| std::env::var(name).ok()`
/// for the process environment.
pub fn parse_yaml<T, F>(contents: &str, lookup: F) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
    F: Fn(&str) -> Option<String>,
{
    let result = interpolate_with(contents, lookup);
    ensure!(
        result.is_ok(),
        EnvInterpolationSnafu {
            message: result.errors.join("\n"),
        }
    );

    serde_yaml::from_str(&result.text).context(YamlParseSnafu)
}

/// Read a YAML file, interpolating variables from the process environment.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    parse_yaml(&contents, |name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    struct Sample {
        path: String,
        #[serde(default)]
        metrics: MetricsConfig,
    }

    #[test]
    fn test_parse_yaml_with_injected_lookup() {
        let vars: HashMap<&str, &str> = [("DB_DIR", "/var/lib/honeycomb")].into();
        let sample: Sample = parse_yaml("path: ${DB_DIR}/events.db\n", |name| {
            vars.get(name).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(sample.path, "/var/lib/honeycomb/events.db");
        assert!(sample.metrics.address.is_none());
    }

    #[test]
    fn test_parse_yaml_reports_missing_variables() {
        let err = parse_yaml::<Sample, _>("path: $NOT_THERE\n", |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::EnvInterpolation { .. }));
        assert!(err.to_string().contains("NOT_THERE"));
    }

    #[test]
    fn test_read_yaml_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = read_yaml::<Sample>(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }
}
