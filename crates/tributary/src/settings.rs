//! Runtime settings for harvesting.
//!
//! Settings are loaded with the following precedence (highest to lowest):
//! 1. Environment variables (prefixed with `TRIBUTARY_`, nested keys joined by
//!    `__`, e.g. `TRIBUTARY_API__REQUESTS_PER_HOUR=5000`)
//! 2. Settings file (`./tributary.toml` or an explicit path)
//! 3. Built-in defaults
//!
//! Example settings file:
//! ```toml
//! [database]
//! url = "sqlite://tributary.db?mode=rwc"
//!
//! [api]
//! retry = 3
//! timeout_secs = 120
//! requests_per_hour = 18000
//! proxy = "http://proxy.internal:3128"
//! endpoint_cidr_blacklist = "10.0.0.0/8,192.168.0.0/16"
//! forbid_redirection = false
//!
//! [collector]
//! page_size = 100
//! batch_size = 500
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::{HarvestError, Result};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TRIBUTARY";

/// Settings file looked up in the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "tributary.toml";

/// Top-level settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarvestSettings {
    /// Database settings.
    pub database: DatabaseSettings,
    /// Request client settings.
    pub api: ApiSettings,
    /// Collector, extractor and converter settings.
    pub collector: CollectorSettings,
}

/// Database settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Database connection URL (`sqlite://` or `postgres://`).
    pub url: Option<String>,
}

/// Request client settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ApiSettings {
    /// Retries for a failing request before giving up.
    pub retry: usize,
    /// Per-request timeout in seconds. `0` disables the timeout.
    pub timeout_secs: u64,
    /// Fallback request budget when nothing more specific is known.
    pub requests_per_hour: u32,
    /// Optional proxy for every request.
    pub proxy: Option<String>,
    /// Comma separated CIDR ranges that endpoints must not resolve into.
    pub endpoint_cidr_blacklist: Option<String>,
    /// Refuse to follow HTTP redirects.
    pub forbid_redirection: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            retry: 3,
            timeout_secs: 120,
            requests_per_hour: crate::rate_limit::DEFAULT_RATE_LIMIT_PER_HOUR,
            proxy: None,
            endpoint_cidr_blacklist: None,
            forbid_redirection: false,
        }
    }
}

impl ApiSettings {
    /// Request timeout, or `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Collector, extractor and converter settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollectorSettings {
    /// Default page size for paginated collectors.
    pub page_size: u32,
    /// Default concurrency for collectors without an explicit value.
    pub concurrency: Option<usize>,
    /// Default batch size for extractors and converters.
    pub batch_size: usize,
    /// Default page size for GraphQL collectors.
    pub graphql_batch_size: u32,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            concurrency: None,
            batch_size: 500,
            graphql_batch_size: 100,
        }
    }
}

impl HarvestSettings {
    /// Load settings from `./tributary.toml` (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from an explicit file (if given) and the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(
                File::new(DEFAULT_SETTINGS_FILE, FileFormat::Toml).required(false),
            ),
        };

        builder = builder.add_source(environment(None));

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| HarvestError::config(e.to_string()))
    }

    /// Parse settings from TOML text layered with an explicit environment map.
    ///
    /// The process environment is not consulted, which keeps this usable from
    /// tests and embedding applications.
    pub fn from_sources(toml: &str, env: HashMap<String, String>) -> Result<Self> {
        ConfigBuilder::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .add_source(environment(Some(env)))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| HarvestError::config(e.to_string()))
    }
}

fn environment(source: Option<HashMap<String, String>>) -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .source(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = HarvestSettings::default();
        assert_eq!(settings.api.retry, 3);
        assert_eq!(settings.api.timeout(), Some(Duration::from_secs(120)));
        assert_eq!(settings.api.requests_per_hour, 18_000);
        assert!(!settings.api.forbid_redirection);
        assert_eq!(settings.collector.page_size, 100);
        assert_eq!(settings.collector.batch_size, 500);
        assert_eq!(settings.collector.graphql_batch_size, 100);
        assert!(settings.database.url.is_none());
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let api = ApiSettings {
            timeout_secs: 0,
            ..ApiSettings::default()
        };
        assert_eq!(api.timeout(), None);
    }

    #[test]
    fn toml_values_override_defaults() {
        let toml = r#"
            [api]
            retry = 5
            requests_per_hour = 5000

            [collector]
            page_size = 50
        "#;
        let settings =
            HarvestSettings::from_sources(toml, HashMap::new()).expect("settings should parse");
        assert_eq!(settings.api.retry, 5);
        assert_eq!(settings.api.requests_per_hour, 5000);
        assert_eq!(settings.api.timeout_secs, 120);
        assert_eq!(settings.collector.page_size, 50);
        assert_eq!(settings.collector.batch_size, 500);
    }

    #[test]
    fn environment_overrides_file() {
        let toml = r#"
            [api]
            retry = 5
        "#;
        let env = HashMap::from([
            ("TRIBUTARY_API__RETRY".to_string(), "7".to_string()),
            (
                "TRIBUTARY_API__REQUESTS_PER_HOUR".to_string(),
                "1200".to_string(),
            ),
            (
                "TRIBUTARY_DATABASE__URL".to_string(),
                "sqlite::memory:".to_string(),
            ),
        ]);
        let settings = HarvestSettings::from_sources(toml, env).expect("settings should parse");
        assert_eq!(settings.api.retry, 7);
        assert_eq!(settings.api.requests_per_hour, 1200);
        assert_eq!(settings.database.url.as_deref(), Some("sqlite::memory:"));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let toml = r#"
            [api]
            retry = "many"
        "#;
        let err = HarvestSettings::from_sources(toml, HashMap::new())
            .expect_err("non-numeric retry should fail");
        assert!(matches!(err, HarvestError::Config { .. }));
    }
}
