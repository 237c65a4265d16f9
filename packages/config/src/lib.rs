#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Pipeline configuration.
//!
//! The defaults live in `config/default.toml`, baked into the binary with
//! [`include_str!`]. A user-supplied TOML file is merged over them key by
//! key, then the result is deserialized into [`PipelineConfig`] and
//! validated. Secrets never live in config files; they are read from the
//! environment with [`require_env`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default configuration embedded at compile time.
const DEFAULT_TOML: &str = include_str!("../config/default.toml");

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// Path of the config file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The TOML could not be parsed or did not match the schema.
    #[error("Invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is not usable.
    #[error("Invalid config value: {message}")]
    Invalid {
        /// Description of the problem.
        message: String,
    },

    /// Missing required environment variable.
    #[error("Missing environment variable: {name}")]
    MissingEnv {
        /// Name of the missing environment variable.
        name: String,
    },
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of work items per chunk (and per remote task).
    pub chunk_size: usize,
    /// Attempts per item before it is recorded as failed.
    pub max_retries: u32,
    /// Completed items between progress checkpoints.
    pub checkpoint_every: u64,
    /// Minutes without a checkpoint before a task is reported stalled.
    pub stale_after_minutes: u64,
    /// Minutes between polls in continuous status mode.
    pub poll_interval_minutes: u64,
    /// Concurrent conversions in local run mode.
    pub local_concurrency: usize,
    /// Prefix prepended to converted file names.
    pub cog_prefix: String,
    /// Region every output is clipped to.
    pub region: RegionConfig,
    /// Backoff curve between attempts.
    pub retry: RetryConfig,
    /// Where and how work items are discovered.
    pub catalog: CatalogConfig,
    /// Durable store endpoints and container names.
    pub storage: StorageConfig,
    /// Remote batch service settings.
    pub batch: BatchConfig,
}

/// Region of interest.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegionConfig {
    /// `[min_x, min_y, max_x, max_y]` in `crs`.
    pub bounds: [f64; 4],
    /// Coordinate reference of `bounds` (e.g. `"EPSG:4326"`).
    pub crs: String,
}

/// Backoff between processor/upload attempts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    /// Lower bound of the random base delay.
    pub base_delay_min_ms: u64,
    /// Upper bound (exclusive) of the random base delay.
    pub base_delay_max_ms: u64,
    /// Ceiling applied to any single delay.
    pub max_delay_secs: u64,
}

/// Listing discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogConfig {
    /// Root listing containing one link per year.
    pub root_url: String,
    /// Pattern selecting year links; capture group 1, if any, is the year.
    pub year_pattern: String,
    /// Pattern selecting file links within a year listing.
    pub file_pattern: String,
    /// CSS selector for candidate anchors.
    pub link_selector: String,
    /// CSS selector for file-size cells.
    pub size_selector: String,
}

/// Which durable store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// S3-compatible object storage.
    S3,
    /// A directory tree on the local filesystem.
    Local,
}

/// Durable store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    /// Store implementation.
    pub backend: StorageBackend,
    /// Root directory for the local backend.
    pub local_root: PathBuf,
    /// Signing region for the S3 backend.
    pub region: String,
    /// Bucket/directory names per container.
    pub containers: ContainerNames,
}

/// Physical names of the logical containers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerNames {
    /// Decompressed source rasters.
    pub raw_data: String,
    /// Clipped, tiled outputs.
    pub processed_cogs: String,
    /// Progress records.
    pub batch_logs: String,
    /// Oversized chunk payloads.
    pub task_data: String,
}

/// Remote batch service settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchConfig {
    /// Batch account endpoint.
    pub account_url: String,
    /// Pool the job runs on.
    pub pool_id: String,
    /// REST API version sent with every request.
    pub api_version: String,
    /// Prefix of generated job ids.
    pub job_prefix: String,
    /// Command each task executes.
    pub command_line: String,
    /// Largest serialized chunk that is passed inline, in bytes.
    pub inline_payload_limit: usize,
    /// Validity of presigned payload URLs, in hours.
    pub payload_url_ttl_hours: u64,
    /// OAuth2 scope requested for batch API tokens.
    pub token_scope: String,
}

impl BatchConfig {
    /// Validity of presigned payload URLs.
    #[must_use]
    pub const fn payload_url_ttl(&self) -> Duration {
        Duration::from_secs(self.payload_url_ttl_hours.saturating_mul(3600))
    }
}

/// `count` minutes as a [`Duration`], saturating instead of overflowing.
#[must_use]
pub const fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60))
}

impl PipelineConfig {
    /// Loads the embedded defaults, merging `path` over them when given.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, the merged TOML
    /// does not match the schema, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let overrides = match path {
            Some(path) => {
                log::info!("Loading config from {}", path.display());
                Some(std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                })?)
            }
            None => None,
        };
        Self::from_toml_overrides(overrides.as_deref())
    }

    /// Builds a config from the embedded defaults plus optional TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse or validation failure.
    pub fn from_toml_overrides(overrides: Option<&str>) -> Result<Self, ConfigError> {
        let mut merged: toml::Table = toml::from_str(DEFAULT_TOML)?;
        if let Some(text) = overrides {
            let user: toml::Table = toml::from_str(text)?;
            merge_tables(&mut merged, user);
        }

        let config: Self = toml::Value::Table(merged).try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the embedded default configuration.
    ///
    /// # Errors
    ///
    /// Only fails if the embedded TOML is broken, which the tests rule out.
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::from_toml_overrides(None)
    }

    /// Staleness window for the progress aggregator.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        minutes(self.stale_after_minutes)
    }

    /// Interval between polls in continuous status mode.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        minutes(self.poll_interval_minutes)
    }

    /// Checks invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size must be positive"));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries must be positive"));
        }
        if self.checkpoint_every == 0 {
            return Err(invalid("checkpoint_every must be positive"));
        }
        if self.local_concurrency == 0 {
            return Err(invalid("local_concurrency must be positive"));
        }

        let [min_x, min_y, max_x, max_y] = self.region.bounds;
        if self.region.bounds.iter().any(|v| !v.is_finite()) || min_x >= max_x || min_y >= max_y
        {
            return Err(invalid(format!(
                "region.bounds must be [min_x, min_y, max_x, max_y], got {:?}",
                self.region.bounds
            )));
        }

        if self.retry.base_delay_min_ms > self.retry.base_delay_max_ms {
            return Err(invalid(
                "retry.base_delay_min_ms must not exceed retry.base_delay_max_ms",
            ));
        }

        for (name, pattern) in [
            ("catalog.year_pattern", &self.catalog.year_pattern),
            ("catalog.file_pattern", &self.catalog.file_pattern),
        ] {
            regex::Regex::new(pattern)
                .map_err(|e| invalid(format!("{name} is not a valid pattern: {e}")))?;
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

/// Recursively merges `overrides` into `base`; tables merge, values replace.
fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Reads a required environment variable.
///
/// # Errors
///
/// Returns [`ConfigError::MissingEnv`] if the variable is unset or not
/// valid unicode.
pub fn require_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv {
        name: name.to_string(),
    })
}

/// Reads an optional environment variable, treating empty values as unset.
#[must_use]
pub fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_parse_and_validate() {
        let config = PipelineConfig::defaults().unwrap();
        assert_eq!(config.chunk_size, 550);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.checkpoint_every, 10);
        assert_eq!(config.stale_after(), Duration::from_secs(30 * 60));
        assert_eq!(config.poll_interval(), Duration::from_secs(5 * 60));
        assert_eq!(config.region.crs, "EPSG:4326");
        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.containers.batch_logs, "batch-logs");
    }

    #[test]
    fn overrides_merge_key_by_key() {
        let config = PipelineConfig::from_toml_overrides(Some(
            r#"
            chunk_size = 25

            [storage]
            backend = "local"

            [storage.containers]
            raw_data = "raw-test"
            "#,
        ))
        .unwrap();

        assert_eq!(config.chunk_size, 25);
        assert_eq!(config.storage.backend, StorageBackend::Local);
        assert_eq!(config.storage.containers.raw_data, "raw-test");
        // Untouched siblings keep their defaults.
        assert_eq!(config.storage.containers.processed_cogs, "processed-cogs");
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn huge_durations_saturate() {
        let config = PipelineConfig::from_toml_overrides(Some(
            r"
            stale_after_minutes = 9223372036854775807
            poll_interval_minutes = 9223372036854775807

            [batch]
            payload_url_ttl_hours = 9223372036854775807
            ",
        ))
        .unwrap();

        let ceiling = Duration::from_secs(u64::MAX);
        assert_eq!(config.stale_after(), ceiling);
        assert_eq!(config.poll_interval(), ceiling);
        assert_eq!(config.batch.payload_url_ttl(), ceiling);
        assert_eq!(minutes(u64::MAX), ceiling);
        assert_eq!(minutes(3), Duration::from_secs(180));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = PipelineConfig::from_toml_overrides(Some("chunk_size = 0")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
    }

    #[test]
    fn rejects_inverted_bounds() {
        let err = PipelineConfig::from_toml_overrides(Some(
            "[region]\nbounds = [10.0, 0.0, 5.0, 1.0]",
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
    }

    #[test]
    fn rejects_bad_pattern() {
        let err = PipelineConfig::from_toml_overrides(Some("[catalog]\nfile_pattern = '('"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = PipelineConfig::from_toml_overrides(Some("[storage]\nbackend = \"ftp\""))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }
}
