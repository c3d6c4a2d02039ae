//! Configuration structures for BatchLoop
//!
//! This module defines all configuration types used by the scheduler, the
//! worker pool and the HTTP front end. Configurations are loaded from YAML
//! files and can be overridden by environment variables.

use crate::error::{BatchLoopError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides, e.g. `BATCHLOOP__BATCHING__MAX_BATCH_SIZE`
pub const ENV_PREFIX: &str = "BATCHLOOP";

/// Top-level configuration for a BatchLoop server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Batching configuration
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkerPoolConfig,

    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Maximum batch size
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Time a batch may wait for more members, measured from its oldest arrival
    #[serde(default)]
    pub batch_timeout_ms: u64,

    /// Maximum queue size (unbounded when absent)
    #[serde(default)]
    pub max_queue_size: Option<usize>,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of independent predictor replicas
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

/// Wire protocol served by the HTTP front end
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApiSpec {
    /// `POST {path}` with an arbitrary JSON body
    #[default]
    Plain,

    /// `POST /v1/chat/completions`
    OpenAi,
}

/// Bundled prediction routine the binary serves
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutineKind {
    /// `{"input": x}` -> `{"output": x^2}`, one item at a time
    #[default]
    Square,

    /// Same contract, vectorized over the batch
    BatchedSquare,

    /// Ten progressive emissions per input, the last one being x^2
    StreamingSquare,

    /// Chat routine that always answers with a fixed sentence
    FixedReply,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Route of the plain predict endpoint
    #[serde(default = "default_api_path")]
    pub path: String,

    /// Wire protocol
    #[serde(default)]
    pub spec: ApiSpec,

    /// Routine served by the binary
    #[serde(default)]
    pub routine: RoutineKind,

    /// Non-streaming request timeout in seconds (disabled when absent or zero)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: Option<u64>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_batch_size() -> usize {
    1
}

fn default_num_workers() -> usize {
    1
}

fn default_api_path() -> String {
    "/predict".to_string()
}

fn default_request_timeout() -> Option<u64> {
    Some(30)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            batching: BatchingConfig::default(),
            workers: WorkerPoolConfig::default(),
            api: ApiConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            batch_timeout_ms: 0,
            max_queue_size: None,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            path: default_api_path(),
            spec: ApiSpec::default(),
            routine: RoutineKind::default(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl BatchingConfig {
    /// Get batch timeout as Duration
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

impl ServerConfig {
    /// Load configuration from defaults, an optional YAML file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&ServerConfig::default())
            .map_err(|e| BatchLoopError::Config(format!("Failed to build defaults: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: ServerConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BatchLoopError::Config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(content)
            .map_err(|e| BatchLoopError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batching.max_batch_size == 0 {
            return Err(BatchLoopError::config("max_batch_size must be at least 1"));
        }

        if let Some(max_queue_size) = self.batching.max_queue_size {
            if max_queue_size < self.batching.max_batch_size {
                return Err(BatchLoopError::config(format!(
                    "max_queue_size ({}) must not be smaller than max_batch_size ({})",
                    max_queue_size, self.batching.max_batch_size
                )));
            }
        }

        if self.workers.num_workers == 0 {
            return Err(BatchLoopError::config("num_workers must be at least 1"));
        }

        if !self.api.path.starts_with('/') {
            return Err(BatchLoopError::config(format!(
                "API path must start with '/': {}",
                self.api.path
            )));
        }

        Ok(())
    }

    /// Socket address string the server binds to
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Option<Duration> {
        self.api
            .request_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = ServerConfig::from_yaml_str("{}").unwrap();

        assert_eq!(config.port, 8000);
        assert_eq!(config.batching.max_batch_size, 1);
        assert_eq!(config.batching.batch_timeout(), Duration::ZERO);
        assert!(config.batching.max_queue_size.is_none());
        assert_eq!(config.api.path, "/predict");
        assert_eq!(config.api.spec, ApiSpec::Plain);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_config_validation() {
        let config = ServerConfig::from_yaml_str(
            r#"
batching:
  max_batch_size: 4
  batch_timeout_ms: 50
workers:
  num_workers: 2
api:
  spec: openai
  routine: fixed-reply
  request_timeout_secs: 0
"#,
        )
        .unwrap();

        assert_eq!(config.batching.max_batch_size, 4);
        assert_eq!(config.workers.num_workers, 2);
        assert_eq!(config.api.spec, ApiSpec::OpenAi);
        assert_eq!(config.api.routine, RoutineKind::FixedReply);
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn test_config_validation_zero_batch() {
        let err = ServerConfig::from_yaml_str("batching:\n  max_batch_size: 0\n").unwrap_err();
        assert!(matches!(err, BatchLoopError::Config(_)));
    }

    #[test]
    fn test_config_validation_queue_smaller_than_batch() {
        let mut config = ServerConfig::default();
        config.batching.max_batch_size = 8;
        config.batching.max_queue_size = Some(4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: 9100\nbatching:\n  max_batch_size: 2\n").unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.batching.max_batch_size, 2);
        assert_eq!(config.api.path, "/predict");
    }
}
