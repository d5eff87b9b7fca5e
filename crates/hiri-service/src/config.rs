//! Server configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hiri_core::{DEFAULT_BASE_URL, HttpUpstreamConfig, RetryConfig};
use hiri_types::{PartitionKey, validate_component};

/// Largest `tail` accepted by `/admin/logs`.
pub const MAX_LOG_TAIL: usize = 2000;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server settings.
    pub server: ServerConfig,
    /// Day cache settings.
    pub storage: StorageConfig,
    /// Upstream API settings.
    pub upstream: UpstreamConfig,
    /// Collector scheduling.
    pub collector: CollectorConfig,
    /// Partition defaults for requests that omit components.
    pub defaults: DefaultsConfig,
    /// In-process log buffer.
    pub logging: LoggingConfig,
    /// Partitions collected at startup.
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// ```
    /// use hiri_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.upstream.validate());
        errors.extend(self.collector.validate());
        errors.extend(self.defaults.validate());
        errors.extend(self.logging.validate());

        let mut seen = HashSet::new();
        for (i, partition) in self.partitions.iter().enumerate() {
            let prefix = format!("partitions[{}]", i);
            match partition.resolve(&self.defaults) {
                Ok(key) => {
                    if !seen.insert(key.clone()) {
                        errors.push(ValidationError {
                            field: prefix,
                            message: format!("duplicate partition '{}'", key),
                        });
                    }
                }
                Err(e) => errors.push(ValidationError {
                    field: prefix,
                    message: e.to_string(),
                }),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// The configured partitions with defaults applied, skipping invalid ones.
    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        self.partitions
            .iter()
            .filter_map(|p| p.resolve(&self.defaults).ok())
            .collect()
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
    /// Events buffered per partition before a slow live subscriber is dropped.
    pub broadcast_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            broadcast_buffer: 256,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError {
                field: "server.bind".to_string(),
                message: "bind address cannot be empty".to_string(),
            });
        } else {
            match self.bind.rsplit_once(':') {
                None => errors.push(ValidationError {
                    field: "server.bind".to_string(),
                    message: format!(
                        "invalid bind address '{}': expected format 'host:port'",
                        self.bind
                    ),
                }),
                Some((_, port)) => match port.parse::<u16>() {
                    Ok(0) => errors.push(ValidationError {
                        field: "server.bind".to_string(),
                        message: "port cannot be 0".to_string(),
                    }),
                    Err(_) => errors.push(ValidationError {
                        field: "server.bind".to_string(),
                        message: format!("invalid port '{}': must be a number 1-65535", port),
                    }),
                    Ok(_) => {}
                },
            }
        }

        if self.broadcast_buffer == 0 {
            errors.push(ValidationError {
                field: "server.broadcast_buffer".to_string(),
                message: "broadcast buffer must be at least 1".to_string(),
            });
        }

        errors
    }
}

/// Day cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Cache root directory.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: hiri_store::default_cache_dir(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "cache path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Upstream API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Endpoint queried for every page.
    pub base_url: String,
    /// Rows requested per page (`limite`).
    pub page_limit: usize,
    /// Pages read per poll before yielding.
    pub max_pages_per_poll: u32,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Hard limit on one whole poll in seconds.
    pub poll_timeout_secs: u64,
    /// Retries of a single page on transient errors.
    pub max_retries: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            page_limit: 500,
            max_pages_per_poll: 500,
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            poll_timeout_secs: 300,
            max_retries: 3,
        }
    }
}

impl UpstreamConfig {
    /// Validate upstream configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            errors.push(ValidationError {
                field: "upstream.base_url".to_string(),
                message: format!("'{}' is not an http(s) URL", self.base_url),
            });
        }
        if self.page_limit == 0 {
            errors.push(ValidationError {
                field: "upstream.page_limit".to_string(),
                message: "page limit must be at least 1".to_string(),
            });
        }
        if self.max_pages_per_poll == 0 {
            errors.push(ValidationError {
                field: "upstream.max_pages_per_poll".to_string(),
                message: "at least one page per poll is required".to_string(),
            });
        }
        for (field, secs) in [
            ("upstream.connect_timeout_secs", self.connect_timeout_secs),
            ("upstream.request_timeout_secs", self.request_timeout_secs),
            ("upstream.poll_timeout_secs", self.poll_timeout_secs),
        ] {
            if secs == 0 {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: "timeout cannot be 0".to_string(),
                });
            }
        }

        errors
    }

    /// Settings for the HTTP client.
    pub fn http_config(&self) -> HttpUpstreamConfig {
        HttpUpstreamConfig {
            base_url: self.base_url.clone(),
            page_limit: self.page_limit,
            max_pages_per_poll: self.max_pages_per_poll,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            retry: RetryConfig::new(self.max_retries),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Collector scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Interval after a poll that stored new rows, in seconds.
    pub base_interval_secs: u64,
    /// Longest interval after repeated empty or failed polls, in seconds.
    pub max_interval_secs: u64,
    /// Growth factor applied after each empty or failed poll.
    pub multiplier: f64,
    /// Start collectors when the service boots.
    pub autostart: bool,
    /// Also collect every device found in the cache under the defaults.
    pub discover_cached: bool,
    /// How long a stop request waits before logging that the task is slow to
    /// exit, in seconds. The stop keeps waiting after that.
    pub stop_timeout_secs: u64,
}

/// Minimum base interval in seconds.
pub const MIN_POLL_INTERVAL: u64 = 1;
/// Maximum interval in seconds (1 hour).
pub const MAX_POLL_INTERVAL: u64 = 3600;

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 30,
            max_interval_secs: 300,
            multiplier: 2.0,
            autostart: true,
            discover_cached: true,
            stop_timeout_secs: 10,
        }
    }
}

impl CollectorConfig {
    /// Validate collector configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.base_interval_secs < MIN_POLL_INTERVAL {
            errors.push(ValidationError {
                field: "collector.base_interval_secs".to_string(),
                message: format!(
                    "poll interval {} is too short (minimum {} seconds)",
                    self.base_interval_secs, MIN_POLL_INTERVAL
                ),
            });
        }
        if self.max_interval_secs > MAX_POLL_INTERVAL {
            errors.push(ValidationError {
                field: "collector.max_interval_secs".to_string(),
                message: format!(
                    "poll interval {} is too long (maximum {} seconds / 1 hour)",
                    self.max_interval_secs, MAX_POLL_INTERVAL
                ),
            });
        }
        if self.max_interval_secs < self.base_interval_secs {
            errors.push(ValidationError {
                field: "collector.max_interval_secs".to_string(),
                message: "ceiling cannot be below the base interval".to_string(),
            });
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            errors.push(ValidationError {
                field: "collector.multiplier".to_string(),
                message: format!("multiplier {} must be a number >= 1", self.multiplier),
            });
        }

        errors
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Partition components used when a request or partition entry omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub project_id: String,
    pub device_code: String,
    pub tabla: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            project_id: "18".to_string(),
            device_code: "HIRIPRO-01".to_string(),
            tabla: "datos".to_string(),
        }
    }
}

impl DefaultsConfig {
    /// Validate the default components.
    pub fn validate(&self) -> Vec<ValidationError> {
        [
            ("defaults.project_id", "project_id", &self.project_id),
            ("defaults.device_code", "device_code", &self.device_code),
            ("defaults.tabla", "tabla", &self.tabla),
        ]
        .into_iter()
        .filter_map(|(field, component, value)| {
            validate_component(component, value)
                .err()
                .map(|e| ValidationError {
                    field: field.to_string(),
                    message: e.to_string(),
                })
        })
        .collect()
    }

    /// The default partition.
    pub fn key(&self) -> Result<PartitionKey, hiri_types::ParseError> {
        PartitionKey::new(&self.project_id, &self.device_code, &self.tabla)
    }
}

/// Log buffer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Formatted lines kept for `/admin/logs`.
    pub buffer_lines: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            buffer_lines: MAX_LOG_TAIL,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.buffer_lines == 0 {
            errors.push(ValidationError {
                field: "logging.buffer_lines".to_string(),
                message: "log buffer must hold at least 1 line".to_string(),
            });
        }
        errors
    }
}

/// A partition to collect; missing components come from `[defaults]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(default)]
    pub project_id: Option<String>,
    pub device_code: String,
    #[serde(default)]
    pub tabla: Option<String>,
}

impl PartitionConfig {
    /// Build the partition key, falling back to `defaults`.
    pub fn resolve(
        &self,
        defaults: &DefaultsConfig,
    ) -> Result<PartitionKey, hiri_types::ParseError> {
        PartitionKey::new(
            self.project_id.as_deref().unwrap_or(&defaults.project_id),
            &self.device_code,
            self.tabla.as_deref().unwrap_or(&defaults.tabla),
        )
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `partitions[0]`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hiri")
        .join("server.toml")
}
