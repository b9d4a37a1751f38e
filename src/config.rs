//! Configuration loading and types for blobfs.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: the object store, the metadata cache, file handle sizing,
//! logging, and metrics.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::file::FileOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Object store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Metadata cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// File handle buffer and lease settings.
    #[serde(default)]
    pub file: FileConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Which [`BlobStore`](crate::store::BlobStore) implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// In-process store; contents vanish with the process.
    #[default]
    Memory,
    /// Azure Blob Storage over the REST API.
    Azure,
}

/// Object store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Store implementation.
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Azure settings; required when `backend` is `azure`.
    #[serde(default)]
    pub azure: Option<AzureStorageConfig>,
}

/// Azure Blob Storage configuration.
///
/// Credentials left empty here fall back to the `AZURE_STORAGE_KEY`,
/// `AZURE_STORAGE_CONNECTION_STRING` and `AZURE_STORAGE_SAS_TOKEN`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AzureStorageConfig {
    /// Storage account name.
    pub account: String,
    /// Connection string carrying `AccountKey=`.
    #[serde(default)]
    pub connection_string: String,
    /// SAS token, with or without the leading `?`.
    #[serde(default)]
    pub sas_token: String,
    /// Blob service endpoint; defaults to
    /// `https://{account}.blob.core.windows.net`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Metadata cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Entry lifetime in milliseconds.
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,

    /// Entry count above which expired entries are swept on insert.
    #[serde(default = "default_sweep_threshold")]
    pub sweep_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            sweep_threshold: default_sweep_threshold(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// File handle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    /// Bytes fetched per ranged read.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,

    /// Buffered write block threshold.
    #[serde(default = "default_write_block_bytes")]
    pub write_block_bytes: usize,

    /// Write lease duration in seconds; 0 requests an infinite lease.
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            read_chunk_bytes: default_read_chunk_bytes(),
            write_block_bytes: default_write_block_bytes(),
            lease_duration_secs: default_lease_duration_secs(),
        }
    }
}

impl FileConfig {
    /// Handle options described by this section.
    pub fn options(&self) -> FileOptions {
        FileOptions {
            read_chunk_bytes: self.read_chunk_bytes,
            write_block_bytes: self.write_block_bytes,
            lease_duration: match self.lease_duration_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Serve a scrape endpoint on this address, e.g. `127.0.0.1:9100`.
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            metrics_addr: None,
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    300
}

fn default_cache_ttl_ms() -> u64 {
    5_000
}

fn default_sweep_threshold() -> usize {
    crate::cache::DEFAULT_SWEEP_THRESHOLD
}

fn default_read_chunk_bytes() -> usize {
    crate::file::read::DEFAULT_READ_CHUNK
}

fn default_write_block_bytes() -> usize {
    crate::file::write::DEFAULT_WRITE_BLOCK
}

fn default_lease_duration_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Load configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(yaml: &str) -> Config {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        load_config(file.path()).unwrap()
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = load("{}\n");
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
        assert!(config.storage.azure.is_none());
        assert_eq!(config.cache.ttl(), Duration::from_secs(5));
        assert_eq!(config.file.options(), FileOptions::default());
        assert_eq!(config.logging.level, "info");
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_full_azure_config() {
        let config = load(
            r#"
storage:
  backend: azure
  azure:
    account: myaccount
    sas_token: "?sv=2023-11-03&sig=abc"
    request_timeout_secs: 30
cache:
  ttl_ms: 250
file:
  write_block_bytes: 1024
  lease_duration_secs: 0
logging:
  level: debug
  format: json
observability:
  metrics_addr: "127.0.0.1:9100"
"#,
        );
        assert_eq!(config.storage.backend, StorageBackendKind::Azure);
        let azure = config.storage.azure.unwrap();
        assert_eq!(azure.account, "myaccount");
        assert_eq!(azure.request_timeout_secs, 30);
        assert!(azure.endpoint.is_none());
        assert!(azure.connection_string.is_empty());

        assert_eq!(config.cache.ttl(), Duration::from_millis(250));
        assert_eq!(config.cache.sweep_threshold, default_sweep_threshold());

        let options = config.file.options();
        assert_eq!(options.write_block_bytes, 1024);
        assert_eq!(options.read_chunk_bytes, default_read_chunk_bytes());
        assert_eq!(options.lease_duration, None);

        assert_eq!(config.logging.format, "json");
        assert_eq!(
            config.observability.metrics_addr.as_deref(),
            Some("127.0.0.1:9100")
        );
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"storage:\n  backend: tape\n").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(dir.path().join("absent.yaml")).is_err());
    }
}
