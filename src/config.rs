use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::ingest::event::Dimension;

/// Top-level configuration for the log aggregator.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Server identifier attached to lines that carry no `serverid: ` prefix.
    #[serde(default)]
    pub server_id: Option<String>,

    /// Window and sink timing, queue sizing, and dimensions.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Where raw log lines come from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Where aggregate records are written.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Pipeline timing and sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Window accumulator flush interval. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub window_interval: Duration,

    /// Sink accumulator flush interval. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub sink_interval: Duration,

    /// Capacity of the mapper to window queue. Default: 1000.
    #[serde(default = "default_queue_capacity")]
    pub map_queue_capacity: usize,

    /// Capacity of the window to sink queue. Default: 1000.
    #[serde(default = "default_queue_capacity")]
    pub reduce_queue_capacity: usize,

    /// Upper bound on the final drain after cancellation. Default: 5s.
    #[serde(default = "default_shutdown_drain_timeout", with = "humantime_serde")]
    pub shutdown_drain_timeout: Duration,

    /// Dimensions counted per event. Default: [ip, endpoint].
    #[serde(default = "default_dimensions")]
    pub dimensions: Vec<Dimension>,
}

/// Log line source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Newline-delimited lines on standard input.
    #[default]
    Stdin,
    /// Newline-delimited lines in a file, read to end of file.
    File { path: PathBuf },
    /// Messages published on a Redis pub/sub channel.
    Redis { url: String, channel: String },
}

/// Aggregate record stores. Every enabled store receives every batch.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    #[serde(default)]
    pub http: HttpStoreConfig,

    #[serde(default)]
    pub stdout: StdoutStoreConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Enable the ClickHouse store. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// HTTP NDJSON store configuration (e.g., for Vector).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpStoreConfig {
    /// Enable the HTTP store. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to POST batches to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib, snappy). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum duration for one POST. Default: 30s.
    #[serde(default = "default_http_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// Stdout store configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StdoutStoreConfig {
    /// Print every batch as NDJSON to stdout. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_shutdown_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_dimensions() -> Vec<Dimension> {
    Dimension::DEFAULT.to_vec()
}

fn default_true() -> bool {
    true
}

fn default_database() -> String {
    "default".to_string()
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_export_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server_id: None,
            pipeline: PipelineConfig::default(),
            source: SourceConfig::default(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_interval: default_interval(),
            sink_interval: default_interval(),
            map_queue_capacity: default_queue_capacity(),
            reduce_queue_capacity: default_queue_capacity(),
            shutdown_drain_timeout: default_shutdown_drain_timeout(),
            dimensions: default_dimensions(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            export_timeout: default_http_export_timeout(),
            keep_alive: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if let Some(server_id) = &self.server_id {
            if server_id.is_empty() {
                bail!("server_id must not be empty when set");
            }
            if server_id.contains(':') || server_id.chars().any(char::is_whitespace) {
                bail!("server_id must not contain ':' or whitespace: {server_id:?}");
            }
        }

        self.pipeline.validate()?;

        match &self.source {
            SourceConfig::Stdin => {}
            SourceConfig::File { path } => {
                if path.as_os_str().is_empty() {
                    bail!("source.path is required for kind=file");
                }
            }
            SourceConfig::Redis { url, channel } => {
                if url.is_empty() {
                    bail!("source.url is required for kind=redis");
                }
                if channel.is_empty() {
                    bail!("source.channel is required for kind=redis");
                }
            }
        }

        let store = &self.store;
        if !store.clickhouse.enabled && !store.http.enabled && !store.stdout.enabled {
            bail!("at least one of store.clickhouse, store.http, store.stdout must be enabled");
        }

        if store.clickhouse.enabled {
            if store.clickhouse.endpoint.is_empty() {
                bail!("store.clickhouse.endpoint is required when enabled");
            }
            if store.clickhouse.database.is_empty() {
                bail!("store.clickhouse.database must not be empty");
            }
        }

        if store.http.enabled {
            if store.http.address.is_empty() {
                bail!("store.http.address is required when enabled");
            }
            if store.http.export_timeout.is_zero() {
                bail!("store.http.export_timeout must be positive");
            }

            let compression = &store.http.compression;
            match compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" | "snappy" => {}
                _ => bail!("invalid compression type: {compression}"),
            }
        }

        Ok(())
    }

    /// The configured server id in the form shared with parsed events.
    pub fn shared_server_id(&self) -> Option<Arc<str>> {
        self.server_id.as_deref().map(Arc::from)
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if self.window_interval.is_zero() {
            bail!("pipeline.window_interval must be positive");
        }
        if self.sink_interval.is_zero() {
            bail!("pipeline.sink_interval must be positive");
        }
        if self.map_queue_capacity == 0 {
            bail!("pipeline.map_queue_capacity must be positive");
        }
        if self.reduce_queue_capacity == 0 {
            bail!("pipeline.reduce_queue_capacity must be positive");
        }
        if self.shutdown_drain_timeout.is_zero() {
            bail!("pipeline.shutdown_drain_timeout must be positive");
        }
        if self.dimensions.is_empty() {
            bail!("pipeline.dimensions must not be empty");
        }

        let mut seen = HashSet::new();
        for dimension in &self.dimensions {
            if !seen.insert(*dimension) {
                bail!("pipeline.dimensions lists {dimension} more than once");
            }
        }

        Ok(())
    }
}

impl ClickHouseConfig {
    /// Builds a clickhouse-rs compatible TCP DSN.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    pub fn dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.username.is_empty() {
            dsn.push_str(&self.username);
            if !self.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.endpoint);
        dsn.push('/');
        dsn.push_str(&self.database);
        dsn.push_str("?compression=lz4&pool_min=2&pool_max=5");

        dsn
    }
}
