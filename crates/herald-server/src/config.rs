//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - The first TOML file found among `$HERALD_CONFIG`, `herald.toml`,
//!   `/etc/herald/herald.toml` and `~/.config/herald/herald.toml`
//! - Environment variables (`HERALD_PORT`, `HERALD_ADAPTER__DRIVER`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenvis_herald_core::adapter::{generate_node_id, AdapterConfig};
use tenvis_herald_core::{App, ConnectionConfig, EngineConfig};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Node id in the cluster; random when unset.
    #[serde(default)]
    pub node_id: Option<String>,

    /// Statically configured apps.
    #[serde(default = "default_apps")]
    pub apps: Vec<App>,

    /// How long app lookups are cached.
    #[serde(default = "default_app_cache_ttl")]
    pub app_cache_ttl_ms: u64,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Horizontal scaling.
    #[serde(default)]
    pub adapter: AdapterSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Frames buffered per connection before it is closed as a slow consumer.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Idle time before the server pings, in milliseconds.
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout_ms: u64,

    /// Time allowed to answer a ping, in milliseconds.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

/// Which bus connects the instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterDriver {
    /// Single instance, in-process bus.
    Local,
    /// Redis pub/sub.
    Redis,
}

/// Horizontal adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSettings {
    #[serde(default = "default_driver")]
    pub driver: AdapterDriver,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Topic prefix shared by the cluster.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_adapter_heartbeat")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_node_timeout")]
    pub node_timeout_ms: u64,

    #[serde(default = "default_resync_interval")]
    pub resync_interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6001
}

fn default_apps() -> Vec<App> {
    vec![App::new("app-id", "app-key", "app-secret")]
}

fn default_app_cache_ttl() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue() -> usize {
    1024
}

fn default_activity_timeout() -> u64 {
    120_000 // 2 minutes
}

fn default_pong_timeout() -> u64 {
    30_000
}

fn default_sweep_interval() -> u64 {
    5_000
}

fn default_driver() -> AdapterDriver {
    AdapterDriver::Local
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_prefix() -> String {
    "herald".to_string()
}

fn default_adapter_heartbeat() -> u64 {
    5_000
}

fn default_node_timeout() -> u64 {
    15_000
}

fn default_resync_interval() -> u64 {
    30_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_id: None,
            apps: default_apps(),
            app_cache_ttl_ms: default_app_cache_ttl(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            adapter: AdapterSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            activity_timeout_ms: default_activity_timeout(),
            pong_timeout_ms: default_pong_timeout(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            redis_url: default_redis_url(),
            prefix: default_prefix(),
            heartbeat_interval_ms: default_adapter_heartbeat(),
            node_timeout_ms: default_node_timeout(),
            resync_interval_ms: default_resync_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, the first config file found and
    /// the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::find_file())
    }

    fn find_file() -> Option<PathBuf> {
        let explicit = std::env::var("HERALD_CONFIG").ok();
        let config_paths = [
            "herald.toml",
            "/etc/herald/herald.toml",
            "~/.config/herald/herald.toml",
        ];

        let found = explicit
            .iter()
            .map(String::as_str)
            .chain(config_paths)
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());
        found
    }

    /// Load configuration with `file` as the file layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or an environment override is invalid.
    pub fn load_from(file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default()).context("Invalid defaults")?);

        if let Some(path) = &file {
            tracing::info!(path = %path.display(), "Loading config file");
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("HERALD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Load configuration from a specific file, without the other layers.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            adapter: AdapterConfig {
                prefix: self.adapter.prefix.clone(),
                node_id: self.node_id.clone().unwrap_or_else(generate_node_id),
                heartbeat_interval: Duration::from_millis(self.adapter.heartbeat_interval_ms),
                node_timeout: Duration::from_millis(self.adapter.node_timeout_ms),
                resync_interval: Duration::from_millis(self.adapter.resync_interval_ms),
            },
            connection: ConnectionConfig {
                activity_timeout: Duration::from_millis(self.heartbeat.activity_timeout_ms),
                pong_timeout: Duration::from_millis(self.heartbeat.pong_timeout_ms),
                sweep_interval: Duration::from_millis(self.heartbeat.sweep_interval_ms),
                outbound_queue: self.limits.outbound_queue,
            },
        }
    }
}
