use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound for the look-behind distance a new client starts at.
pub const MAX_INITIAL_BEHIND_CHUNKS: u64 = 300;

/// MPEG-TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub proxy: ProxyConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty means single-worker mode backed by the in-process store.
    pub url: String,
    pub connect_timeout_seconds: u64,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connect_timeout_seconds: 5,
            key_prefix: "ts_proxy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Relay engine tunables.
///
/// The retry, reconnect and switch thresholds are field-tuned defaults with no
/// deeper derivation; deployments are expected to adjust them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub default_user_agent: String,

    // Buffer
    pub ts_packets_per_chunk: usize,
    pub chunk_ttl_seconds: u64,
    pub buffer_index_ttl_seconds: u64,

    // Client delivery
    pub client_poll_interval_ms: u64,
    pub chunk_batch_size: usize,
    pub initial_behind_chunks: u64,
    pub keepalive_interval_ms: u64,
    pub client_send_queue: usize,

    // Upstream
    pub connection_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_wait_ms: u64,
    pub stream_timeout_seconds: u64,
    pub health_check_interval_seconds: u64,
    pub max_reconnect_attempts: u32,
    pub min_stable_time_seconds: u64,
    pub max_switch_attempts: u32,
    pub failover_grace_period_seconds: u64,

    // Lifecycle
    pub cleanup_interval_seconds: u64,
    pub channel_shutdown_delay_seconds: u64,
    pub client_heartbeat_interval_seconds: u64,
    pub ghost_client_multiplier: u32,
    pub owner_lock_ttl_seconds: u64,
    pub control_request_ttl_seconds: u64,
    pub client_stats_interval_seconds: u64,
    pub worker_heartbeat_ttl_seconds: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_user_agent: "VLC/3.0.20 LibVLC/3.0.20".to_string(),

            ts_packets_per_chunk: 44,
            chunk_ttl_seconds: 60,
            buffer_index_ttl_seconds: 3600,

            client_poll_interval_ms: 100,
            chunk_batch_size: 5,
            initial_behind_chunks: 30,
            keepalive_interval_ms: 500,
            client_send_queue: 16,

            connection_timeout_seconds: 10,
            max_retries: 3,
            retry_wait_ms: 2000,
            stream_timeout_seconds: 10,
            health_check_interval_seconds: 5,
            max_reconnect_attempts: 3,
            min_stable_time_seconds: 30,
            max_switch_attempts: 3,
            failover_grace_period_seconds: 20,

            cleanup_interval_seconds: 60,
            channel_shutdown_delay_seconds: 5,
            client_heartbeat_interval_seconds: 10,
            ghost_client_multiplier: 3,
            owner_lock_ttl_seconds: 30,
            control_request_ttl_seconds: 30,
            client_stats_interval_seconds: 5,
            worker_heartbeat_ttl_seconds: 30,
        }
    }
}

impl ProxyConfig {
    /// Bytes per buffer chunk; always a whole number of TS packets.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.ts_packets_per_chunk * TS_PACKET_SIZE
    }

    /// Look-behind distance for newly admitted clients, clamped to the hard cap.
    #[must_use]
    pub fn initial_behind(&self) -> u64 {
        self.initial_behind_chunks.min(MAX_INITIAL_BEHIND_CHUNKS)
    }

    #[must_use]
    pub fn chunk_ttl(&self) -> Duration {
        Duration::from_secs(self.chunk_ttl_seconds)
    }

    #[must_use]
    pub fn buffer_index_ttl(&self) -> Duration {
        Duration::from_secs(self.buffer_index_ttl_seconds)
    }

    #[must_use]
    pub fn client_poll_interval(&self) -> Duration {
        Duration::from_millis(self.client_poll_interval_ms)
    }

    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    #[must_use]
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    #[must_use]
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_seconds)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    #[must_use]
    pub fn min_stable_time(&self) -> Duration {
        Duration::from_secs(self.min_stable_time_seconds)
    }

    #[must_use]
    pub fn failover_grace_period(&self) -> Duration {
        Duration::from_secs(self.failover_grace_period_seconds)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    #[must_use]
    pub fn channel_shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.channel_shutdown_delay_seconds)
    }

    #[must_use]
    pub fn client_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.client_heartbeat_interval_seconds)
    }

    /// A client whose heartbeat is older than this is a ghost.
    #[must_use]
    pub fn ghost_threshold(&self) -> Duration {
        self.client_heartbeat_interval() * self.ghost_client_multiplier
    }

    #[must_use]
    pub fn owner_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.owner_lock_ttl_seconds)
    }

    /// Owners renew their lock three times per TTL.
    #[must_use]
    pub fn owner_renew_interval(&self) -> Duration {
        Duration::from_millis(self.owner_lock_ttl_seconds * 1000 / 3)
    }

    #[must_use]
    pub fn control_request_ttl(&self) -> Duration {
        Duration::from_secs(self.control_request_ttl_seconds)
    }

    #[must_use]
    pub fn client_stats_interval(&self) -> Duration {
        Duration::from_secs(self.client_stats_interval_seconds)
    }

    #[must_use]
    pub fn worker_heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_heartbeat_ttl_seconds)
    }
}

/// Records for the built-in catalog collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Name of the profile used when a channel does not name one.
    pub default_profile: Option<String>,
    pub profiles: Vec<ProfileConfig>,
    pub channels: Vec<ChannelConfig>,
}

/// A delivery profile: the locked names `Proxy` and `Redirect` are built in,
/// anything else runs `command` with `parameters`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub name: String,
    pub command: String,
    /// Whitespace separated; `{streamUrl}` and `{userAgent}` are substituted.
    pub parameters: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,
    pub profile: Option<String>,
    /// Candidate sources in failover order.
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub user_agent: Option<String>,
    pub search_pattern: Option<String>,
    pub replace_pattern: Option<String>,
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // TSRELAY_PROXY__STREAM_TIMEOUT_SECONDS=15, TSRELAY_REDIS__URL=...
        builder = builder.add_source(
            Environment::with_prefix("TSRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Get Redis URL
    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check cross-field constraints. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let p = &self.proxy;

        if p.ts_packets_per_chunk == 0 {
            errors.push("proxy.ts_packets_per_chunk must be at least 1".to_string());
        }
        if p.chunk_ttl_seconds == 0 {
            errors.push("proxy.chunk_ttl_seconds must be positive".to_string());
        }
        if p.chunk_batch_size == 0 {
            errors.push("proxy.chunk_batch_size must be at least 1".to_string());
        }
        if p.client_send_queue == 0 {
            errors.push("proxy.client_send_queue must be at least 1".to_string());
        }
        if p.client_poll_interval_ms == 0 {
            errors.push("proxy.client_poll_interval_ms must be positive".to_string());
        }
        if p.keepalive_interval_ms < p.client_poll_interval_ms {
            errors.push(
                "proxy.keepalive_interval_ms must not be shorter than client_poll_interval_ms"
                    .to_string(),
            );
        }
        if p.ghost_client_multiplier < 2 {
            errors.push("proxy.ghost_client_multiplier must be at least 2".to_string());
        }
        if p.client_heartbeat_interval_seconds == 0 {
            errors.push("proxy.client_heartbeat_interval_seconds must be positive".to_string());
        }
        if p.owner_lock_ttl_seconds < 3 {
            errors.push("proxy.owner_lock_ttl_seconds must be at least 3".to_string());
        }
        if p.stream_timeout_seconds == 0 {
            errors.push("proxy.stream_timeout_seconds must be positive".to_string());
        }
        if p.health_check_interval_seconds == 0 {
            errors.push("proxy.health_check_interval_seconds must be positive".to_string());
        }
        if p.connection_timeout_seconds == 0 {
            errors.push("proxy.connection_timeout_seconds must be positive".to_string());
        }
        if self.redis.key_prefix.is_empty() {
            errors.push("redis.key_prefix must not be empty".to_string());
        }

        for channel in &self.catalog.channels {
            if channel.id.is_empty() {
                errors.push("catalog channel with empty id".to_string());
            }
            if let Some(profile) = &channel.profile {
                let builtin = profile == "Proxy" || profile == "Redirect";
                if !builtin && !self.catalog.profiles.iter().any(|p| &p.name == profile) {
                    errors.push(format!(
                        "catalog channel {} references unknown profile {profile}",
                        channel.id
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
