//! Application configuration.
//!
//! Every section has complete defaults, so an empty file (plus a JWT secret)
//! is a working configuration. See `profiler.example.toml` for all keys.

use profiler_auth::config::AuthConfig;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    /// Bearer credential validation
    pub auth: AuthConfig,
    /// Redis connection (remote session store, Redis Streams backend)
    pub redis: RedisConfig,
    /// Auth event stream consumer
    pub stream: StreamConfig,
    /// Remote session expiry
    pub session: SessionConfig,
    pub shutdown: ShutdownConfig,
}

impl AppConfig {
    /// Checks cross-field constraints. The error names the offending key.
    pub fn validate(&self) -> Result<(), String> {
        self.auth
            .validate()
            .map_err(|e| format!("auth config error: {e}"))?;

        let level = self.logging.level.to_ascii_lowercase();
        let checks = [
            (self.server.port == 0, "server.port must be > 0"),
            (
                !LOG_LEVELS.contains(&level.as_str()),
                "logging.level must be one of trace, debug, info, warn, error, off",
            ),
            (
                self.redis.enabled && self.redis.pool_size == 0,
                "redis.pool_size must be > 0",
            ),
            (self.session.ttl_secs == 0, "session.ttl_secs must be > 0"),
            (
                self.stream.topic.is_empty() || self.stream.group_id.is_empty(),
                "stream.topic and stream.group_id must not be empty",
            ),
            (self.stream.batch_size == 0, "stream.batch_size must be > 0"),
            (
                self.stream.backend == StreamBackend::Redis && !self.redis.enabled,
                "stream.backend = \"redis\" requires redis.enabled = true",
            ),
            (
                self.stream.backend == StreamBackend::Kafka && !cfg!(feature = "kafka"),
                "stream.backend = \"kafka\" requires building with the `kafka` feature",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err((*message).to_string()),
            None => Ok(()),
        }
    }

    /// Listen address; an unparsable host binds all interfaces.
    pub fn addr(&self) -> SocketAddr {
        let ip = self
            .server
            .host
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.server.port)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8094,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Applied at startup unless `RUST_LOG` is set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Redis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Use Redis for the remote session store.
    /// When disabled, sessions are shared only within this process.
    pub enabled: bool,
    /// Connection URL, e.g. `redis://localhost:6379`
    pub url: String,
    pub pool_size: usize,
    /// Connection and wait timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://localhost:6379".into(),
            pool_size: 10,
            timeout_ms: 5_000,
        }
    }
}

/// Event stream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamBackend {
    /// Redis Streams consumer group on the configured Redis
    #[default]
    Redis,
    /// Kafka consumer group (requires the `kafka` feature)
    Kafka,
    /// Consumer disabled; the cache is fed by credential claims only
    Disabled,
}

/// Auth event stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub backend: StreamBackend,
    /// Topic (Kafka) or stream key (Redis)
    pub topic: String,
    /// Durable consumer group identity
    pub group_id: String,
    /// Consumer name within the group; `<group_id>-<hostname>` when unset
    pub consumer_name: Option<String>,
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Entries fetched per read (Redis)
    pub batch_size: usize,
    /// How long a read blocks waiting for entries, in milliseconds (Redis)
    pub block_ms: u64,
    /// Entries another consumer left unacknowledged for this long are
    /// claimed on start, in milliseconds (Redis)
    pub claim_idle_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backend: StreamBackend::default(),
            topic: "auth-events".into(),
            group_id: "jobs-auth-group".into(),
            consumer_name: None,
            bootstrap_servers: "localhost:9092".into(),
            batch_size: 32,
            block_ms: 5_000,
            claim_idle_ms: 60_000,
        }
    }
}

impl StreamConfig {
    /// Consumer name, falling back to `<group>-<hostname>`.
    ///
    /// The fallback is stable across restarts on the same host, so a
    /// restarted process re-reads the entries it had not acknowledged.
    pub fn resolved_consumer_name(&self) -> String {
        self.consumer_name.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "localhost".to_string());
            format!("{}-{}", self.group_id, host)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remote session expiry in seconds
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 86_400 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long background tasks get to stop before being aborted
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File, FileFormat};
    use std::path::Path;

    /// Config file read when no path is given.
    pub const DEFAULT_CONFIG_FILE: &str = "profiler.toml";

    /// Environment prefix; `PROFILER__AUTH__JWT_SECRET` sets `auth.jwt_secret`.
    pub const ENV_PREFIX: &str = "PROFILER";

    /// Loads `path` (or `profiler.toml` when present), applies `PROFILER__*`
    /// overrides and validates the result.
    ///
    /// An explicitly given path must exist; the default file is optional.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let (file, required) = match path {
            Some(p) => (p, true),
            None => (DEFAULT_CONFIG_FILE, false),
        };
        if required && !Path::new(file).exists() {
            return Err(format!("config file not found: {file}"));
        }

        let settings = Config::builder()
            .add_source(File::new(file, FileFormat::Toml).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| format!("config build error: {e}"))?;

        let cfg: AppConfig = settings
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
