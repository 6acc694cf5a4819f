use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{KafdeskError, Result};

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub connections: ConnectionsConfig,
    pub admin: AdminConfig,
    pub consumer: ConsumerConfig,
    pub backend: BackendKind,
}

impl Config {
    /// Reads `.env` (if any) and the process environment.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        Ok(Self {
            server: ServerConfig::load()?,
            storage: StorageConfig::load()?,
            connections: ConnectionsConfig::load()?,
            admin: AdminConfig::load()?,
            consumer: ConsumerConfig::load()?,
            backend: get_env("KAFDESK_BACKEND", "memory")?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            connections: ConnectionsConfig::default(),
            admin: AdminConfig::default(),
            consumer: ConsumerConfig::default(),
            backend: BackendKind::Memory,
        }
    }
}

// --- MODULES ---

// SERVER
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub channel_capacity: usize,
}

impl ServerConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            host:             get_env("SERVER_HOST", "127.0.0.1")?,
            port:             get_env("SERVER_PORT", "7655")?,
            log_level:        get_env("KAFDESK_LOG", "info")?,
            channel_capacity: get_env("SERVER_CHANNEL_CAP", "1024")?,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7655,
            log_level: "info".to_string(),
            channel_capacity: 1024,
        }
    }
}

// STORAGE
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl StorageConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            data_dir: get_env("KAFDESK_DATA_DIR", "./data")?,
        })
    }

    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn connections_db(&self) -> PathBuf {
        self.data_dir.join("connections.db")
    }

    pub fn secure_db(&self) -> PathBuf {
        self.data_dir.join("secure.db")
    }

    pub fn key_file(&self) -> PathBuf {
        self.data_dir.join("vault.key")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::at("./data")
    }
}

// CONNECTIONS
#[derive(Debug, Clone)]
pub struct ConnectionsConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub default_connection_timeout_ms: u64,
    pub default_request_timeout_ms: u64,
}

impl ConnectionsConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            idle_timeout_secs:             get_env("CONNECTION_IDLE_TIMEOUT_SECS", "1800")?,   // 30 minutes
            sweep_interval_secs:           get_env("CONNECTION_SWEEP_INTERVAL_SECS", "600")?,  // 10 minutes
            default_connection_timeout_ms: get_env("DEFAULT_CONNECTION_TIMEOUT_MS", "10000")?,
            default_request_timeout_ms:    get_env("DEFAULT_REQUEST_TIMEOUT_MS", "30000")?,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            sweep_interval_secs: 600,
            default_connection_timeout_ms: 10_000,
            default_request_timeout_ms: 30_000,
        }
    }
}

// ADMIN
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub operation_timeout_ms: u64,
}

impl AdminConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            operation_timeout_ms: get_env("ADMIN_OPERATION_TIMEOUT_MS", "30000")?,
        })
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self { operation_timeout_ms: 30_000 }
    }
}

// CONSUMER
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub event_channel_capacity: usize,
}

impl ConsumerConfig {
    fn load() -> Result<Self> {
        Ok(Self {
            session_timeout_ms:     get_env("CONSUMER_SESSION_TIMEOUT_MS", "30000")?,
            heartbeat_interval_ms:  get_env("CONSUMER_HEARTBEAT_INTERVAL_MS", "3000")?,
            event_channel_capacity: get_env("CONSUMER_EVENT_CHANNEL_CAP", "10000")?,
        })
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 3_000,
            event_channel_capacity: 10_000,
        }
    }
}

// BACKEND
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// librdkafka (requires the `kafka` feature)
    Kafka,
    /// In-process cluster
    Memory,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kafka" => Ok(BackendKind::Kafka),
            "memory" => Ok(BackendKind::Memory),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

// --- PRIVATE HELPER ---

fn get_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    parse_value(key, &env::var(key).unwrap_or_else(|_| default.to_string()))
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| KafdeskError::Validation(format!("Config error: {} must be valid (got '{}')", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_reports_key() {
        let err = parse_value::<u64>("SERVER_PORT", "seventy").unwrap_err();
        assert!(err.to_string().contains("SERVER_PORT"));
        assert_eq!(parse_value::<u64>("X", "42").unwrap(), 42);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("Kafka".parse::<BackendKind>().unwrap(), BackendKind::Kafka);
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!("zookeeper".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_defaults_match_idle_policy() {
        let config = Config::default();
        assert_eq!(config.connections.idle_timeout(), Duration::from_secs(30 * 60));
        assert_eq!(config.connections.sweep_interval(), Duration::from_secs(10 * 60));
        assert_eq!(config.admin.operation_timeout(), Duration::from_secs(30));
    }
}
