//! Configuration management for the messaging engine.
//!
//! Resolution order: compiled-in defaults, an optional TOML file, then
//! environment variable overrides. The resolved [`Config`] is constructed
//! once and handed to [`crate::engine::EngineCoordinator`]; nothing in the
//! engine reaches back into the environment after startup.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub listen_port: u16,
}

/// Database (MessageStore) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub enable_wal: bool,
}

/// Messaging-engine tuning constants, overridable for tests and deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_hops: u32,
    pub default_ttl: Duration,
    pub max_retry_attempts: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub max_message_length: usize,
    pub seen_set_limit: usize,
    pub ack_ttl: Duration,
    /// Deterministic seed for the demo symmetric key (see crypto module).
    pub crypto_seed: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app: AppConfig {
                name: "dtmesh".to_string(),
                data_dir: default_data_dir(),
                log_level: "info".to_string(),
                listen_port: 7878,
            },
            database: DatabaseConfig {
                path: default_data_dir().join("dtmesh.db"),
                max_connections: 4,
                connection_timeout: Duration::from_secs(10),
                enable_wal: true,
            },
            engine: EngineConfig {
                max_hops: 5,
                default_ttl: Duration::from_secs(24 * 60 * 60),
                max_retry_attempts: 3,
                initial_retry_delay: Duration::from_secs(5),
                max_retry_delay: Duration::from_secs(300),
                max_message_length: 1000,
                seen_set_limit: 1000,
                ack_ttl: Duration::from_secs(60),
                crypto_seed: "dtmesh-demo-seed-v1".to_string(),
            },
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dtmesh")
}

impl Config {
    /// Resolve configuration from defaults, an optional file, and the
    /// environment. `DTMESH_CONFIG` selects the TOML file; absence of the
    /// file is not an error, only a parse failure is.
    pub fn load() -> Result<Self> {
        let mut config = match env::var("DTMESH_CONFIG") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        config.override_from_env()?;
        config.validate()?;

        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::Configuration(format!("failed to parse config: {}", e)))
    }

    fn override_from_env(&mut self) -> Result<()> {
        if let Ok(val) = env::var("DTMESH_DATA_DIR") {
            self.app.data_dir = PathBuf::from(&val);
            self.database.path = PathBuf::from(val).join("dtmesh.db");
        }

        if let Ok(val) = env::var("DTMESH_LISTEN_PORT") {
            self.app.listen_port = val
                .parse()
                .map_err(|_| Error::Configuration("invalid listen port".to_string()))?;
        }

        if let Ok(val) = env::var("DTMESH_LOG_LEVEL") {
            self.app.log_level = val;
        }

        if let Ok(val) = env::var("DTMESH_SEED") {
            self.engine.crypto_seed = val;
        }

        if let Ok(val) = env::var("DTMESH_MAX_HOPS") {
            self.engine.max_hops = val
                .parse()
                .map_err(|_| Error::Configuration("invalid max hops".to_string()))?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.data_dir.as_os_str().is_empty() {
            return Err(Error::Configuration("data dir cannot be empty".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(Error::Configuration(
                "database max connections must be > 0".to_string(),
            ));
        }

        if self.engine.max_hops == 0 {
            return Err(Error::Configuration("max hops must be > 0".to_string()));
        }

        if self.engine.max_retry_attempts == 0 {
            return Err(Error::Configuration(
                "max retry attempts must be > 0".to_string(),
            ));
        }

        if self.engine.max_message_length == 0 {
            return Err(Error::Configuration(
                "max message length must be > 0".to_string(),
            ));
        }

        if self.engine.seen_set_limit == 0 {
            return Err(Error::Configuration(
                "seen set limit must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("failed to serialize config: {}", e)))?;

        fs::write(path, contents)
            .map_err(|e| Error::Configuration(format!("failed to write config: {}", e)))
    }
}
