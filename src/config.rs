use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Per-room configuration entry, keyed by room name in [`Config::rooms`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoomConfig {
    #[serde(default)]
    pub persistent: bool,
}

/// Process-wide configuration, loaded once at startup and shared read-only
/// thereafter (see `Overseer::config`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub password: Option<String>,

    pub db_path: String,
    pub db_update_interval_seconds: u64,
    pub db_wait_timeout_seconds: u64,

    pub rooms: HashMap<String, RoomConfig>,
    pub max_room_name_len: usize,
    pub room_name_whitelist: Option<Vec<String>>,

    pub ping_interval_seconds: u64,
    pub pong_timeout_seconds: u64,
    pub send_queue_capacity: usize,
    pub shutdown_timeout_seconds: u64,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 7766,
            cert: None,
            key: None,
            password: None,

            db_path: "niketsu.db".to_owned(),
            db_update_interval_seconds: 10,
            db_wait_timeout_seconds: 5,

            rooms: HashMap::new(),
            max_room_name_len: 256,
            room_name_whitelist: None,

            ping_interval_seconds: 5,
            pong_timeout_seconds: 20,
            send_queue_capacity: 64,
            shutdown_timeout_seconds: 10,

            debug: false,
        }
    }
}

impl Config {
    /// Loads configuration layered as defaults, an optional YAML file, then
    /// `NIKETSU_`-prefixed environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("NIKETSU").separator("__"));
        builder.build()?.try_deserialize()
    }

    pub fn db_update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.db_update_interval_seconds)
    }
    pub fn db_wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.db_wait_timeout_seconds)
    }
    pub fn ping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ping_interval_seconds)
    }
    pub fn pong_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pong_timeout_seconds)
    }
    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_seconds)
    }
}
