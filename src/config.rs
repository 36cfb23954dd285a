//! Daemon configuration: TOML file plus environment overrides.
//!
//! Mirrors the "typed settings struct with serde defaults" shape used by
//! torrent-client settings deserializers: fields default independently so a
//! partial config file is valid, and the `dirs` crate resolves the
//! platform-appropriate fallback location.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LbsdError, Result};

fn default_listen_addr() -> String {
    "127.0.0.1:9091".to_string()
}

fn default_dht_port() -> u16 {
    6881
}

fn default_max_disk_usage_bytes() -> u64 {
    50 * 1024 * 1024 * 1024 // 50 GiB
}

fn default_announce_interval_secs() -> u64 {
    22 * 3600
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_max_upload_size_bytes() -> u64 {
    512 * 1024 * 1024 // 512 MiB
}

fn default_max_active_torrents() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("libreseed")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub listen_addr: String,
    pub dht_port: u16,
    pub max_disk_usage_bytes: u64,
    pub announce_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub max_upload_size_bytes: u64,
    pub log_level: String,
    pub max_active_torrents: usize,
    pub upload_rate_limit_bytes_per_sec: Option<u64>,
    pub download_rate_limit_bytes_per_sec: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen_addr: default_listen_addr(),
            dht_port: default_dht_port(),
            max_disk_usage_bytes: default_max_disk_usage_bytes(),
            announce_interval_secs: default_announce_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_upload_size_bytes: default_max_upload_size_bytes(),
            log_level: default_log_level(),
            max_active_torrents: default_max_active_torrents(),
            upload_rate_limit_bytes_per_sec: None,
            download_rate_limit_bytes_per_sec: None,
        }
    }
}

impl Config {
    /// Load config from `path` if given, else the default config path if it
    /// exists, else built-in defaults. Environment variables always win.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Config::default()
                }
            }
        };

        if let Ok(addr) = std::env::var("LIBRESEED_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(dir) = std::env::var("LIBRESEED_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            config.log_level = level;
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LbsdError::Validation(format!("reading config {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| LbsdError::Validation(format!("parsing config {}: {e}", path.display())))
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.data_dir.join("packages")
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.data_dir.join("catalog")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("lbsd.pid")
    }

    pub fn apikeys_file(&self) -> PathBuf {
        self.data_dir.join("apikeys.json")
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("libreseed")
        .join("lbsd.toml")
}
