//! Torrent Engine: wraps an embedded BitTorrent client (`librqbit`) for the
//! peer-wire/session/DHT side, and [`metainfo`] for building and hashing
//! metainfo ourselves. Owns the single process-wide DHT server; the
//! announcer only ever borrows a handle to it.

pub mod metainfo;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, Session, SessionOptions};
use tokio::sync::RwLock;

use crate::error::{LbsdError, Result};
use metainfo::BtInfoHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub packages_seeded: usize,
    pub peers_connected: usize,
    pub upload_rate: f64,
    pub download_rate: f64,
    pub peak_upload_rate: f64,
    pub peak_download_rate: f64,
}

struct ActiveTorrent {
    file_path: PathBuf,
    torrent_id: usize,
}

pub struct EngineConfig {
    pub listen_port: u16,
    pub output_folder: PathBuf,
    pub dht_enabled: bool,
    pub upload_rate_limit_bytes_per_sec: Option<u64>,
    pub download_rate_limit_bytes_per_sec: Option<u64>,
    pub max_active_torrents: usize,
    pub max_disk_usage_bytes: u64,
}

/// A shared handle to the engine's single DHT server, as exposed by the
/// underlying `librqbit::Session`. The announcer borrows this; it never
/// constructs its own.
pub type DhtHandle = librqbit_dht::Dht;

pub struct TorrentEngine {
    config: EngineConfig,
    state: RwLock<EngineState>,
    session: RwLock<Option<Arc<Session>>>,
    torrents: RwLock<HashMap<BtInfoHash, ActiveTorrent>>,
    stats: RwLock<EngineStats>,
}

impl TorrentEngine {
    pub fn new(config: EngineConfig) -> TorrentEngine {
        TorrentEngine {
            config,
            state: RwLock::new(EngineState::Stopped),
            session: RwLock::new(None),
            torrents: RwLock::new(HashMap::new()),
            stats: RwLock::new(EngineStats::default()),
        }
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == EngineState::Running || *state == EngineState::Starting {
                return Err(LbsdError::EngineAlreadyRunning);
            }
            *state = EngineState::Starting;
        }

        std::fs::create_dir_all(&self.config.output_folder)?;

        if let Ok(existing_usage) = directory_size(&self.config.output_folder) {
            if existing_usage > self.config.max_disk_usage_bytes {
                tracing::warn!(
                    existing_usage,
                    cap = self.config.max_disk_usage_bytes,
                    "packages directory already exceeds the configured disk quota"
                );
            }
        }

        let options = SessionOptions {
            disable_dht: !self.config.dht_enabled,
            listen_port_range: Some(self.config.listen_port..self.config.listen_port + 1),
            ratelimits: LimitsConfig {
                upload_bps: self.config.upload_rate_limit_bytes_per_sec.map(|v| v as u32),
                download_bps: self.config.download_rate_limit_bytes_per_sec.map(|v| v as u32),
            },
            ..Default::default()
        };

        let session = Session::new_with_opts(self.config.output_folder.clone(), options)
            .await
            .map_err(|e| LbsdError::Engine(format!("starting session: {e}")))?;

        *self.session.write().await = Some(session);
        *self.state.write().await = EngineState::Running;
        tracing::info!(port = self.config.listen_port, dht = self.config.dht_enabled, "torrent engine started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            *state = EngineState::Stopping;
        }

        self.torrents.write().await.clear();
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.stop().await;
        }

        *self.state.write().await = EngineState::Stopped;
        tracing::info!("torrent engine stopped");
        Ok(())
    }

    /// Builds metainfo from `file_path`, registers it with the embedded
    /// client in trackerless mode, and returns the computed infohash.
    /// Idempotent: a second add of the same infohash returns the same
    /// handle without re-registering.
    pub async fn add_package(&self, file_path: &Path) -> Result<BtInfoHash> {
        if self.state().await != EngineState::Running {
            return Err(LbsdError::EngineNotRunning);
        }

        let (metainfo, infohash) = metainfo::build_from_file(file_path)?;

        {
            let torrents = self.torrents.read().await;
            if torrents.contains_key(&infohash) {
                return Ok(infohash);
            }
            if torrents.len() >= self.config.max_active_torrents {
                return Err(LbsdError::Engine(format!(
                    "max active torrents limit reached ({})",
                    self.config.max_active_torrents
                )));
            }
        }

        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or(LbsdError::EngineNotRunning)?;

        let bencoded = serde_bencode::to_bytes(&metainfo)
            .map_err(|e| LbsdError::Engine(format!("bencoding metainfo: {e}")))?;

        let response = session
            .add_torrent(
                AddTorrent::from_bytes(bencoded),
                Some(AddTorrentOptions {
                    paused: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| LbsdError::Engine(format!("registering torrent: {e}")))?;

        let torrent_id = match response {
            AddTorrentResponse::Added(id, _) => id,
            AddTorrentResponse::AlreadyManaged(id, _) => id,
            AddTorrentResponse::ListOnly(_) => {
                return Err(LbsdError::Engine(
                    "session returned a list-only response while seeding".to_string(),
                ))
            }
        };

        self.torrents.write().await.insert(
            infohash,
            ActiveTorrent {
                file_path: file_path.to_path_buf(),
                torrent_id,
            },
        );

        let mut stats = self.stats.write().await;
        stats.packages_seeded = self.torrents.read().await.len();

        Ok(infohash)
    }

    /// Drops the torrent from the underlying session so it stops seeding;
    /// `delete_data` additionally removes the downloaded/seeded files from
    /// disk via the session's own bookkeeping.
    pub async fn remove_torrent(&self, infohash: &BtInfoHash, delete_data: bool) -> Result<()> {
        let removed = self.torrents.write().await.remove(infohash);
        if let Some(active) = removed {
            if let Some(session) = self.session.read().await.clone() {
                session
                    .delete(active.torrent_id, delete_data)
                    .map_err(|e| LbsdError::Engine(format!("removing torrent from session: {e}")))?;
            }
        }
        let mut stats = self.stats.write().await;
        stats.packages_seeded = self.torrents.read().await.len();
        Ok(())
    }

    /// Returns the shared DHT handle, or `None` if DHT was not enabled.
    /// Used exclusively by the announcer during startup.
    pub async fn dht_server(&self) -> Option<DhtHandle> {
        let session = self.session.read().await;
        session.as_ref().and_then(|s| s.get_dht()).cloned()
    }

    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }
}

/// Non-recursive: `output_folder` holds package artifacts directly, no
/// subdirectories.
fn directory_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        total += entry.metadata()?.len();
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults_to_dht_on() {
        let config = EngineConfig {
            listen_port: 6881,
            output_folder: PathBuf::from("/tmp/libreseed-test"),
            dht_enabled: true,
            upload_rate_limit_bytes_per_sec: None,
            download_rate_limit_bytes_per_sec: None,
            max_active_torrents: 256,
            max_disk_usage_bytes: 50 * 1024 * 1024 * 1024,
        };
        assert!(config.dht_enabled);
    }

    #[test]
    fn directory_size_sums_file_lengths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("b"), vec![0u8; 20]).unwrap();
        assert_eq!(directory_size(dir.path()).unwrap(), 30);
    }
}
