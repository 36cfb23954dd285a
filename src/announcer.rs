//! DHT Announcer: periodically publishes tracked packages' infohashes to
//! the DHT. Borrows the engine's single DHT handle; never constructs one.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::engine::metainfo::BtInfoHash;
use crate::engine::DhtHandle;

pub const DEFAULT_ANNOUNCE_PORT: u16 = 6881;

#[derive(Debug, Clone)]
pub struct AnnouncementState {
    pub bt_infohash: BtInfoHash,
    pub package_id: String,
    pub package_name: String,
    pub last_announced: Option<DateTime<Utc>>,
    pub announce_count: u64,
    pub failed: bool,
    pub last_error: Option<String>,
}

struct AnnouncerInner {
    tracked: HashMap<BtInfoHash, AnnouncementState>,
}

pub struct Announcer {
    dht: Option<DhtHandle>,
    interval: Duration,
    catalog: Arc<Catalog>,
    inner: RwLock<AnnouncerInner>,
    cancel: CancellationToken,
}

impl Announcer {
    /// Constructs an announcer around the engine's DHT handle. A `None`
    /// handle (DHT disabled, or not up yet at startup) is accepted: tracked
    /// packages still record in the catalog, announces just fail closed
    /// until the engine hands over a real handle.
    pub fn new(dht: Option<DhtHandle>, interval: Duration, catalog: Arc<Catalog>) -> Arc<Announcer> {
        Arc::new(Announcer {
            dht,
            interval,
            catalog,
            inner: RwLock::new(AnnouncerInner {
                tracked: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// Starts the background announce loop and performs an immediate
    /// announce pass over whatever is already tracked.
    pub fn start(self: &Arc<Self>) {
        let announcer = Arc::clone(self);
        tokio::spawn(async move {
            announcer.announce_all().await;
            let mut ticker = tokio::time::interval(announcer.interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = announcer.cancel.cancelled() => {
                        tracing::info!("announcer loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        announcer.announce_all().await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn add_package(&self, infohash: BtInfoHash, package_id: String, name: String) {
        {
            let mut inner = self.inner.write().await;
            inner.tracked.entry(infohash).or_insert(AnnouncementState {
                bt_infohash: infohash,
                package_id,
                package_name: name,
                last_announced: None,
                announce_count: 0,
                failed: false,
                last_error: None,
            });
        }
        self.announce_one(infohash).await;
    }

    pub async fn remove_package(&self, infohash: &BtInfoHash) {
        self.inner.write().await.tracked.remove(infohash);
    }

    pub async fn get_packages(&self) -> Vec<AnnouncementState> {
        self.inner.read().await.tracked.values().cloned().collect()
    }

    pub async fn get_stats(&self) -> (usize, u64) {
        let tracked = self.inner.read().await;
        let count = tracked.tracked.len();
        let total: u64 = tracked.tracked.values().map(|s| s.announce_count).sum();
        (count, total)
    }

    /// Snapshots the tracked set and issues announces outside the lock, so
    /// a long-running DHT call can never block registration.
    async fn announce_all(&self) {
        let snapshot: Vec<BtInfoHash> = {
            let inner = self.inner.read().await;
            inner.tracked.keys().copied().collect()
        };
        for infohash in snapshot {
            self.announce_one(infohash).await;
        }
    }

    async fn announce_one(&self, infohash: BtInfoHash) {
        let result: std::result::Result<(), String> = match &self.dht {
            Some(dht) => dht
                .announce_peer(infohash, Some(DEFAULT_ANNOUNCE_PORT))
                .await
                .map_err(|e| e.to_string()),
            None => Err("dht handle not available".to_string()),
        };

        let package_id = {
            let mut inner = self.inner.write().await;
            let Some(state) = inner.tracked.get_mut(&infohash) else {
                return;
            };
            state.announce_count += 1;
            match &result {
                Ok(()) => {
                    state.last_announced = Some(Utc::now());
                    state.failed = false;
                    state.last_error = None;
                }
                Err(e) => {
                    state.failed = true;
                    state.last_error = Some(e.to_string());
                    tracing::warn!(infohash = %hex::encode(infohash), error = %e, "dht announce failed, will retry next cycle");
                }
            }
            state.package_id.clone()
        };

        if result.is_ok() {
            if let Err(e) = self.catalog.mark_announced(&package_id, Utc::now()) {
                tracing::warn!(package_id = %package_id, error = %e, "failed to persist announce timestamp");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_announce_port_matches_spec() {
        assert_eq!(DEFAULT_ANNOUNCE_PORT, 6881);
    }
}
