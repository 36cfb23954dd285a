//! Lifecycle Supervisor: startup ordering, signal handling, and graceful
//! shutdown with a bounded drain.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::announcer::Announcer;
use crate::apikeys::ApiKeyStore;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::control_plane::{self, AppState};
use crate::engine::{EngineConfig, TorrentEngine};
use crate::error::{LbsdError, Result};
use crate::keystore::KeyStore;
use crate::manager::PackageManager;

pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Supervisor {
        Supervisor { config }
    }

    /// Brings every component up in dependency order, serves the control
    /// plane until a shutdown signal arrives, then tears down in reverse.
    pub async fn run(self) -> Result<()> {
        let config = self.config;

        let _keystore = KeyStore::ensure_keys(&config.keys_dir())?;
        let catalog = Arc::new(Catalog::open(&config.catalog_dir())?);

        let engine = Arc::new(TorrentEngine::new(EngineConfig {
            listen_port: config.dht_port,
            output_folder: config.packages_dir(),
            dht_enabled: true,
            upload_rate_limit_bytes_per_sec: config.upload_rate_limit_bytes_per_sec,
            download_rate_limit_bytes_per_sec: config.download_rate_limit_bytes_per_sec,
            max_active_torrents: config.max_active_torrents,
            max_disk_usage_bytes: config.max_disk_usage_bytes,
        }));
        engine.start().await?;

        let dht = wait_for_dht(&engine).await?;
        let announcer = Announcer::new(
            dht,
            Duration::from_secs(config.announce_interval_secs),
            Arc::clone(&catalog),
        );
        announcer.start();

        for package in catalog.list()? {
            match engine.add_package(&package.file_path).await {
                Ok(infohash) => {
                    let _ = catalog.set_infohash(&package.package_id, infohash);
                    announcer
                        .add_package(infohash, package.package_id.clone(), package.name.clone())
                        .await;
                }
                Err(e) => tracing::warn!(
                    package_id = %package.package_id,
                    error = %e,
                    "failed to re-register package on startup"
                ),
            }
        }

        let manager = Arc::new(PackageManager::new(
            Arc::clone(&catalog),
            Arc::clone(&engine),
            Arc::clone(&announcer),
            config.packages_dir(),
            config.max_disk_usage_bytes,
        ));
        let api_keys = Arc::new(ApiKeyStore::open(&config.apikeys_file())?);

        let shutdown = CancellationToken::new();
        let state = Arc::new(AppState {
            manager,
            catalog: Arc::clone(&catalog),
            engine: Arc::clone(&engine),
            announcer: Arc::clone(&announcer),
            api_keys,
            admin_key_env: std::env::var("LIBRESEED_ADMIN_KEY").ok(),
            shutdown: shutdown.clone(),
            max_upload_size_bytes: config.max_upload_size_bytes,
        });

        let listener = tokio::net::TcpListener::bind(config.listen_addr.as_str())
            .await
            .map_err(|e| LbsdError::Engine(format!("binding control plane: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| LbsdError::Engine(format!("reading bound address: {e}")))?;

        write_pid_file(&config.pid_file(), local_addr)?;
        tracing::info!(addr = %local_addr, "lbsd ready");

        let router = control_plane::router(Arc::clone(&state));
        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
        });

        wait_for_shutdown_signal(&shutdown).await;

        tracing::info!("shutdown initiated, draining control plane");
        let drain_deadline = Duration::from_secs(config.shutdown_timeout_secs);
        if tokio::time::timeout(drain_deadline, server).await.is_err() {
            tracing::warn!("control plane did not drain within the shutdown deadline");
        }

        announcer.stop();
        if let Err(e) = engine.stop().await {
            tracing::warn!(error = %e, "engine stop reported an error");
        }

        let _ = std::fs::remove_file(&config.pid_file());
        tracing::info!("lbsd shutdown complete");

        Ok(())
    }
}

async fn wait_for_dht(engine: &TorrentEngine) -> Result<Option<crate::engine::DhtHandle>> {
    for _ in 0..20 {
        if let Some(dht) = engine.dht_server().await {
            return Ok(Some(dht));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::warn!("dht server did not come up within the startup window, continuing without it");
    Ok(None)
}

fn write_pid_file(path: &std::path::Path, addr: std::net::SocketAddr) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pid = std::process::id();
    std::fs::write(path, format!("{pid}:{addr}"))?;
    Ok(())
}

async fn wait_for_shutdown_signal(shutdown: &CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        sig.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
        _ = shutdown.cancelled() => tracing::info!("shutdown requested via control plane"),
    }

    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_format_matches_pid_colon_addr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lbsd.pid");
        let addr: std::net::SocketAddr = "127.0.0.1:9091".parse().unwrap();
        write_pid_file(&path, addr).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with(":127.0.0.1:9091"));
    }
}
