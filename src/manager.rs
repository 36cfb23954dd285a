//! Package Manager: the sole orchestrator of ingest and removal across the
//! catalog, engine and announcer. Owns no background work of its own; every
//! public method is one ordered sequence of steps with reverse rollback on
//! failure.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::announcer::Announcer;
use crate::catalog::{Catalog, Package, PackageId};
use crate::engine::TorrentEngine;
use crate::error::{LbsdError, Result};
use crate::keystore::fingerprint_of;
use crate::signing::{self, Manifest};

pub struct AddPackageRequest {
    pub file_bytes: Vec<u8>,
    pub name: String,
    pub version: String,
    pub description: String,
    pub manifest: Manifest,
    pub creator_pubkey: String,
    pub creator_signature: String,
    pub maintainer_pubkey: String,
    pub maintainer_signature: String,
    pub descriptor_pubkey: String,
    pub descriptor_signature: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AddPackageResponse {
    pub package_id: PackageId,
    pub fingerprint: String,
    pub file_hash: String,
}

pub struct PackageManager {
    catalog: Arc<Catalog>,
    engine: Arc<TorrentEngine>,
    announcer: Arc<Announcer>,
    packages_dir: PathBuf,
    max_disk_usage_bytes: u64,
}

impl PackageManager {
    pub fn new(
        catalog: Arc<Catalog>,
        engine: Arc<TorrentEngine>,
        announcer: Arc<Announcer>,
        packages_dir: PathBuf,
        max_disk_usage_bytes: u64,
    ) -> PackageManager {
        PackageManager {
            catalog,
            engine,
            announcer,
            packages_dir,
            max_disk_usage_bytes,
        }
    }

    /// Ingests a signed package artifact. Follows the verify -> persist ->
    /// engine -> announcer order; any failure unwinds the steps already
    /// committed, in reverse.
    pub async fn add(&self, req: AddPackageRequest) -> Result<AddPackageResponse> {
        if req.file_bytes.is_empty() {
            return Err(LbsdError::Validation("uploaded file is empty".to_string()));
        }

        let package_id = signing::sha256_hex(&req.file_bytes);

        if self.catalog.exists(&package_id)? {
            return Err(LbsdError::AlreadyExists(package_id));
        }

        let in_use: u64 = self.catalog.list()?.iter().map(|p| p.file_size).sum();
        if exceeds_quota(in_use, req.file_bytes.len() as u64, self.max_disk_usage_bytes) {
            return Err(LbsdError::DiskQuotaExceeded);
        }

        let (creator_key, maintainer_key) = signing::verify_manifest(
            &req.manifest,
            &req.creator_pubkey,
            &req.creator_signature,
            &req.maintainer_pubkey,
            &req.maintainer_signature,
        )?;

        signing::verify_minimal_descriptor(
            &format!("sha256:{package_id}"),
            &req.descriptor_pubkey,
            &req.descriptor_signature,
            &creator_key,
        )?;

        std::fs::create_dir_all(&self.packages_dir)?;
        let file_path = self.place_artifact(&package_id, &req.manifest.name)?;
        if let Err(e) = std::fs::write(&file_path, &req.file_bytes) {
            return Err(LbsdError::CatalogIo(format!("writing artifact: {e}")));
        }

        let creator_fingerprint = fingerprint_of(&creator_key);
        let maintainer_fingerprint = fingerprint_of(&maintainer_key);

        let package = Package {
            package_id: package_id.clone(),
            name: req.name,
            version: req.version,
            description: req.description,
            file_path: file_path.clone(),
            file_hash: package_id.clone(),
            file_size: req.file_bytes.len() as u64,
            created_at: Utc::now(),
            creator_fingerprint: creator_fingerprint.clone(),
            maintainer_fingerprint,
            manifest_signature: req.creator_signature,
            maintainer_manifest_signature: req.maintainer_signature,
            announced_to_dht: false,
            last_announced: None,
            bt_infohash: None,
        };

        if let Err(e) = self.catalog.add(package.clone()) {
            let _ = std::fs::remove_file(&file_path);
            return Err(e);
        }

        let infohash = match self.engine.add_package(&file_path).await {
            Ok(h) => h,
            Err(e) => {
                let _ = self.catalog.remove(&package_id);
                let _ = std::fs::remove_file(&file_path);
                return Err(e);
            }
        };

        self.catalog.set_infohash(&package_id, infohash)?;
        self.announcer
            .add_package(infohash, package_id.clone(), package.name.clone())
            .await;

        Ok(AddPackageResponse {
            package_id,
            fingerprint: creator_fingerprint,
            file_hash: package.file_hash,
        })
    }

    /// Removes a package: deregister from announcer, drop the torrent,
    /// delete the catalog record, then best-effort delete the file.
    pub async fn remove(&self, package_id: &str) -> Result<()> {
        let package = self.catalog.get(package_id)?;

        if let Some(infohash) = package.bt_infohash {
            self.announcer.remove_package(&infohash).await;
            self.engine.remove_torrent(&infohash, false).await?;
        }

        self.catalog.remove(package_id)?;

        if let Err(e) = std::fs::remove_file(&package.file_path) {
            tracing::warn!(
                package_id = %package_id,
                path = %package.file_path.display(),
                error = %e,
                "artifact already absent on remove"
            );
        }

        Ok(())
    }

    /// Picks a destination under `packages/`, appending the package ID as a
    /// prefix if the declared basename already exists (e.g. two packages
    /// named `hello.tgz`).
    fn place_artifact(&self, package_id: &str, declared_name: &str) -> Result<PathBuf> {
        Ok(resolve_artifact_path(&self.packages_dir, package_id, declared_name))
    }
}

fn exceeds_quota(in_use: u64, incoming: u64, max_disk_usage_bytes: u64) -> bool {
    in_use.saturating_add(incoming) > max_disk_usage_bytes
}

fn resolve_artifact_path(packages_dir: &Path, package_id: &str, declared_name: &str) -> PathBuf {
    let basename = if declared_name.ends_with(".tgz") {
        declared_name.to_string()
    } else {
        format!("{declared_name}.tgz")
    };
    let candidate = packages_dir.join(&basename);
    if !candidate.exists() {
        candidate
    } else {
        packages_dir.join(format!("{package_id}-{basename}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn basename_gets_tgz_suffix_appended() {
        let dir = tempdir().unwrap();
        let path = resolve_artifact_path(dir.path(), "deadbeef", "hello");
        assert_eq!(path.file_name().unwrap(), "hello.tgz");
    }

    #[test]
    fn collision_is_prefixed_with_package_id() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("hello.tgz"), b"existing").unwrap();
        let path = resolve_artifact_path(dir.path(), "deadbeef", "hello.tgz");
        assert_eq!(path.file_name().unwrap(), "deadbeef-hello.tgz");
    }

    #[test]
    fn quota_allows_incoming_file_that_fits() {
        assert!(!exceeds_quota(1000, 500, 2000));
    }

    #[test]
    fn quota_rejects_incoming_file_that_overflows_cap() {
        assert!(exceeds_quota(1900, 500, 2000));
    }
}
