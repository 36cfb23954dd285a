//! Durable package index: one JSON record per package under `catalog/`,
//! protected by a single reader-writer lock. Mutators are atomic
//! (write-to-temp, then rename) so a crash never leaves a half-written
//! record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{LbsdError, Result};

pub type PackageId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    #[serde(rename = "PackageID")]
    pub package_id: PackageId,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "FilePath")]
    pub file_path: PathBuf,
    #[serde(rename = "FileHash")]
    pub file_hash: String,
    #[serde(rename = "FileSize")]
    pub file_size: u64,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "CreatorFingerprint")]
    pub creator_fingerprint: String,
    #[serde(rename = "MaintainerFingerprint")]
    pub maintainer_fingerprint: String,
    #[serde(rename = "ManifestSignature")]
    pub manifest_signature: String,
    #[serde(rename = "MaintainerManifestSignature")]
    pub maintainer_manifest_signature: String,
    #[serde(rename = "AnnouncedToDHT")]
    pub announced_to_dht: bool,
    #[serde(rename = "LastAnnounced")]
    pub last_announced: Option<DateTime<Utc>>,
    /// BitTorrent v1 infohash, hex-encoded. Populated once the engine
    /// registers the package; absent before that (never serialized to the
    /// catalog record wire shape documented in the spec's §6, so this is
    /// kept out of band via `set_infohash` rather than (de)serialized).
    #[serde(skip)]
    pub bt_infohash: Option<[u8; 20]>,
}

struct CatalogInner {
    packages: HashMap<PackageId, Package>,
}

pub struct Catalog {
    dir: PathBuf,
    inner: RwLock<CatalogInner>,
}

impl Catalog {
    /// Opens the catalog, rehydrating every `<id>.json` record found under
    /// `dir`. Records whose stored file no longer hashes to their
    /// `PackageID` are dropped with a warning (property P1).
    pub fn open(dir: &Path) -> Result<Catalog> {
        std::fs::create_dir_all(dir)?;
        let mut packages = HashMap::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let package: Package = match serde_json::from_str(&contents) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable catalog record");
                    continue;
                }
            };

            match std::fs::read(&package.file_path) {
                Ok(bytes) => {
                    let actual = crate::signing::sha256_hex(&bytes);
                    if actual != package.package_id {
                        tracing::warn!(
                            package_id = %package.package_id,
                            "content hash mismatch on rehydrate, marking record missing (P1 alarm)"
                        );
                        continue;
                    }
                }
                Err(e) => {
                    tracing::warn!(package_id = %package.package_id, error = %e, "artifact file missing on rehydrate");
                    continue;
                }
            }

            packages.insert(package.package_id.clone(), package);
        }

        Ok(Catalog {
            dir: dir.to_path_buf(),
            inner: RwLock::new(CatalogInner { packages }),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn add(&self, package: Package) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| LbsdError::CatalogIo("catalog lock poisoned".to_string()))?;

        if inner.packages.contains_key(&package.package_id) {
            return Err(LbsdError::AlreadyExists(package.package_id.clone()));
        }

        self.write_record(&package)?;
        inner.packages.insert(package.package_id.clone(), package);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Package> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LbsdError::CatalogIo("catalog lock poisoned".to_string()))?;
        inner
            .packages
            .get(id)
            .cloned()
            .ok_or_else(|| LbsdError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Package>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LbsdError::CatalogIo("catalog lock poisoned".to_string()))?;
        let mut packages: Vec<Package> = inner.packages.values().cloned().collect();
        packages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(packages)
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LbsdError::CatalogIo("catalog lock poisoned".to_string()))?;
        Ok(inner.packages.contains_key(id))
    }

    pub fn remove(&self, id: &str) -> Result<Package> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| LbsdError::CatalogIo("catalog lock poisoned".to_string()))?;
        let package = inner
            .packages
            .remove(id)
            .ok_or_else(|| LbsdError::NotFound(id.to_string()))?;
        let path = self.record_path(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(package)
    }

    /// Records the engine-computed infohash against an in-memory record.
    /// Not persisted to the JSON record (out-of-band per the `bt_infohash`
    /// field doc); the engine recomputes it from the stored artifact on
    /// every restart, so there is nothing to rehydrate.
    pub fn set_infohash(&self, id: &str, infohash: [u8; 20]) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| LbsdError::CatalogIo("catalog lock poisoned".to_string()))?;
        let package = inner
            .packages
            .get_mut(id)
            .ok_or_else(|| LbsdError::NotFound(id.to_string()))?;
        package.bt_infohash = Some(infohash);
        Ok(())
    }

    /// Marks a package as announced, used after a successful DHT announce.
    pub fn mark_announced(&self, id: &str, when: DateTime<Utc>) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| LbsdError::CatalogIo("catalog lock poisoned".to_string()))?;
        let package = inner
            .packages
            .get_mut(id)
            .ok_or_else(|| LbsdError::NotFound(id.to_string()))?;
        package.announced_to_dht = true;
        package.last_announced = Some(when);
        let snapshot = package.clone();
        drop(inner);
        self.write_record(&snapshot)
    }

    fn write_record(&self, package: &Package) -> Result<()> {
        let path = self.record_path(&package.package_id);
        let tmp_path = self.dir.join(format!("{}.json.tmp", package.package_id));
        let contents = serde_json::to_string_pretty(package)?;
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_package(id: &str) -> Package {
        Package {
            package_id: id.to_string(),
            name: "hello".to_string(),
            version: "1.0.0".to_string(),
            description: "greeter".to_string(),
            file_path: PathBuf::from("/tmp/hello.tgz"),
            file_hash: id.to_string(),
            file_size: 1024,
            created_at: Utc::now(),
            creator_fingerprint: "abcdabcdabcdabcd".to_string(),
            maintainer_fingerprint: "1234123412341234".to_string(),
            manifest_signature: "sig".to_string(),
            maintainer_manifest_signature: "sig2".to_string(),
            announced_to_dht: false,
            last_announced: None,
            bt_infohash: None,
        }
    }

    #[test]
    fn add_then_get() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.add(sample_package("a" .repeat(64).as_str())).unwrap();
        let fetched = catalog.get(&"a".repeat(64)).unwrap();
        assert_eq!(fetched.name, "hello");
    }

    #[test]
    fn duplicate_add_fails() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let id = "b".repeat(64);
        catalog.add(sample_package(&id)).unwrap();
        let result = catalog.add(sample_package(&id));
        assert!(matches!(result, Err(LbsdError::AlreadyExists(_))));
    }

    #[test]
    fn remove_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let result = catalog.remove(&"c".repeat(64));
        assert!(matches!(result, Err(LbsdError::NotFound(_))));
    }

    #[test]
    fn list_is_empty_initially() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        assert!(catalog.list().unwrap().is_empty());
    }
}
