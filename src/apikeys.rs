//! Admin API key store: authoritative in memory, snapshotted to a JSON file
//! on every mutation. Revocation keeps the record; deletion removes it.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{LbsdError, Result};
use crate::signing::sha256_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLevel {
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub name: String,
    pub level: ApiKeyLevel,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

struct StoreInner {
    keys: HashMap<Uuid, ApiKey>,
}

pub struct ApiKeyStore {
    path: PathBuf,
    inner: RwLock<StoreInner>,
}

impl ApiKeyStore {
    /// Loads the snapshot at `path` if present, else starts empty.
    pub fn open(path: &Path) -> Result<ApiKeyStore> {
        let keys = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let list: Vec<ApiKey> = serde_json::from_str(&contents)?;
            list.into_iter().map(|k| (k.id, k)).collect()
        } else {
            HashMap::new()
        };

        Ok(ApiKeyStore {
            path: path.to_path_buf(),
            inner: RwLock::new(StoreInner { keys }),
        })
    }

    /// Generates a fresh 32-byte token, returning the plaintext exactly
    /// once. Only its SHA-256 hash is stored.
    pub fn generate(&self, name: String, level: ApiKeyLevel) -> Result<(String, ApiKey)> {
        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let plaintext = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, raw);

        let key = ApiKey {
            id: Uuid::new_v4(),
            name,
            level,
            key_hash: sha256_hex(plaintext.as_bytes()),
            created_at: Utc::now(),
            last_used_at: None,
            revoked: false,
        };

        {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| LbsdError::CatalogIo("api key store lock poisoned".to_string()))?;
            inner.keys.insert(key.id, key.clone());
        }
        self.snapshot()?;

        Ok((plaintext, key))
    }

    pub fn list(&self) -> Result<Vec<ApiKey>> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LbsdError::CatalogIo("api key store lock poisoned".to_string()))?;
        let mut keys: Vec<ApiKey> = inner.keys.values().cloned().collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(keys)
    }

    pub fn revoke(&self, id: Uuid) -> Result<()> {
        {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| LbsdError::CatalogIo("api key store lock poisoned".to_string()))?;
            let key = inner
                .keys
                .get_mut(&id)
                .ok_or_else(|| LbsdError::NotFound(id.to_string()))?;
            key.revoked = true;
        }
        self.snapshot()
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| LbsdError::CatalogIo("api key store lock poisoned".to_string()))?;
            inner
                .keys
                .remove(&id)
                .ok_or_else(|| LbsdError::NotFound(id.to_string()))?;
        }
        self.snapshot()
    }

    /// Returns the matching key's level if `token` hashes to a live,
    /// non-revoked key, marking `last_used_at`.
    pub fn authenticate(&self, token: &str) -> Result<ApiKeyLevel> {
        let hash = sha256_hex(token.as_bytes());
        let mut inner = self
            .inner
            .write()
            .map_err(|_| LbsdError::CatalogIo("api key store lock poisoned".to_string()))?;
        let key = inner
            .keys
            .values_mut()
            .find(|k| k.key_hash == hash && !k.revoked)
            .ok_or_else(|| LbsdError::Auth("invalid or revoked api key".to_string()))?;
        key.last_used_at = Some(Utc::now());
        Ok(key.level)
    }

    fn snapshot(&self) -> Result<()> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LbsdError::CatalogIo("api key store lock poisoned".to_string()))?;
        let list: Vec<&ApiKey> = inner.keys.values().collect();
        let contents = serde_json::to_string_pretty(&list)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generate_then_authenticate() {
        let dir = tempdir().unwrap();
        let store = ApiKeyStore::open(&dir.path().join("apikeys.json")).unwrap();
        let (plaintext, key) = store.generate("ci".to_string(), ApiKeyLevel::Admin).unwrap();
        assert!(!key.revoked);
        let level = store.authenticate(&plaintext).unwrap();
        assert_eq!(level, ApiKeyLevel::Admin);
    }

    #[test]
    fn revoked_key_fails_authentication() {
        let dir = tempdir().unwrap();
        let store = ApiKeyStore::open(&dir.path().join("apikeys.json")).unwrap();
        let (plaintext, key) = store.generate("ci".to_string(), ApiKeyLevel::Read).unwrap();
        store.revoke(key.id).unwrap();
        assert!(store.authenticate(&plaintext).is_err());
    }

    #[test]
    fn snapshot_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apikeys.json");
        let store = ApiKeyStore::open(&path).unwrap();
        store.generate("ci".to_string(), ApiKeyLevel::Write).unwrap();

        let reloaded = ApiKeyStore::open(&path).unwrap();
        assert_eq!(reloaded.list().unwrap().len(), 1);
    }

    #[test]
    fn delete_removes_from_next_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apikeys.json");
        let store = ApiKeyStore::open(&path).unwrap();
        let (_, key) = store.generate("ci".to_string(), ApiKeyLevel::Read).unwrap();
        store.delete(key.id).unwrap();

        let reloaded = ApiKeyStore::open(&path).unwrap();
        assert!(reloaded.list().unwrap().is_empty());
    }
}
