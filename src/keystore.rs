//! The node's long-lived Ed25519 signing keypair.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{LbsdError, Result};

const PRIVATE_KEY_FILE: &str = "private.key";
const PUBLIC_KEY_FILE: &str = "public.key";

pub struct KeyStore {
    signing_key: SigningKey,
}

impl KeyStore {
    /// Loads the keypair from `key_dir` if both files are present and
    /// consistent, regenerates if exactly one is missing, or generates a
    /// fresh keypair if neither is present.
    pub fn ensure_keys(key_dir: &Path) -> Result<KeyStore> {
        fs::create_dir_all(key_dir)?;
        let priv_path = key_dir.join(PRIVATE_KEY_FILE);
        let pub_path = key_dir.join(PUBLIC_KEY_FILE);

        let priv_exists = priv_path.exists();
        let pub_exists = pub_path.exists();

        if priv_exists && pub_exists {
            return Self::load_existing(&priv_path, &pub_path);
        }

        if priv_exists {
            fs::remove_file(&priv_path)?;
        }
        if pub_exists {
            fs::remove_file(&pub_path)?;
        }

        Self::generate_and_persist(&priv_path, &pub_path)
    }

    fn load_existing(priv_path: &Path, pub_path: &Path) -> Result<KeyStore> {
        let priv_hex = fs::read_to_string(priv_path)?;
        let pub_hex = fs::read_to_string(pub_path)?;

        let priv_bytes = hex::decode(priv_hex.trim())
            .map_err(|e| LbsdError::KeyMaterialCorrupt(format!("private key hex: {e}")))?;
        let pub_bytes = hex::decode(pub_hex.trim())
            .map_err(|e| LbsdError::KeyMaterialCorrupt(format!("public key hex: {e}")))?;

        if priv_bytes.len() != 64 {
            return Err(LbsdError::KeyMaterialCorrupt(
                "private key must decode to 64 bytes".to_string(),
            ));
        }
        if pub_bytes.len() != 32 {
            return Err(LbsdError::KeyMaterialCorrupt(
                "public key must decode to 32 bytes".to_string(),
            ));
        }
        if priv_bytes[32..] != pub_bytes[..] {
            return Err(LbsdError::KeyMaterialCorrupt(
                "private key's embedded public half does not match public.key".to_string(),
            ));
        }

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&priv_bytes[..32]);
        let signing_key = SigningKey::from_bytes(&seed);

        if signing_key.verifying_key().to_bytes()[..] != pub_bytes[..] {
            return Err(LbsdError::KeyMaterialCorrupt(
                "derived public key does not match public.key".to_string(),
            ));
        }

        Ok(KeyStore { signing_key })
    }

    fn generate_and_persist(priv_path: &Path, pub_path: &Path) -> Result<KeyStore> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        let mut full_private = [0u8; 64];
        full_private[..32].copy_from_slice(&signing_key.to_bytes());
        full_private[32..].copy_from_slice(&verifying_key.to_bytes());

        write_with_permissions(priv_path, &hex::encode(full_private), 0o600)?;
        write_with_permissions(pub_path, &hex::encode(verifying_key.to_bytes()), 0o644)?;

        Ok(KeyStore { signing_key })
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.public_key())
    }
}

/// First 8 bytes of SHA-256 over a public key, hex-encoded (16 chars).
pub fn fingerprint_of(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    hex::encode(&digest[..8])
}

#[cfg(unix)]
fn write_with_permissions(path: &Path, contents: &str, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, contents)?;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_with_permissions(path: &Path, contents: &str, _mode: u32) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}

#[allow(dead_code)]
fn key_dir_default() -> PathBuf {
    PathBuf::from("keys")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_fresh_keys_when_absent() {
        let dir = tempdir().unwrap();
        let store = KeyStore::ensure_keys(dir.path()).unwrap();
        assert_eq!(store.fingerprint().len(), 16);
        assert!(dir.path().join(PRIVATE_KEY_FILE).exists());
        assert!(dir.path().join(PUBLIC_KEY_FILE).exists());
    }

    #[test]
    fn reloads_same_keys() {
        let dir = tempdir().unwrap();
        let first = KeyStore::ensure_keys(dir.path()).unwrap();
        let second = KeyStore::ensure_keys(dir.path()).unwrap();
        assert_eq!(first.public_key().to_bytes(), second.public_key().to_bytes());
    }

    #[test]
    fn regenerates_when_only_one_file_present() {
        let dir = tempdir().unwrap();
        let first = KeyStore::ensure_keys(dir.path()).unwrap();
        std::fs::remove_file(dir.path().join(PUBLIC_KEY_FILE)).unwrap();
        let second = KeyStore::ensure_keys(dir.path()).unwrap();
        assert_ne!(first.public_key().to_bytes(), second.public_key().to_bytes());
    }

    #[test]
    fn detects_cross_check_corruption() {
        let dir = tempdir().unwrap();
        KeyStore::ensure_keys(dir.path()).unwrap();
        let other = SigningKey::generate(&mut OsRng);
        std::fs::write(
            dir.path().join(PUBLIC_KEY_FILE),
            hex::encode(other.verifying_key().to_bytes()),
        )
        .unwrap();
        let result = KeyStore::ensure_keys(dir.path());
        assert!(matches!(result, Err(LbsdError::KeyMaterialCorrupt(_))));
    }
}
