//! Canonical manifest serialization and dual-signature verification.
//!
//! Two distinct artifacts are verified: the inner manifest (two signatures,
//! creator and maintainer) and the minimal descriptor (one signature, over
//! raw infohash bytes, by the creator key only).

use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{LbsdError, Result};

/// Files entry of the inner manifest: relative path -> "sha256:<hex>".
pub type ManifestFiles = std::collections::BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub files: ManifestFiles,
    pub content_hash: String,
    pub pubkey: String,
}

/// The bit-exact canonical bytes signed for the inner manifest: a JSON
/// object built field-by-field in the fixed order from the wire spec, with
/// no incidental whitespace.
pub fn canonicalize_manifest(manifest: &Manifest) -> Vec<u8> {
    let mut files = Map::new();
    for (path, hash) in &manifest.files {
        files.insert(path.clone(), Value::String(hash.clone()));
    }

    let mut obj = Map::new();
    obj.insert("name".to_string(), Value::String(manifest.name.clone()));
    obj.insert("version".to_string(), Value::String(manifest.version.clone()));
    obj.insert(
        "description".to_string(),
        Value::String(manifest.description.clone()),
    );
    obj.insert("files".to_string(), Value::Object(files));
    obj.insert(
        "content_hash".to_string(),
        Value::String(manifest.content_hash.clone()),
    );
    obj.insert("pubkey".to_string(), Value::String(manifest.pubkey.clone()));

    serde_json::to_vec(&Value::Object(obj)).expect("manifest values are always serializable")
}

/// Which signer failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signer {
    Creator,
    Maintainer,
}

impl std::fmt::Display for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signer::Creator => write!(f, "creator"),
            Signer::Maintainer => write!(f, "maintainer"),
        }
    }
}

/// Decodes a `ed25519:<base64>` transport string into raw bytes.
pub fn decode_ed25519_field(field: &str) -> Result<Vec<u8>> {
    let encoded = field
        .strip_prefix("ed25519:")
        .ok_or_else(|| LbsdError::ManifestMalformed(format!("expected ed25519: prefix, got {field}")))?;
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
        .map_err(|e| LbsdError::ManifestMalformed(format!("invalid base64 in {field}: {e}")))
}

/// Decodes a `sha256:<hex>` transport string into raw 32 bytes.
pub fn decode_sha256_field(field: &str) -> Result<[u8; 32]> {
    let hex_part = field
        .strip_prefix("sha256:")
        .ok_or_else(|| LbsdError::ManifestMalformed(format!("expected sha256: prefix, got {field}")))?;
    let bytes = hex::decode(hex_part)
        .map_err(|e| LbsdError::ManifestMalformed(format!("invalid hex in {field}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| LbsdError::ManifestMalformed(format!("{field} must decode to 32 bytes")))
}

fn parse_verifying_key(pubkey_field: &str) -> Result<VerifyingKey> {
    let bytes = decode_ed25519_field(pubkey_field)?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| LbsdError::ManifestMalformed("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&array)
        .map_err(|e| LbsdError::ManifestMalformed(format!("invalid public key: {e}")))
}

fn parse_signature(sig_field: &str) -> Result<Signature> {
    let bytes = decode_ed25519_field(sig_field)?;
    let array: [u8; 64] = bytes
        .try_into()
        .map_err(|_| LbsdError::ManifestMalformed("signature must be 64 bytes".to_string()))?;
    Ok(Signature::from_bytes(&array))
}

/// Verifies both manifest signatures against their declared keys. Returns
/// the parsed creator and maintainer verifying keys on success.
pub fn verify_manifest(
    manifest: &Manifest,
    creator_pubkey_field: &str,
    creator_sig_field: &str,
    maintainer_pubkey_field: &str,
    maintainer_sig_field: &str,
) -> Result<(VerifyingKey, VerifyingKey)> {
    let canonical = canonicalize_manifest(manifest);

    let creator_key = parse_verifying_key(creator_pubkey_field)?;
    let declared_key = decode_ed25519_field(&manifest.pubkey)?;
    if declared_key != creator_key.to_bytes() {
        return Err(LbsdError::PublicKeyMismatch(
            "manifest pubkey field does not match the creator public key".to_string(),
        ));
    }

    let creator_sig = parse_signature(creator_sig_field)?;
    creator_key
        .verify(&canonical, &creator_sig)
        .map_err(|_| LbsdError::SignatureInvalid(Signer::Creator.to_string()))?;

    let maintainer_key = parse_verifying_key(maintainer_pubkey_field)?;
    let maintainer_sig = parse_signature(maintainer_sig_field)?;
    maintainer_key
        .verify(&canonical, &maintainer_sig)
        .map_err(|_| LbsdError::SignatureInvalid(Signer::Maintainer.to_string()))?;

    Ok((creator_key, maintainer_key))
}

/// Verifies a minimal descriptor's signature over the raw infohash bytes,
/// and that its declared public key matches the manifest's creator key.
pub fn verify_minimal_descriptor(
    infohash_field: &str,
    descriptor_pubkey_field: &str,
    descriptor_sig_field: &str,
    manifest_creator_key: &VerifyingKey,
) -> Result<()> {
    let descriptor_key = parse_verifying_key(descriptor_pubkey_field)?;
    if descriptor_key.to_bytes() != manifest_creator_key.to_bytes() {
        return Err(LbsdError::PublicKeyMismatch(
            "minimal descriptor public key does not match manifest creator key".to_string(),
        ));
    }

    let infohash_bytes = decode_sha256_field(infohash_field)?;
    let sig = parse_signature(descriptor_sig_field)?;
    descriptor_key
        .verify(&infohash_bytes, &sig)
        .map_err(|_| LbsdError::SignatureInvalid(Signer::Creator.to_string()))?;

    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer as _, SigningKey};
    use rand::rngs::OsRng;

    fn sample_manifest(pubkey_field: &str) -> Manifest {
        let mut files = ManifestFiles::new();
        files.insert("bin/hello".to_string(), "sha256:abc".to_string());
        Manifest {
            name: "hello".to_string(),
            version: "1.0.0".to_string(),
            description: "greeter".to_string(),
            files,
            content_hash: "sha256:def".to_string(),
            pubkey: pubkey_field.to_string(),
        }
    }

    fn encode_key(key: &VerifyingKey) -> String {
        format!(
            "ed25519:{}",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key.to_bytes())
        )
    }

    fn encode_sig(sig: &Signature) -> String {
        format!(
            "ed25519:{}",
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, sig.to_bytes())
        )
    }

    #[test]
    fn canonical_bytes_are_deterministic() {
        let manifest = sample_manifest("ed25519:AA==");
        let a = canonicalize_manifest(&manifest);
        let b = canonicalize_manifest(&manifest);
        assert_eq!(a, b);
    }

    #[test]
    fn dual_signature_round_trip() {
        let creator = SigningKey::generate(&mut OsRng);
        let maintainer = SigningKey::generate(&mut OsRng);
        let manifest = sample_manifest(&encode_key(&creator.verifying_key()));
        let canonical = canonicalize_manifest(&manifest);

        let creator_sig = creator.sign(&canonical);
        let maintainer_sig = maintainer.sign(&canonical);

        let result = verify_manifest(
            &manifest,
            &encode_key(&creator.verifying_key()),
            &encode_sig(&creator_sig),
            &encode_key(&maintainer.verifying_key()),
            &encode_sig(&maintainer_sig),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn maintainer_signature_over_wrong_bytes_fails() {
        let creator = SigningKey::generate(&mut OsRng);
        let maintainer = SigningKey::generate(&mut OsRng);
        let manifest = sample_manifest(&encode_key(&creator.verifying_key()));
        let canonical = canonicalize_manifest(&manifest);

        let creator_sig = creator.sign(&canonical);
        let maintainer_sig = maintainer.sign(b"different bytes entirely");

        let result = verify_manifest(
            &manifest,
            &encode_key(&creator.verifying_key()),
            &encode_sig(&creator_sig),
            &encode_key(&maintainer.verifying_key()),
            &encode_sig(&maintainer_sig),
        );
        match result {
            Err(LbsdError::SignatureInvalid(who)) => assert_eq!(who, "maintainer"),
            other => panic!("expected maintainer SignatureInvalid, got {other:?}"),
        }
    }

    #[test]
    fn manifest_pubkey_field_mismatch_with_creator_key_is_rejected() {
        let creator = SigningKey::generate(&mut OsRng);
        let maintainer = SigningKey::generate(&mut OsRng);
        let declared = SigningKey::generate(&mut OsRng);
        let manifest = sample_manifest(&encode_key(&declared.verifying_key()));
        let canonical = canonicalize_manifest(&manifest);

        let creator_sig = creator.sign(&canonical);
        let maintainer_sig = maintainer.sign(&canonical);

        let result = verify_manifest(
            &manifest,
            &encode_key(&creator.verifying_key()),
            &encode_sig(&creator_sig),
            &encode_key(&maintainer.verifying_key()),
            &encode_sig(&maintainer_sig),
        );
        assert!(matches!(result, Err(LbsdError::PublicKeyMismatch(_))));
    }

    #[test]
    fn minimal_descriptor_key_mismatch_is_rejected() {
        let creator = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let infohash = [7u8; 32];
        let sig = other.sign(&infohash);

        let result = verify_minimal_descriptor(
            &format!("sha256:{}", hex::encode(infohash)),
            &encode_key(&other.verifying_key()),
            &encode_sig(&sig),
            &creator.verifying_key(),
        );
        assert!(matches!(result, Err(LbsdError::PublicKeyMismatch(_))));
    }

    #[test]
    fn minimal_descriptor_round_trip() {
        let creator = SigningKey::generate(&mut OsRng);
        let infohash = [9u8; 32];
        let sig = creator.sign(&infohash);

        let result = verify_minimal_descriptor(
            &format!("sha256:{}", hex::encode(infohash)),
            &encode_key(&creator.verifying_key()),
            &encode_sig(&sig),
            &creator.verifying_key(),
        );
        assert!(result.is_ok());
    }
}
