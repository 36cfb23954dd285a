//! End-to-end control plane tests: real catalog, engine and manager wired
//! behind the actual HTTP router, driven over a loopback socket the way the
//! `lbs` CLI talks to a running `lbsd`.

use base64::Engine as _;
use libreseed::announcer::Announcer;
use libreseed::apikeys::ApiKeyStore;
use libreseed::catalog::Catalog;
use libreseed::control_plane::{self, AppState};
use libreseed::engine::{EngineConfig, TorrentEngine};
use libreseed::keystore::KeyStore;
use libreseed::manager::PackageManager;
use libreseed::signing::{canonicalize_manifest, sha256_hex, Manifest, ManifestFiles};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct TestNode {
    base_url: String,
    _data_dir: tempfile::TempDir,
}

/// Brings up every component against a fresh temp data directory and a real
/// (DHT-disabled) torrent engine, then serves the control plane on an
/// OS-assigned loopback port.
async fn spawn_node() -> TestNode {
    let data_dir = tempfile::tempdir().unwrap();

    let catalog = Arc::new(Catalog::open(&data_dir.path().join("catalog")).unwrap());
    let engine = Arc::new(TorrentEngine::new(EngineConfig {
        listen_port: 0,
        output_folder: data_dir.path().join("packages"),
        dht_enabled: false,
        upload_rate_limit_bytes_per_sec: None,
        download_rate_limit_bytes_per_sec: None,
        max_active_torrents: 256,
        max_disk_usage_bytes: 10 * 1024 * 1024,
    }));
    engine.start().await.unwrap();

    let announcer = Announcer::new(None, std::time::Duration::from_secs(3600), Arc::clone(&catalog));
    let manager = Arc::new(PackageManager::new(
        Arc::clone(&catalog),
        Arc::clone(&engine),
        Arc::clone(&announcer),
        data_dir.path().join("packages"),
        10 * 1024 * 1024,
    ));
    let api_keys = Arc::new(ApiKeyStore::open(&data_dir.path().join("apikeys.json")).unwrap());

    let state = Arc::new(AppState {
        manager,
        catalog,
        engine,
        announcer,
        api_keys,
        admin_key_env: Some("test-admin-key".to_string()),
        shutdown: CancellationToken::new(),
        max_upload_size_bytes: 1024 * 1024,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = control_plane::router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestNode {
        base_url: format!("http://{addr}"),
        _data_dir: data_dir,
    }
}

fn new_test_keystore() -> KeyStore {
    let dir = tempfile::tempdir().unwrap();
    KeyStore::ensure_keys(dir.path()).unwrap()
}

/// Builds a self-signed multipart body the way `lbs add` does: creator and
/// maintainer slots filled by the same local keypair.
fn signed_package_form(bytes: Vec<u8>, name: &str, version: &str) -> reqwest::multipart::Form {
    let keystore = new_test_keystore();
    build_form(&keystore, bytes, name, version)
}

fn build_form(keystore: &KeyStore, bytes: Vec<u8>, name: &str, version: &str) -> reqwest::multipart::Form {
    let package_id = sha256_hex(&bytes);
    let pubkey_field = format!(
        "ed25519:{}",
        base64::engine::general_purpose::STANDARD.encode(keystore.public_key().to_bytes())
    );

    let mut files = ManifestFiles::new();
    files.insert(format!("{name}.tgz"), format!("sha256:{package_id}"));

    let manifest = Manifest {
        name: name.to_string(),
        version: version.to_string(),
        description: "integration test package".to_string(),
        files,
        content_hash: format!("sha256:{package_id}"),
        pubkey: pubkey_field.clone(),
    };

    let canonical = canonicalize_manifest(&manifest);
    let signature = keystore.sign(&canonical);
    let sig_field = format!(
        "ed25519:{}",
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    );
    let descriptor_sig = keystore.sign(format!("sha256:{package_id}").as_bytes());
    let descriptor_sig_field = format!(
        "ed25519:{}",
        base64::engine::general_purpose::STANDARD.encode(descriptor_sig.to_bytes())
    );

    reqwest::multipart::Form::new()
        .part("file", reqwest::multipart::Part::bytes(bytes).file_name(format!("{name}.tgz")))
        .text("name", name.to_string())
        .text("version", version.to_string())
        .text("description", "integration test package".to_string())
        .text("manifest", serde_json::to_string(&manifest).unwrap())
        .text("creator_pubkey", pubkey_field.clone())
        .text("creator_signature", sig_field.clone())
        .text("maintainer_pubkey", pubkey_field.clone())
        .text("maintainer_signature", sig_field)
        .text("descriptor_pubkey", pubkey_field)
        .text("descriptor_signature", descriptor_sig_field)
}

#[tokio::test]
async fn happy_path_add_then_duplicate_then_remove_then_re_add() {
    let node = spawn_node().await;
    let client = reqwest::Client::new();

    let bytes = b"hello world package contents".to_vec();
    let package_id = sha256_hex(&bytes);

    let resp = client
        .post(format!("{}/packages/add", node.base_url))
        .multipart(signed_package_form(bytes.clone(), "hello", "1.0.0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["package_id"], package_id);

    let dup = client
        .post(format!("{}/packages/add", node.base_url))
        .multipart(signed_package_form(bytes.clone(), "hello", "1.0.0"))
        .send()
        .await
        .unwrap();
    assert_eq!(dup.status(), reqwest::StatusCode::CONFLICT);

    let list = client
        .get(format!("{}/packages/list", node.base_url))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);

    let removed = client
        .delete(format!("{}/packages/{package_id}", node.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), reqwest::StatusCode::OK);

    let re_add = client
        .post(format!("{}/packages/add", node.base_url))
        .multipart(signed_package_form(bytes, "hello", "1.0.0"))
        .send()
        .await
        .unwrap();
    assert_eq!(re_add.status(), reqwest::StatusCode::CREATED);
}

#[tokio::test]
async fn dual_signer_mismatch_is_rejected_with_bad_request() {
    let node = spawn_node().await;
    let client = reqwest::Client::new();

    let creator = new_test_keystore();
    let other = new_test_keystore();

    let bytes = b"mismatched signer package".to_vec();
    let package_id = sha256_hex(&bytes);
    let creator_pubkey_field = format!(
        "ed25519:{}",
        base64::engine::general_purpose::STANDARD.encode(creator.public_key().to_bytes())
    );
    let maintainer_pubkey_field = format!(
        "ed25519:{}",
        base64::engine::general_purpose::STANDARD.encode(other.public_key().to_bytes())
    );

    let mut files = ManifestFiles::new();
    files.insert("mismatch.tgz".to_string(), format!("sha256:{package_id}"));
    let manifest = Manifest {
        name: "mismatch".to_string(),
        version: "1.0.0".to_string(),
        description: "dual signer mismatch".to_string(),
        files,
        content_hash: format!("sha256:{package_id}"),
        pubkey: creator_pubkey_field.clone(),
    };
    let canonical = canonicalize_manifest(&manifest);

    // Maintainer signs unrelated bytes instead of the canonical manifest.
    let bogus_maintainer_sig = other.sign(b"not the manifest bytes");
    let creator_sig = creator.sign(&canonical);

    let descriptor_sig = creator.sign(format!("sha256:{package_id}").as_bytes());

    let form = reqwest::multipart::Form::new()
        .part("file", reqwest::multipart::Part::bytes(bytes).file_name("mismatch.tgz"))
        .text("name", "mismatch".to_string())
        .text("version", "1.0.0".to_string())
        .text("description", "dual signer mismatch".to_string())
        .text("manifest", serde_json::to_string(&manifest).unwrap())
        .text("creator_pubkey", creator_pubkey_field.clone())
        .text(
            "creator_signature",
            format!(
                "ed25519:{}",
                base64::engine::general_purpose::STANDARD.encode(creator_sig.to_bytes())
            ),
        )
        .text("maintainer_pubkey", maintainer_pubkey_field)
        .text(
            "maintainer_signature",
            format!(
                "ed25519:{}",
                base64::engine::general_purpose::STANDARD.encode(bogus_maintainer_sig.to_bytes())
            ),
        )
        .text("descriptor_pubkey", creator_pubkey_field)
        .text(
            "descriptor_signature",
            format!(
                "ed25519:{}",
                base64::engine::general_purpose::STANDARD.encode(descriptor_sig.to_bytes())
            ),
        );

    let resp = client
        .post(format!("{}/packages/add", node.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_key_lifecycle_requires_bearer_auth() {
    let node = spawn_node().await;
    let client = reqwest::Client::new();

    let unauthorized = client
        .post(format!("{}/api/v1/admin/keys", node.base_url))
        .json(&serde_json::json!({ "name": "ci", "level": "read" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), reqwest::StatusCode::UNAUTHORIZED);

    let created = client
        .post(format!("{}/api/v1/admin/keys", node.base_url))
        .bearer_auth("test-admin-key")
        .json(&serde_json::json!({ "name": "ci", "level": "read" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), reqwest::StatusCode::OK);
}
