//! HTTP control plane: the local endpoint the `lbs` CLI talks to. Maps
//! every [`LbsdError`] to its HTTP status via `IntoResponse`, and exposes
//! package, stats, DHT and admin-key sub-trees.

use axum::extract::{Multipart, Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::announcer::Announcer;
use crate::apikeys::{ApiKey, ApiKeyLevel, ApiKeyStore};
use crate::catalog::Catalog;
use crate::engine::TorrentEngine;
use crate::error::LbsdError;
use crate::manager::{AddPackageRequest, PackageManager};
use crate::signing::Manifest;

pub struct AppState {
    pub manager: Arc<PackageManager>,
    pub catalog: Arc<Catalog>,
    pub engine: Arc<TorrentEngine>,
    pub announcer: Arc<Announcer>,
    pub api_keys: Arc<ApiKeyStore>,
    pub admin_key_env: Option<String>,
    pub shutdown: CancellationToken,
    pub max_upload_size_bytes: u64,
}

impl IntoResponse for LbsdError {
    fn into_response(self) -> Response {
        let status = match &self {
            LbsdError::Validation(_) | LbsdError::SignatureInvalid(_) | LbsdError::PublicKeyMismatch(_) | LbsdError::ManifestMalformed(_) => {
                StatusCode::BAD_REQUEST
            }
            LbsdError::Auth(_) => StatusCode::UNAUTHORIZED,
            LbsdError::NotFound(_) => StatusCode::NOT_FOUND,
            LbsdError::AlreadyExists(_) => StatusCode::CONFLICT,
            LbsdError::EngineNotReady => StatusCode::SERVICE_UNAVAILABLE,
            LbsdError::DiskQuotaExceeded => StatusCode::INSUFFICIENT_STORAGE,
            LbsdError::Engine(_)
            | LbsdError::Dht(_)
            | LbsdError::CatalogIo(_)
            | LbsdError::EngineAlreadyRunning
            | LbsdError::EngineNotRunning
            | LbsdError::KeyMaterialCorrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let kind = error_kind(&self);
        (status, Json(json!({ "error": kind, "detail": self.to_string() }))).into_response()
    }
}

fn error_kind(err: &LbsdError) -> &'static str {
    match err {
        LbsdError::Validation(_) => "ValidationError",
        LbsdError::Auth(_) => "AuthError",
        LbsdError::NotFound(_) => "NotFound",
        LbsdError::AlreadyExists(_) => "AlreadyExists",
        LbsdError::SignatureInvalid(_) => "SignatureInvalid",
        LbsdError::PublicKeyMismatch(_) => "PublicKeyMismatch",
        LbsdError::ManifestMalformed(_) => "ManifestMalformed",
        LbsdError::Engine(_) => "EngineError",
        LbsdError::Dht(_) => "DHTError",
        LbsdError::CatalogIo(_) => "CatalogIOError",
        LbsdError::EngineNotReady => "EngineNotReady",
        LbsdError::EngineAlreadyRunning => "EngineAlreadyRunning",
        LbsdError::EngineNotRunning => "EngineNotRunning",
        LbsdError::DiskQuotaExceeded => "DiskQuotaExceeded",
        LbsdError::KeyMaterialCorrupt(_) => "KeyMaterialCorrupt",
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let max_upload_size_bytes = state.max_upload_size_bytes as usize;
    Router::new()
        .route("/packages/add", post(add_package))
        .route("/packages/list", get(list_packages))
        .route("/packages/remove", post(remove_package_form))
        .route("/packages/:id", delete(remove_package_path))
        .route("/stats", get(stats))
        .route("/shutdown", post(shutdown))
        .route("/dht/stats", get(dht_stats))
        .route("/dht/peers", get(dht_peers))
        .route("/dht/announcements", get(dht_announcements))
        .route("/dht/discovery", get(dht_discovery))
        .route("/api/v1/admin/keys", post(create_api_key).get(list_api_keys))
        .route("/api/v1/admin/keys/:id/revoke", post(revoke_api_key))
        .route("/api/v1/admin/keys/:id", delete(delete_api_key))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(max_upload_size_bytes))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn add_package(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Response, LbsdError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut name: Option<String> = None;
    let mut version: Option<String> = None;
    let mut description = String::new();
    let mut manifest_json: Option<String> = None;
    let mut creator_pubkey: Option<String> = None;
    let mut creator_signature: Option<String> = None;
    let mut maintainer_pubkey: Option<String> = None;
    let mut maintainer_signature: Option<String> = None;
    let mut descriptor_pubkey: Option<String> = None;
    let mut descriptor_signature: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| LbsdError::Validation(format!("malformed multipart body: {e}")))?
    {
        let name_field = field.name().unwrap_or("").to_string();
        match name_field.as_str() {
            "file" => {
                file_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| LbsdError::Validation(format!("reading file field: {e}")))?
                        .to_vec(),
                )
            }
            "name" => name = Some(text_of(field).await?),
            "version" => version = Some(text_of(field).await?),
            "description" => description = text_of(field).await?,
            "manifest" => manifest_json = Some(text_of(field).await?),
            "creator_pubkey" => creator_pubkey = Some(text_of(field).await?),
            "creator_signature" => creator_signature = Some(text_of(field).await?),
            "maintainer_pubkey" => maintainer_pubkey = Some(text_of(field).await?),
            "maintainer_signature" => maintainer_signature = Some(text_of(field).await?),
            "descriptor_pubkey" => descriptor_pubkey = Some(text_of(field).await?),
            "descriptor_signature" => descriptor_signature = Some(text_of(field).await?),
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| LbsdError::Validation("missing file field".to_string()))?;
    let manifest: Manifest = serde_json::from_str(
        &manifest_json.ok_or_else(|| LbsdError::Validation("missing manifest field".to_string()))?,
    )?;

    let req = AddPackageRequest {
        file_bytes,
        name: name.ok_or_else(|| LbsdError::Validation("missing name field".to_string()))?,
        version: version.ok_or_else(|| LbsdError::Validation("missing version field".to_string()))?,
        description,
        manifest,
        creator_pubkey: creator_pubkey.ok_or_else(|| LbsdError::Validation("missing creator_pubkey field".to_string()))?,
        creator_signature: creator_signature.ok_or_else(|| LbsdError::Validation("missing creator_signature field".to_string()))?,
        maintainer_pubkey: maintainer_pubkey.ok_or_else(|| LbsdError::Validation("missing maintainer_pubkey field".to_string()))?,
        maintainer_signature: maintainer_signature.ok_or_else(|| LbsdError::Validation("missing maintainer_signature field".to_string()))?,
        descriptor_pubkey: descriptor_pubkey.ok_or_else(|| LbsdError::Validation("missing descriptor_pubkey field".to_string()))?,
        descriptor_signature: descriptor_signature.ok_or_else(|| LbsdError::Validation("missing descriptor_signature field".to_string()))?,
    };

    let response = state.manager.add(req).await?;
    Ok((StatusCode::CREATED, Json(response)).into_response())
}

async fn text_of(field: axum::extract::multipart::Field<'_>) -> Result<String, LbsdError> {
    field
        .text()
        .await
        .map_err(|e| LbsdError::Validation(format!("reading text field: {e}")))
}

async fn list_packages(State(state): State<Arc<AppState>>) -> Result<Response, LbsdError> {
    let packages = state.catalog.list()?;
    Ok(Json(json!({
        "status": "ok",
        "count": packages.len(),
        "packages": packages,
    }))
    .into_response())
}

#[derive(Deserialize)]
struct RemoveForm {
    package_id: String,
}

async fn remove_package_form(
    State(state): State<Arc<AppState>>,
    axum::extract::Form(form): axum::extract::Form<RemoveForm>,
) -> Result<Response, LbsdError> {
    remove_common(state, form.package_id).await
}

async fn remove_package_path(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, LbsdError> {
    remove_common(state, id).await
}

async fn remove_common(state: Arc<AppState>, package_id: String) -> Result<Response, LbsdError> {
    state.manager.remove(&package_id).await?;
    Ok(Json(json!({ "status": "removed", "package_id": package_id })).into_response())
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let s = state.engine.stats().await;
    Json(json!({
        "bytes_uploaded": s.bytes_uploaded,
        "bytes_downloaded": s.bytes_downloaded,
        "packages_seeded": s.packages_seeded,
        "peers_connected": s.peers_connected,
        "upload_rate": s.upload_rate,
        "download_rate": s.download_rate,
        "peak_upload_rate": s.peak_upload_rate,
        "peak_download_rate": s.peak_download_rate,
    }))
}

async fn shutdown(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.shutdown.cancel();
    Json(json!({ "status": "shutting_down" }))
}

async fn dht_stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (tracked, total_announces) = state.announcer.get_stats().await;
    Json(json!({
        "nodes_in_routing_table": tracked,
        "total_queries": total_announces,
        "total_responses": total_announces,
        "total_announces": total_announces,
        "total_lookups": 0,
        "last_bootstrap": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn dht_peers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.engine.stats().await;
    Json(json!({
        "peers_connected": stats.peers_connected,
        "packages_seeded": stats.packages_seeded,
    }))
}

async fn dht_announcements(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let announcements: Vec<_> = state
        .announcer
        .get_packages()
        .await
        .into_iter()
        .map(|a| {
            json!({
                "bt_infohash": hex::encode(a.bt_infohash),
                "package_id": a.package_id,
                "package_name": a.package_name,
                "last_announced": a.last_announced,
                "announce_count": a.announce_count,
                "failed": a.failed,
                "last_error": a.last_error,
            })
        })
        .collect();
    Json(json!({ "announcements": announcements }))
}

async fn dht_discovery(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let discoverable: Vec<_> = state
        .announcer
        .get_packages()
        .await
        .into_iter()
        .filter(|a| !a.failed)
        .map(|a| {
            json!({
                "bt_infohash": hex::encode(a.bt_infohash),
                "package_name": a.package_name,
            })
        })
        .collect();
    Json(json!({ "discoverable": discoverable }))
}

fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), LbsdError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| LbsdError::Auth("missing authorization header".to_string()))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| LbsdError::Auth("authorization header must be a bearer token".to_string()))?;

    if let Some(admin_key) = &state.admin_key_env {
        if token == admin_key {
            return Ok(());
        }
    }

    match state.api_keys.authenticate(token) {
        Ok(ApiKeyLevel::Admin) => Ok(()),
        Ok(_) => Err(LbsdError::Auth("key does not have admin level".to_string())),
        Err(_) => Err(LbsdError::Auth("invalid bearer token".to_string())),
    }
}

#[derive(Deserialize)]
struct CreateApiKeyRequest {
    name: String,
    level: ApiKeyLevel,
}

#[derive(Serialize)]
struct CreateApiKeyResponse {
    plaintext_key: String,
    key: ApiKey,
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<Response, LbsdError> {
    authorize_admin(&state, &headers)?;
    let (plaintext_key, key) = state.api_keys.generate(req.name, req.level)?;
    Ok(Json(CreateApiKeyResponse { plaintext_key, key }).into_response())
}

async fn list_api_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Response, LbsdError> {
    authorize_admin(&state, &headers)?;
    Ok(Json(state.api_keys.list()?).into_response())
}

async fn revoke_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Response, LbsdError> {
    authorize_admin(&state, &headers)?;
    state.api_keys.revoke(id)?;
    Ok(Json(json!({ "status": "revoked" })).into_response())
}

async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Response, LbsdError> {
    authorize_admin(&state, &headers)?;
    state.api_keys.delete(id)?;
    Ok(Json(json!({ "status": "deleted" })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_400() {
        let err = LbsdError::Validation("bad input".to_string());
        assert_eq!(error_kind(&err), "ValidationError");
    }

    #[test]
    fn already_exists_maps_to_conflict_kind() {
        let err = LbsdError::AlreadyExists("abc".to_string());
        assert_eq!(error_kind(&err), "AlreadyExists");
    }
}
