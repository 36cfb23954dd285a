//! Crate-wide error taxonomy.
//!
//! Every layer returns [`LbsdError`]; the control plane is the only place
//! that knows about HTTP status codes, mapping each variant to one via its
//! `IntoResponse` impl in [`crate::control_plane`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LbsdError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("public key mismatch: {0}")]
    PublicKeyMismatch(String),

    #[error("manifest malformed: {0}")]
    ManifestMalformed(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("dht error: {0}")]
    Dht(String),

    #[error("catalog io error: {0}")]
    CatalogIo(String),

    #[error("engine not ready")]
    EngineNotReady,

    #[error("engine already running")]
    EngineAlreadyRunning,

    #[error("engine not running")]
    EngineNotRunning,

    #[error("disk quota exceeded")]
    DiskQuotaExceeded,

    #[error("key material corrupt: {0}")]
    KeyMaterialCorrupt(String),
}

pub type Result<T> = std::result::Result<T, LbsdError>;

impl From<std::io::Error> for LbsdError {
    fn from(e: std::io::Error) -> Self {
        LbsdError::CatalogIo(e.to_string())
    }
}

impl From<serde_json::Error> for LbsdError {
    fn from(e: serde_json::Error) -> Self {
        LbsdError::ManifestMalformed(e.to_string())
    }
}
