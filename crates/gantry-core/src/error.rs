//! Core error taxonomy.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the lifecycle, dispatch, and gallery subsystems.
#[derive(Debug, Error)]
pub enum Error {
    /// The worker process never became ready (or died while starting).
    #[error("backend failed to launch: {0}")]
    BackendLaunchFailed(String),

    /// The worker came up but rejected the model load.
    #[error("backend failed to load model: {0}")]
    BackendLoadFailed(String),

    /// A newer single-active load tore this backend down mid-call.
    #[error("backend evicted by a newer load")]
    BackendEvicted,

    /// The worker process died underneath an in-flight call.
    #[error("backend worker died: {0}")]
    BackendCrashed(String),

    #[error("backend timed out: {0}")]
    BackendTimeout(String),

    #[error("no configuration found for model '{0}'")]
    ConfigNotFound(String),

    /// Duplicate model names in the config directory; the previous snapshot
    /// stays in effect.
    #[error("conflicting model configurations: {0}")]
    ConfigConflict(String),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    IntegrityFailure {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("model '{0}' not found in any gallery")]
    GalleryModelNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("request cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("wire protocol error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
}
