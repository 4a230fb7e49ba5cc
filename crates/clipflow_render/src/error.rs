use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("asset fetch failed for {url}: {reason}")]
    AssetFetch { url: String, reason: String },

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("plan compilation failed: {0}")]
    Compilation(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("could not start encoder process: {0}")]
    Spawn(String),

    #[error("probe failed for {path}: {reason}")]
    Probe { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RenderError {
    /// Stable label recorded alongside the message in a failed job.
    ///
    /// A probe failure on a fetched file means the source bytes are
    /// malformed, which is a permanent asset failure.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::AssetFetch { .. } | RenderError::Probe { .. } => "AssetFetchError",
            RenderError::UnsupportedFeature(_) => "UnsupportedFeatureError",
            RenderError::Compilation(_) => "CompilationError",
            RenderError::Encode(_) => "EncodeError",
            RenderError::Spawn(_) => "SpawnError",
            RenderError::Io(_) | RenderError::Json(_) | RenderError::Internal(_) => {
                "InternalError"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
