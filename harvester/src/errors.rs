use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("Catalog database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed document: {0}")]
    Parse(String),

    #[error("Malformed identifier: {0}")]
    Identifier(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Catalog store error: {0}")]
    Store(String),

    #[error("Master data synchronization failed:\n{}", .0.join("\n"))]
    MasterData(Vec<String>),

    #[error("Registration of {perm_id} failed: {reason}")]
    Registration { perm_id: String, reason: String },

    #[error("Deletion failed for [{}]: {reason}", .perm_ids.join(", "))]
    Deletion {
        perm_ids: Vec<String>,
        reason: String,
    },

    #[error("Data source error: {0}")]
    Source(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn parse(message: impl Into<String>) -> Self {
        SyncError::Parse(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        SyncError::Store(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
