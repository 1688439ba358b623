use harvester::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetcherError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid data source URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("data source answered with status {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<FetcherError> for SyncError {
    fn from(err: FetcherError) -> Self {
        SyncError::Source(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FetcherError>;
