use fieldsync::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OdooError>;

#[derive(Debug, Error)]
pub enum OdooError {
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Rpc(String),

    #[error("login refused for user {username:?} on database {db:?}")]
    Authentication { db: String, username: String },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<url::ParseError> for OdooError {
    fn from(e: url::ParseError) -> Self {
        OdooError::InvalidUrl(e.to_string())
    }
}

impl From<OdooError> for StoreError {
    fn from(e: OdooError) -> Self {
        match e {
            OdooError::Rpc(message) => StoreError::Rpc(message),
            OdooError::Authentication { .. } => StoreError::Authentication(e.to_string()),
            OdooError::UnexpectedResponse(message) => StoreError::Protocol(message),
            other => StoreError::Transport(Box::new(other)),
        }
    }
}
