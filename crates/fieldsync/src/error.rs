use crate::reference::RecordReference;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures reported by a [`FieldStore`](crate::store::FieldStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("the server refused the write")]
    Rejected,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("remote error: {0}")]
    Rpc(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid record locator {locator:?}: {reason}")]
    InvalidReference { locator: String, reason: String },

    #[error(
        "there is no {:?} field on {}({})",
        .reference.field_name(),
        .reference.entity_type(),
        .reference.entity_id()
    )]
    MissingField { reference: RecordReference },

    #[error("field {reference} holds a {kind} value, only text fields can be edited")]
    NonTextField {
        reference: RecordReference,
        kind: &'static str,
    },

    #[error("invalid file extension {0:?}")]
    InvalidExtension(String),

    #[error("failed to read {reference}: {source}")]
    RemoteFetch {
        reference: RecordReference,
        #[source]
        source: StoreError,
    },

    #[error("failed to update {reference}: {source}")]
    RemotePush {
        reference: RecordReference,
        #[source]
        source: StoreError,
    },

    #[error("failed to write scratch file {} for {reference}: {source}", .path.display())]
    Write {
        reference: RecordReference,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to watch {}: {source}", .path.display())]
    WatchStart {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the error only aborts the current attempt and the user can
    /// simply try again with corrected input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidReference { .. }
                | SyncError::MissingField { .. }
                | SyncError::NonTextField { .. }
                | SyncError::InvalidExtension(_)
                | SyncError::RemoteFetch { .. }
                | SyncError::RemotePush { .. }
        )
    }
}
