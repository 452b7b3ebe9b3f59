//! Error types for the sync engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No document identity available")]
    NoDocument,

    #[error("Refresh of {path} failed: {reason}")]
    Refresh { path: String, reason: String },

    #[error("Fetching metadata for {path} failed: {reason}")]
    Fetch { path: String, reason: String },

    #[error("Session is closed")]
    SessionClosed,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        SyncError::Transport(e.to_string())
    }
}
