use std::path::PathBuf;

/// Core error type for the backup relay.
///
/// Adapter crates map their specific errors (SSH, SFTP, Telegram) into this
/// type so the pipeline can tell a fatal failure from a per-item one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("packaging error: {0}")]
    Packaging(String),

    #[error("delivery error: {0}")]
    Delivery(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Errors that abort the whole run instead of a single manifest item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
