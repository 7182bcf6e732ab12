use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DownloadError>;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Download failed: {message}")]
    Transport { message: String },

    #[error("Failed to open staging file for {path}: {source}")]
    StagingOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write downloaded data for {path}: {source}")]
    StagingWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to save downloaded file to {path}: {source}")]
    Commit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Cannot find downloaded update at {path}")]
    FileNotFoundOnOpen { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    pub fn transport<S: Into<String>>(message: S) -> Self {
        DownloadError::Transport {
            message: message.into(),
        }
    }
}
