//! Error types for Tapedeck

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for Tapedeck operations
pub type Result<T> = std::result::Result<T, TapedeckError>;

/// Errors that can occur in Tapedeck
#[derive(Debug, Error)]
pub enum TapedeckError {
    /// Key could not be encoded to its canonical JSON form
    #[error("Key encoding failed: {0}")]
    Encoding(String),

    /// Filesystem failure while creating, reading or writing a recording
    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),

    /// Upstream could not be reached or the transport failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// No complete recording matches the request
    #[error("No recording for {path}")]
    NotFound {
        /// Inbound request path
        path: String,
    },

    /// A recording directory matched but is missing an artifact
    #[error("No {artifact} in {}", dir.display())]
    IncompleteRecording {
        /// Recording directory
        dir: PathBuf,
        /// File name of the missing artifact
        artifact: &'static str,
    },

    /// Response stream ended before the recording could be finalized
    #[error("Capture aborted: {0}")]
    CaptureAborted(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound request cannot be proxied
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl TapedeckError {
    /// Whether this is a normal replay miss rather than a failure
    #[must_use]
    pub fn is_replay_miss(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::IncompleteRecording { .. })
    }
}

impl From<serde_json::Error> for TapedeckError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::Storage(err.into())
        } else {
            Self::Encoding(err.to_string())
        }
    }
}
