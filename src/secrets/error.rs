//! Error taxonomy for the token store.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Caller input was rejected (empty identity or secret).
    #[error("Invalid input: {0}")]
    Validation(&'static str),

    /// The token file could not be parsed as a record document.
    #[error("Token file {} is corrupt: {reason}", path.display())]
    Corruption { path: PathBuf, reason: String },

    /// A stored ciphertext was malformed or failed authentication.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Unexpected I/O failure.
    #[error("Storage error on {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No usable key material.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StoreError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corruption(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Corruption {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    pub fn is_decryption(&self) -> bool {
        matches!(self, Self::Decryption(_))
    }
}
