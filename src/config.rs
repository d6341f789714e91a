//! Configuration for the token store.
//!
//! Configuration can be set via environment variables:
//! - `TOKEN_FILE_PATH` - Optional. Path of the primary token file. Defaults to `tokens.json`.
//! - `TOKEN_ENCRYPTION_KEY` - Optional. Explicit key material; padded or truncated to 32 bytes.
//! - `SECRET_KEY` - Optional. Application secret used to derive a key when no explicit key is set.
//! - `TOKEN_CACHE_TTL_SECS` - Optional. Seconds the in-memory cache is trusted. Defaults to `300`.
//!
//! One of `TOKEN_ENCRYPTION_KEY` or `SECRET_KEY` must be present for the store to open.

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::util::non_blank;

/// Default primary file name.
pub const DEFAULT_FILE_PATH: &str = "tokens.json";

/// Default cache time-to-live in seconds.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Store configuration.
#[derive(Clone)]
pub struct StoreConfig {
    /// Primary token file
    pub file_path: PathBuf,

    /// Explicit key material
    pub encryption_key: Option<String>,

    /// Fallback application secret for key derivation
    pub app_secret: Option<String>,

    /// How long a loaded snapshot is trusted before re-reading the file
    pub cache_ttl: Duration,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("file_path", &self.file_path)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("app_secret", &self.app_secret.as_ref().map(|_| "<redacted>"))
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `TOKEN_CACHE_TTL_SECS` is not a
    /// non-negative integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_path = lookup("TOKEN_FILE_PATH")
            .and_then(non_blank)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_PATH));

        let cache_ttl = match lookup("TOKEN_CACHE_TTL_SECS").and_then(non_blank) {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|e| {
                    ConfigError::InvalidValue("TOKEN_CACHE_TTL_SECS".to_string(), format!("{}", e))
                })?;
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        };

        Ok(Self {
            file_path,
            encryption_key: lookup("TOKEN_ENCRYPTION_KEY").and_then(non_blank),
            app_secret: lookup("SECRET_KEY").and_then(non_blank),
            cache_ttl,
        })
    }

    /// Create a config for `file_path` with no key material and the default TTL.
    pub fn new(file_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            encryption_key: None,
            app_secret: None,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_app_secret(mut self, secret: impl Into<String>) -> Self {
        self.app_secret = Some(secret.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}
