//! Encrypted token storage.
//!
//! Persists one authorization token per identity in a JSON file, encrypted at
//! rest, with a mirrored backup for recovery.
//!
//! ## Architecture
//!
//! ```text
//! tokens.json          # Primary file, owner-only permissions
//! tokens.json.backup   # Last committed state, used when the primary is corrupt
//! tokens.json.tmp      # Transient; renamed over the primary on every write
//! ```
//!
//! The key comes from `TOKEN_ENCRYPTION_KEY`, or is derived from `SECRET_KEY`
//! with PBKDF2 when no explicit key is configured.
//!
//! ## Usage
//!
//! ```ignore
//! let store = TokenStore::open(&StoreConfig::from_env()?)?;
//!
//! store.save("alice", "session-key", Some(chrono::Duration::days(30)));
//! let token = store.get("alice");
//! store.delete("alice");
//! ```

mod cache;
pub mod crypto;
mod error;
mod file;
mod store;
pub mod types;

pub use crypto::{derive_key, generate_key, TokenCipher, KEY_LENGTH};
pub use error::StoreError;
pub use store::{SharedTokenStore, TokenStore};
pub use types::*;
