//! # token-store
//!
//! Local, encrypted store for per-identity authorization tokens.
//!
//! This library provides:
//! - AES-256-GCM encryption of tokens at rest, keyed from configuration
//! - Atomic, owner-only writes with a mirrored backup and one-shot restore
//! - A TTL-bounded in-memory cache shared safely across threads
//! - Lazy expiry on read plus explicit sweeps
//!
//! ## Request Flow
//! 1. Caller invokes `save` / `get` / `delete` / `list_identities`
//! 2. The store lock is taken and the cache reloaded if stale
//! 3. The cache is queried or mutated
//! 4. Mutations are written through to disk before the call returns
//!
//! ## Modules
//! - `secrets`: the store, its cache, file format and cipher
//! - `config`: environment-driven configuration
//! - `clock`: injectable time source

pub mod clock;
pub mod config;
pub mod secrets;
pub mod util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreConfig;
pub use secrets::{SharedTokenStore, StoreError, TokenInfo, TokenStore};
