//! The public token store.
//!
//! Every operation takes the same mutex, so cache mutation and file I/O never
//! interleave. Writes go to disk synchronously before the call returns.

use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use super::cache::Cache;
use super::crypto::{derive_key, TokenCipher};
use super::error::StoreError;
use super::file::TokenFile;
use super::types::{Record, SecretSlot, TokenInfo};
use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;

struct Inner {
    cache: Cache,
    file: TokenFile,
}

impl Inner {
    /// Reload if stale; on failure keep serving the old snapshot.
    ///
    /// Returns whether the snapshot matches disk. A stale snapshot must not
    /// be flushed.
    fn refresh_for_read(&mut self, now: DateTime<Utc>) -> bool {
        if self.cache.is_fresh(now) {
            return true;
        }
        match self.file.load(now) {
            Ok(records) => {
                self.cache.replace(records, now);
                true
            }
            Err(err) => {
                tracing::warn!("Token cache refresh failed, serving stale data: {}", err);
                false
            }
        }
    }

    /// Reload if stale; a write never proceeds on a stale snapshot.
    fn refresh_for_write(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.cache.is_fresh(now) {
            let records = self.file.load(now)?;
            self.cache.replace(records, now);
        }
        Ok(())
    }

    /// Persist the whole cache. On failure the cache no longer matches disk,
    /// so it is invalidated and the next call reloads.
    fn flush(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        match self.file.save(self.cache.records()) {
            Ok(()) => {
                self.cache.mark_synced(now);
                Ok(())
            }
            Err(err) => {
                self.cache.invalidate();
                Err(err)
            }
        }
    }
}

/// Encrypted, file-backed store of per-identity tokens.
pub struct TokenStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl TokenStore {
    /// Open the store described by `config` using the system clock.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with an explicit clock.
    ///
    /// Fails with `Configuration` when there is no key material and with
    /// `Corruption` when neither the file nor its backup can be read.
    pub fn open_with_clock(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let key = derive_key(config.encryption_key.as_deref(), config.app_secret.as_deref())?;
        let file = TokenFile::new(&config.file_path, TokenCipher::new(&key));
        file.ensure_exists()?;

        let now = clock.now();
        let records = file.load(now)?;
        tracing::info!(
            path = %file.path().display(),
            count = records.len(),
            "Opened token store"
        );

        let mut cache = Cache::new(config.cache_ttl);
        cache.replace(records, now);

        Ok(Self {
            inner: Mutex::new(Inner { cache, file }),
            clock,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Token store lock poisoned, reloading from disk");
                let mut guard = poisoned.into_inner();
                guard.cache.invalidate();
                guard
            }
        }
    }

    pub fn file_path(&self) -> PathBuf {
        self.lock().file.path().to_path_buf()
    }

    pub fn backup_path(&self) -> PathBuf {
        self.lock().file.backup_path().to_path_buf()
    }

    /// Store `secret` for `identity`, replacing any existing record.
    ///
    /// `ttl` sets an absolute expiry relative to now; a negative `ttl` stores
    /// an already-expired record.
    pub fn try_save(
        &self,
        identity: &str,
        secret: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        if identity.is_empty() {
            return Err(StoreError::Validation("identity must not be empty"));
        }
        if secret.is_empty() {
            return Err(StoreError::Validation("secret must not be empty"));
        }

        let mut inner = self.lock();
        let now = self.clock.now();
        let expires_at = match ttl {
            Some(ttl) => Some(
                now.checked_add_signed(ttl)
                    .ok_or(StoreError::Validation("ttl is out of range"))?,
            ),
            None => None,
        };

        inner.refresh_for_write(now)?;
        inner
            .cache
            .insert(identity.to_string(), Record::new(secret.to_string(), now, expires_at));
        inner.flush(now)?;

        tracing::info!(identity = %identity, expires_at = ?expires_at, "Saved token");
        Ok(())
    }

    /// [`TokenStore::try_save`], reporting failure as `false`.
    pub fn save(&self, identity: &str, secret: &str, ttl: Option<Duration>) -> bool {
        match self.try_save(identity, secret, ttl) {
            Ok(()) => true,
            Err(err @ StoreError::Validation(_)) => {
                tracing::warn!(identity = %identity, "Rejected token save: {}", err);
                false
            }
            Err(err) => {
                tracing::error!(identity = %identity, "Failed to save token: {}", err);
                false
            }
        }
    }

    /// Return the secret for `identity`, bumping its last-used time.
    ///
    /// An expired record is deleted and reported as absent. A record whose
    /// ciphertext cannot be authenticated yields `StoreError::Decryption`.
    pub fn try_get(&self, identity: &str) -> Result<Option<String>, StoreError> {
        if identity.is_empty() {
            return Ok(None);
        }

        let mut inner = self.lock();
        let now = self.clock.now();
        let synced = inner.refresh_for_read(now);

        let Some(record) = inner.cache.get(identity) else {
            tracing::debug!(identity = %identity, "Token not found");
            return Ok(None);
        };

        if record.is_expired(now) {
            if !synced {
                return Ok(None);
            }
            tracing::info!(identity = %identity, "Token expired, removing");
            inner.cache.remove(identity);
            inner.flush(now)?;
            return Ok(None);
        }

        let secret = match &record.secret {
            SecretSlot::Plain(secret) => secret.clone(),
            SecretSlot::Sealed(_) => {
                return Err(StoreError::Decryption(format!(
                    "stored token for {:?} failed authentication",
                    identity
                )));
            }
        };

        if !synced {
            return Ok(Some(secret));
        }
        if let Some(record) = inner.cache.get_mut(identity) {
            record.last_used_at = now;
        }
        if let Err(err) = inner.flush(now) {
            tracing::warn!(identity = %identity, "Could not persist last-used time: {}", err);
        }

        Ok(Some(secret))
    }

    /// [`TokenStore::try_get`], collapsing every failure to `None`.
    pub fn get(&self, identity: &str) -> Option<String> {
        match self.try_get(identity) {
            Ok(secret) => secret,
            Err(err @ StoreError::Decryption(_)) => {
                tracing::error!(identity = %identity, "Token decryption failure: {}", err);
                None
            }
            Err(err) => {
                tracing::error!(identity = %identity, "Failed to read token: {}", err);
                None
            }
        }
    }

    /// Remove `identity`. Returns whether a record existed.
    pub fn try_delete(&self, identity: &str) -> Result<bool, StoreError> {
        if identity.is_empty() {
            return Ok(false);
        }

        let mut inner = self.lock();
        let now = self.clock.now();
        inner.refresh_for_write(now)?;

        if inner.cache.remove(identity).is_none() {
            return Ok(false);
        }
        inner.flush(now)?;
        tracing::info!(identity = %identity, "Deleted token");
        Ok(true)
    }

    /// [`TokenStore::try_delete`], reporting failure as `false`.
    pub fn delete(&self, identity: &str) -> bool {
        self.try_delete(identity).unwrap_or_else(|err| {
            tracing::error!(identity = %identity, "Failed to delete token: {}", err);
            false
        })
    }

    /// Identities with live tokens. Expired records are swept first.
    pub fn list_identities(&self) -> Vec<String> {
        let mut inner = self.lock();
        let now = self.clock.now();
        if !inner.refresh_for_read(now) {
            return inner
                .cache
                .records()
                .iter()
                .filter(|(_, record)| !record.is_expired(now))
                .map(|(identity, _)| identity.clone())
                .collect();
        }

        let removed = inner.cache.sweep_expired(now);
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Swept expired tokens");
            if let Err(err) = inner.flush(now) {
                tracing::error!("Failed to persist expiry sweep: {}", err);
            }
        }

        inner.cache.records().keys().cloned().collect()
    }

    /// Metadata for `identity`. Does not touch the secret or the last-used time.
    pub fn get_info(&self, identity: &str) -> Option<TokenInfo> {
        let mut inner = self.lock();
        let now = self.clock.now();
        inner.refresh_for_read(now);
        inner.cache.get(identity).map(|record| record.info(now))
    }

    /// Remove every record.
    pub fn try_clear_all(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let now = self.clock.now();
        inner.cache.clear();
        inner.flush(now)?;
        tracing::info!("Cleared all tokens");
        Ok(())
    }

    /// [`TokenStore::try_clear_all`], reporting failure as `false`.
    pub fn clear_all(&self) -> bool {
        match self.try_clear_all() {
            Ok(()) => true,
            Err(err) => {
                tracing::error!("Failed to clear tokens: {}", err);
                false
            }
        }
    }

    /// Number of unexpired records.
    ///
    /// Sealed records that fail decryption are counted, although `get`
    /// reports them absent.
    pub fn count(&self) -> usize {
        let mut inner = self.lock();
        let now = self.clock.now();
        inner.refresh_for_read(now);
        inner
            .cache
            .records()
            .values()
            .filter(|record| !record.is_expired(now))
            .count()
    }

    /// Whether `identity` has an unexpired record.
    ///
    /// True for a sealed record even though `get` reports it absent.
    pub fn contains(&self, identity: &str) -> bool {
        let mut inner = self.lock();
        let now = self.clock.now();
        inner.refresh_for_read(now);
        inner
            .cache
            .get(identity)
            .is_some_and(|record| !record.is_expired(now))
    }

    /// Delete every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.lock();
        let now = self.clock.now();
        if let Err(err) = inner.refresh_for_write(now) {
            tracing::error!("Skipping expiry sweep, token file unreadable: {}", err);
            return 0;
        }

        let removed = inner.cache.sweep_expired(now);
        if removed.is_empty() {
            return 0;
        }
        if let Err(err) = inner.flush(now) {
            tracing::error!("Failed to persist expiry sweep: {}", err);
            return 0;
        }
        tracing::info!(count = removed.len(), "Purged expired tokens");
        removed.len()
    }

    /// Sweep expired records and release the store.
    pub fn shutdown(self) {
        let purged = self.purge_expired();
        let remaining = self.lock().cache.records().len();
        tracing::info!(purged, remaining, "Token store closed");
    }
}

/// Token store shared across request handlers.
pub type SharedTokenStore = Arc<TokenStore>;
