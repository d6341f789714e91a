//! Record types shared by the cache, the token file and the store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Identity -> record, ordered so the token file diffs cleanly.
pub type RecordSet = BTreeMap<String, Record>;

/// The in-memory form of a stored token.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretSlot {
    /// Decrypted and usable.
    Plain(String),
    /// Ciphertext that failed authentication on load. Written back untouched.
    Sealed(String),
}

impl std::fmt::Debug for SecretSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => f.write_str("Plain(<redacted>)"),
            Self::Sealed(_) => f.write_str("Sealed(..)"),
        }
    }
}

/// One stored credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub secret: SecretSlot,
    pub created_at: DateTime<Utc>,
    /// Absent means the record never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: DateTime<Utc>,
}

impl Record {
    pub fn new(secret: String, now: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: SecretSlot::Plain(secret),
            created_at: now,
            expires_at,
            last_used_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn info(&self, now: DateTime<Utc>) -> TokenInfo {
        TokenInfo {
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_used_at: self.last_used_at,
            is_expired: self.is_expired(now),
        }
    }
}

/// Token metadata without the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: DateTime<Utc>,
    pub is_expired: bool,
}
