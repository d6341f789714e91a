//! JSON token file with atomic writes and a mirrored backup.
//!
//! Layout on disk (pretty-printed, one entry per identity):
//!
//! ```text
//! {
//!   "alice": {
//!     "token": "<encrypted v=\"1\">...</encrypted>",
//!     "created_at": "2025-01-01T12:00:00Z",
//!     "expires_at": null,
//!     "last_used_at": "2025-01-02T08:30:00Z"
//!   }
//! }
//! ```
//!
//! A bare string value (`"alice": "<encrypted ...>"`) is the legacy layout and
//! is upgraded in memory on load.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::crypto::TokenCipher;
use super::error::StoreError;
use super::types::{Record, RecordSet, SecretSlot};
use crate::util::sibling_with_suffix;

const EMPTY_DOCUMENT: &[u8] = b"{}";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Legacy(String),
    Full(StoredRecord),
}

#[derive(Debug, Deserialize)]
struct StoredRecord {
    token: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default, alias = "last_used")]
    last_used_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct StoredRecordOut {
    token: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    last_used_at: DateTime<Utc>,
}

/// Accept RFC 3339 or a naive ISO-8601 timestamp (read as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Write `data` to `target` via a same-directory temp file and rename.
fn write_atomic(target: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = sibling_with_suffix(target, ".tmp");
    if tmp.exists() {
        let _ = std::fs::remove_file(&tmp);
    }

    let res = (|| -> std::io::Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        restrict_permissions(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
        std::fs::rename(&tmp, target)?;
        restrict_permissions(target)
    })();

    res.map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        StoreError::storage(target, e)
    })
}

/// Persistence for one token file and its `.backup` sibling.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
    backup_path: PathBuf,
    cipher: TokenCipher,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>, cipher: TokenCipher) -> Self {
        let path = path.into();
        let backup_path = sibling_with_suffix(&path, ".backup");
        Self {
            path,
            backup_path,
            cipher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Create the parent directory and the primary file if missing. A
    /// surviving backup is restored; otherwise the file starts empty.
    pub fn ensure_exists(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::storage(parent, e))?;
        }
        if !self.restore_if_missing()? && !self.path.exists() {
            write_atomic(&self.path, EMPTY_DOCUMENT)?;
            tracing::info!(path = %self.path.display(), "Created token file");
        }
        Ok(())
    }

    /// Copy the backup over a missing primary. Returns whether it did.
    fn restore_if_missing(&self) -> Result<bool, StoreError> {
        if self.path.exists() || !self.backup_path.exists() {
            return Ok(false);
        }
        tracing::warn!(
            path = %self.path.display(),
            "Token file missing but backup present; restoring from backup"
        );
        self.restore_from_backup()?;
        Ok(true)
    }

    /// Read and decrypt the record set, restoring from backup once on corruption.
    pub fn load(&self, now: DateTime<Utc>) -> Result<RecordSet, StoreError> {
        self.restore_if_missing()?;
        match self.load_once(now) {
            Err(err) if err.is_corruption() => {
                tracing::warn!(
                    path = %self.path.display(),
                    "{}; restoring from backup",
                    err
                );
                self.restore_from_backup()?;
                self.load_once(now).map_err(|retry_err| {
                    tracing::error!(
                        path = %self.path.display(),
                        "Token file still unreadable after restore: {}",
                        retry_err
                    );
                    retry_err
                })
            }
            other => other,
        }
    }

    fn load_once(&self, now: DateTime<Utc>) -> Result<RecordSet, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "Token file missing, starting empty");
                return Ok(RecordSet::new());
            }
            Err(err) => return Err(StoreError::storage(&self.path, err)),
        };

        let document: BTreeMap<String, StoredEntry> = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::corruption(&self.path, e))?;

        let mut records = RecordSet::new();
        for (identity, entry) in document {
            let record = self.decode_entry(&identity, entry, now)?;
            records.insert(identity, record);
        }
        Ok(records)
    }

    fn decode_entry(
        &self,
        identity: &str,
        entry: StoredEntry,
        now: DateTime<Utc>,
    ) -> Result<Record, StoreError> {
        let timestamp = |field: &str, raw: Option<String>| -> Result<Option<DateTime<Utc>>, StoreError> {
            match raw {
                None => Ok(None),
                Some(raw) => parse_timestamp(&raw).map(Some).ok_or_else(|| {
                    StoreError::corruption(
                        &self.path,
                        format!("invalid {} for {:?}: {:?}", field, identity, raw),
                    )
                }),
            }
        };

        let (token, created_at, expires_at, last_used_at) = match entry {
            StoredEntry::Legacy(token) => {
                tracing::debug!(identity = %identity, "Upgrading legacy token entry");
                (token, None, None, None)
            }
            StoredEntry::Full(stored) => (
                stored.token,
                timestamp("created_at", stored.created_at)?,
                timestamp("expires_at", stored.expires_at)?,
                timestamp("last_used_at", stored.last_used_at)?,
            ),
        };

        let secret = match self.cipher.decrypt(&token) {
            Ok(plain) => SecretSlot::Plain(plain),
            Err(err) => {
                tracing::warn!(identity = %identity, "Keeping undecryptable token sealed: {}", err);
                SecretSlot::Sealed(token)
            }
        };

        Ok(Record {
            secret,
            created_at: created_at.unwrap_or(now),
            expires_at,
            last_used_at: last_used_at.unwrap_or(now),
        })
    }

    /// Replace the primary file with the backup, or with an empty document
    /// if there is no backup.
    fn restore_from_backup(&self) -> Result<(), StoreError> {
        match std::fs::read(&self.backup_path) {
            Ok(bytes) => {
                write_atomic(&self.path, &bytes)?;
                tracing::info!(
                    path = %self.path.display(),
                    backup = %self.backup_path.display(),
                    "Restored token file from backup"
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                write_atomic(&self.path, EMPTY_DOCUMENT)?;
                tracing::warn!(
                    path = %self.path.display(),
                    "No backup available, reinitialized empty token file"
                );
            }
            Err(err) => return Err(StoreError::storage(&self.backup_path, err)),
        }
        Ok(())
    }

    /// Copy the current primary over the backup, unless the primary is unreadable.
    fn snapshot_backup(&self) -> Result<(), StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StoreError::storage(&self.path, err)),
        };
        if serde_json::from_slice::<BTreeMap<String, StoredEntry>>(&bytes).is_err() {
            tracing::warn!(
                path = %self.path.display(),
                "Primary token file is corrupt, leaving backup untouched"
            );
            return Ok(());
        }
        write_atomic(&self.backup_path, &bytes)
    }

    /// Encrypt and persist the full record set.
    pub fn save(&self, records: &RecordSet) -> Result<(), StoreError> {
        self.snapshot_backup()?;

        let mut document = BTreeMap::new();
        for (identity, record) in records {
            let token = match &record.secret {
                SecretSlot::Plain(plain) => self.cipher.encrypt(plain)?,
                SecretSlot::Sealed(ciphertext) => ciphertext.clone(),
            };
            document.insert(
                identity.as_str(),
                StoredRecordOut {
                    token,
                    created_at: record.created_at,
                    expires_at: record.expires_at,
                    last_used_at: record.last_used_at,
                },
            );
        }
        let data = serde_json::to_vec_pretty(&document)
            .map_err(|e| StoreError::storage(&self.path, std::io::Error::other(e)))?;

        write_atomic(&self.path, &data)?;

        if let Err(err) = write_atomic(&self.backup_path, &data) {
            tracing::warn!("Token file saved but backup refresh failed: {}", err);
        }

        tracing::debug!(
            path = %self.path.display(),
            count = records.len(),
            "Saved token file"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn cipher() -> TokenCipher {
        TokenCipher::new(&[7u8; 32])
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn one_record(identity: &str, secret: &str) -> RecordSet {
        let mut records = RecordSet::new();
        records.insert(
            identity.to_string(),
            Record::new(secret.to_string(), now(), Some(now() + Duration::days(1))),
        );
        records
    }

    #[test]
    fn ensure_exists_creates_empty_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("nested/tokens.json"), cipher());

        file.ensure_exists().unwrap();

        let raw = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(raw, "{}");
        assert!(file.load(now()).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn written_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        file.ensure_exists().unwrap();
        file.save(&one_record("alice", "secret")).unwrap();

        for path in [file.path(), file.backup_path()] {
            let mode = std::fs::metadata(path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600, "{}", path.display());
        }
        assert!(!sibling_with_suffix(file.path(), ".tmp").exists());
    }

    #[test]
    fn save_writes_encrypted_tokens_with_metadata() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        file.save(&one_record("alice", "session-key")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        let entry = &raw["alice"];
        assert_ne!(entry["token"], "session-key");
        assert!(entry["token"].as_str().unwrap().starts_with("<encrypted v=\"1\">"));
        assert_eq!(entry["created_at"], "2025-03-01T09:00:00Z");
        assert_eq!(entry["expires_at"], "2025-03-02T09:00:00Z");
        assert_eq!(entry["last_used_at"], "2025-03-01T09:00:00Z");

        let loaded = file.load(now()).unwrap();
        assert_eq!(loaded, one_record("alice", "session-key"));
    }

    #[test]
    fn legacy_bare_string_entries_are_upgraded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        let ciphertext = cipher().encrypt("old-token").unwrap();
        std::fs::write(
            file.path(),
            serde_json::json!({ "u": ciphertext }).to_string(),
        )
        .unwrap();

        let loaded = file.load(now()).unwrap();
        let record = &loaded["u"];
        assert_eq!(record.secret, SecretSlot::Plain("old-token".to_string()));
        assert_eq!(record.created_at, now());
        assert_eq!(record.last_used_at, now());
        assert_eq!(record.expires_at, None);

        // Not re-persisted until the next save.
        let raw = std::fs::read_to_string(file.path()).unwrap();
        assert!(!raw.contains("created_at"));
    }

    #[test]
    fn naive_timestamps_and_old_field_name_are_accepted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        let doc = serde_json::json!({
            "bob": {
                "token": cipher().encrypt("t").unwrap(),
                "created_at": "2024-12-31T23:59:59.123456",
                "expires_at": null,
                "last_used": "2025-01-01T00:00:00"
            }
        });
        std::fs::write(file.path(), doc.to_string()).unwrap();

        let record = &file.load(now()).unwrap()["bob"];
        assert_eq!(
            record.last_used_at,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(record.created_at.timestamp(), 1_735_689_599);
    }

    #[test]
    fn corrupt_primary_is_restored_from_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        file.ensure_exists().unwrap();
        file.save(&one_record("alice", "secret")).unwrap();

        std::fs::write(file.path(), "invalid json").unwrap();

        let loaded = file.load(now()).unwrap();
        assert_eq!(loaded["alice"].secret, SecretSlot::Plain("secret".to_string()));
        assert_eq!(
            std::fs::read(file.path()).unwrap(),
            std::fs::read(file.backup_path()).unwrap()
        );
    }

    #[test]
    fn corrupt_primary_without_backup_starts_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        std::fs::write(file.path(), [0xffu8, 0x00, 0x13]).unwrap();

        assert!(file.load(now()).unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "{}");
    }

    #[test]
    fn corrupt_backup_fails_after_a_single_retry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        std::fs::write(file.path(), "[1, 2").unwrap();
        std::fs::write(file.backup_path(), "also broken").unwrap();

        let err = file.load(now()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn non_object_document_is_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        std::fs::write(file.path(), "[\"alice\"]").unwrap();
        std::fs::write(file.backup_path(), "42").unwrap();

        assert!(file.load(now()).unwrap_err().is_corruption());
    }

    #[test]
    fn corrupt_primary_does_not_clobber_backup_on_save() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        file.save(&one_record("alice", "secret")).unwrap();
        let good_backup = std::fs::read(file.backup_path()).unwrap();

        std::fs::write(file.path(), "garbage").unwrap();
        file.snapshot_backup().unwrap();

        assert_eq!(std::fs::read(file.backup_path()).unwrap(), good_backup);
    }

    #[test]
    fn undecryptable_tokens_survive_a_save() {
        let temp = tempfile::tempdir().expect("tempdir");
        let foreign = TokenCipher::new(&[9u8; 32]).encrypt("foreign").unwrap();
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        std::fs::write(
            file.path(),
            serde_json::json!({ "mallory": foreign.clone() }).to_string(),
        )
        .unwrap();

        let mut records = file.load(now()).unwrap();
        assert_eq!(records["mallory"].secret, SecretSlot::Sealed(foreign.clone()));

        records.extend(one_record("alice", "secret"));
        file.save(&records).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(raw["mallory"]["token"], foreign.as_str());
    }

    #[test]
    fn invalid_timestamp_triggers_restore() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        file.save(&one_record("alice", "secret")).unwrap();
        let doc = serde_json::json!({
            "bob": { "token": cipher().encrypt("t").unwrap(), "created_at": "yesterday" }
        });
        std::fs::write(file.path(), doc.to_string()).unwrap();

        let loaded = file.load(now()).unwrap();
        assert!(loaded.contains_key("alice"));
        assert!(!loaded.contains_key("bob"));
    }

    #[test]
    fn missing_primary_is_restored_from_surviving_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        file.save(&one_record("alice", "secret")).unwrap();
        std::fs::remove_file(file.path()).unwrap();

        file.ensure_exists().unwrap();
        let loaded = file.load(now()).unwrap();
        assert_eq!(loaded["alice"].secret, SecretSlot::Plain("secret".to_string()));

        // Same when the primary vanishes after the store is open.
        std::fs::remove_file(file.path()).unwrap();
        assert!(file.load(now()).unwrap().contains_key("alice"));

        file.save(&one_record("bob", "other")).unwrap();
        let backup = std::fs::read_to_string(file.backup_path()).unwrap();
        assert!(backup.contains("bob"));
    }

    #[test]
    fn failed_primary_write_leaves_prior_document_in_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = TokenFile::new(temp.path().join("tokens.json"), cipher());
        file.save(&one_record("alice", "secret")).unwrap();

        // A committed document that differs from the last mirrored backup.
        let prior = serde_json::json!({ "bob": cipher().encrypt("bob-token").unwrap() }).to_string();
        std::fs::write(file.path(), &prior).unwrap();

        let tmp = sibling_with_suffix(file.path(), ".tmp");
        std::fs::create_dir(&tmp).unwrap();

        let err = file.save(&one_record("carol", "new")).unwrap_err();
        assert!(matches!(err, StoreError::Storage { .. }));
        assert_eq!(std::fs::read_to_string(file.backup_path()).unwrap(), prior);
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), prior);

        std::fs::remove_dir(&tmp).unwrap();
        let loaded = file.load(now()).unwrap();
        assert!(loaded.contains_key("bob"));
        assert!(!loaded.contains_key("carol"));
    }
}
