//! TTL-bounded in-memory mirror of the token file.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::types::{Record, RecordSet};

#[derive(Debug)]
pub struct Cache {
    records: RecordSet,
    loaded_at: Option<DateTime<Utc>>,
    ttl: Duration,
}

impl Cache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: RecordSet::new(),
            loaded_at: None,
            ttl,
        }
    }

    /// Whether the snapshot can be trusted at `now` without re-reading disk.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let Some(loaded_at) = self.loaded_at else {
            return false;
        };
        // A negative age (clock moved backwards) fails `to_std` and counts as stale.
        match (now - loaded_at).to_std() {
            Ok(age) => age <= self.ttl,
            Err(_) => false,
        }
    }

    /// Install a snapshot that matches disk as of `now`.
    pub fn replace(&mut self, records: RecordSet, now: DateTime<Utc>) {
        self.records = records;
        self.loaded_at = Some(now);
    }

    /// Record that the current contents were just written to disk.
    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.loaded_at = Some(now);
    }

    /// Force the next access to reload from disk.
    pub fn invalidate(&mut self) {
        self.loaded_at = None;
    }

    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    pub fn get(&self, identity: &str) -> Option<&Record> {
        self.records.get(identity)
    }

    pub fn get_mut(&mut self, identity: &str) -> Option<&mut Record> {
        self.records.get_mut(identity)
    }

    pub fn insert(&mut self, identity: String, record: Record) -> Option<Record> {
        self.records.insert(identity, record)
    }

    pub fn remove(&mut self, identity: &str) -> Option<Record> {
        self.records.remove(identity)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Drop every record expired at `now`, returning the removed identities.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in &expired {
            self.records.remove(identity);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn freshness_follows_ttl() {
        let mut cache = Cache::new(Duration::from_secs(300));
        assert!(!cache.is_fresh(t0()));

        cache.replace(RecordSet::new(), t0());
        assert!(cache.is_fresh(t0()));
        assert!(cache.is_fresh(t0() + chrono::Duration::seconds(300)));
        assert!(!cache.is_fresh(t0() + chrono::Duration::seconds(301)));
        assert!(!cache.is_fresh(t0() - chrono::Duration::seconds(1)));

        cache.mark_synced(t0() + chrono::Duration::seconds(400));
        assert!(cache.is_fresh(t0() + chrono::Duration::seconds(500)));

        cache.invalidate();
        assert!(!cache.is_fresh(t0() + chrono::Duration::seconds(500)));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let mut cache = Cache::new(Duration::from_secs(300));
        cache.insert(
            "old".to_string(),
            Record::new("a".to_string(), t0(), Some(t0() + chrono::Duration::seconds(5))),
        );
        cache.insert("forever".to_string(), Record::new("b".to_string(), t0(), None));

        assert!(cache.sweep_expired(t0()).is_empty());

        let removed = cache.sweep_expired(t0() + chrono::Duration::seconds(5));
        assert_eq!(removed, vec!["old".to_string()]);
        assert_eq!(cache.records().len(), 1);
        assert!(cache.get("forever").is_some());
    }
}
