//! Short-lived in-process tier in front of the verdict store.

use crate::verdict::{now_millis, VerdictKind, VerdictRecord};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Cached verdict row.
#[derive(Debug, Clone)]
pub struct CachedVerdict {
    pub record: VerdictRecord,
    /// When this entry was cached.
    pub cached_at: Instant,
    pub ttl: Duration,
    /// Freshness window measured from `record.created`.
    pub max_age_millis: i64,
}

impl CachedVerdict {
    /// Expired once either the tier TTL or the row's own freshness window lapses.
    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl || is_stale(&self.record, self.max_age_millis)
    }
}

fn is_stale(record: &VerdictRecord, max_age_millis: i64) -> bool {
    now_millis().saturating_sub(record.created) > max_age_millis
}

type Key = (String, VerdictKind);

/// Thread-safe TTL cache of verdicts keyed by IP and policy.
pub struct VerdictCache {
    cache: RwLock<HashMap<Key, CachedVerdict>>,
    default_ttl: Duration,
    max_entries: usize,
    max_age_millis: i64,
}

impl VerdictCache {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            default_ttl,
            max_entries,
            max_age_millis: i64::MAX,
        }
    }

    /// Never serve a row older than `max_age_millis`, matching the store's
    /// freshness window.
    pub fn with_max_age(mut self, max_age_millis: i64) -> Self {
        self.max_age_millis = max_age_millis;
        self
    }

    /// A zero TTL or zero capacity turns the tier off.
    pub fn is_enabled(&self) -> bool {
        !self.default_ttl.is_zero() && self.max_entries > 0
    }

    /// Cached row for `ip` under `kind`, if present and not expired.
    pub fn get(&self, ip: &str, kind: VerdictKind) -> Option<VerdictRecord> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(&(ip.to_string(), kind))?;

        if entry.is_expired() {
            // Left for cleanup to avoid taking the write lock here
            None
        } else {
            Some(entry.record.clone())
        }
    }

    /// Cache a row under its own IP and policy.
    pub fn insert(&self, record: VerdictRecord) {
        if !self.is_enabled() || is_stale(&record, self.max_age_millis) {
            return;
        }
        let key = (record.ip.clone(), record.verdict.kind());
        let entry = CachedVerdict {
            record,
            cached_at: Instant::now(),
            ttl: self.default_ttl,
            max_age_millis: self.max_age_millis,
        };

        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= self.max_entries && !cache.contains_key(&key) {
                cache.retain(|_, v| !v.is_expired());

                if cache.len() >= self.max_entries {
                    if let Some(oldest) = cache
                        .iter()
                        .min_by_key(|(_, v)| v.cached_at)
                        .map(|(k, _)| k.clone())
                    {
                        cache.remove(&oldest);
                    }
                }
            }

            cache.insert(key, entry);
        }
    }

    /// Replace the entry only if `record` is newer than what is cached.
    ///
    /// Used for verdicts arriving from other nodes.
    pub fn refresh(&self, record: VerdictRecord) {
        let newer = self
            .get(&record.ip, record.verdict.kind())
            .map_or(true, |cached| cached.created < record.created);
        if newer {
            self.insert(record);
        }
    }

    /// Drop every cached row for `ip`.
    pub fn invalidate(&self, ip: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|(cached_ip, _), _| cached_ip != ip);
        }
    }

    /// Remove expired entries.
    pub fn cleanup(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, v| !v.is_expired());
        }
    }

    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }
}
