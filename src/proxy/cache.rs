//! Credential-keyed TTL cache for token responses
//!
//! A single reader-writer lock protects the whole map. Lookups take the read
//! lock; population and eviction take the write lock, so a reader never
//! observes a half-written entry and eviction never races a lookup.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http::{HeaderMap, StatusCode};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use super::Fingerprint;

/// A cached token response
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Response body as returned by the upstream
    pub body: Bytes,
    /// Response headers, single valued
    pub headers: HeaderMap,
    /// Upstream status code
    pub status: StatusCode,
    /// Absolute instant the entry stops being served
    pub expiry: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry is valid until its expiry instant
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }
}

/// Expiry hint embedded in a successful token response body
#[derive(Deserialize)]
struct TokenExpiry {
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
}

/// The token cache
pub struct TokenCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    ttl: TimeDelta,
}

impl TokenCache {
    /// Create an empty cache whose entries live for `ttl`
    #[must_use]
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Fetch the entry for a fingerprint, expired or not
    #[must_use]
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.entries.read().get(fingerprint).cloned()
    }

    /// Insert or overwrite the entry for a fingerprint
    ///
    /// The expiry is `now + ttl`, tightened to the `expiry` timestamp a
    /// successful response carries in its body when that lands between now
    /// and the TTL horizon. Callers gate admission: responses with status
    /// 500+ or 429 must not be passed in.
    pub fn update(&self, fingerprint: Fingerprint, headers: HeaderMap, body: Bytes, status: StatusCode) {
        info!(path = %fingerprint.path, status = %status.as_u16(), "update cache");

        let now = Utc::now();
        let mut expiry = now + self.ttl;

        if status == StatusCode::OK {
            // A token carrying a shorter expiry than our ttl wins
            if let Ok(token) = serde_json::from_slice::<TokenExpiry>(&body) {
                if let Some(token_expiry) = token.expiry {
                    if token_expiry > now && token_expiry < expiry {
                        expiry = token_expiry;
                    }
                }
            }
        }

        let entry = CacheEntry {
            body,
            headers,
            status,
            expiry,
        };

        self.entries.write().insert(fingerprint, entry);
    }

    /// Evict every entry that expired before `now`
    pub fn clean(&self, now: DateTime<Utc>) {
        info!("running housekeeping");

        self.entries.write().retain(|_, entry| entry.expiry >= now);
    }

    /// Number of entries currently held, expired or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Rewrite an entry's expiry so tests can age it on demand
    #[cfg(test)]
    pub(crate) fn force_expiry(&self, fingerprint: &Fingerprint, expiry: DateTime<Utc>) {
        if let Some(entry) = self.entries.write().get_mut(fingerprint) {
            entry.expiry = expiry;
        }
    }
}
