//! In-process implementation of the shared cache contract.
//!
//! Used for single-instance deployments that still want the fixed-window
//! semantics of the shared backend, and by tests in place of redis.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{CacheError, CacheResult, SharedCache};
use crate::core::clock::{system_clock, Clock};

#[derive(Debug, Clone)]
enum CacheValue {
    Counter(i64),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: CacheValue,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// DashMap-backed cache with lazy expiry
pub struct MemoryCache {
    data: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: DashMap::new(),
            clock,
        }
    }

    /// Drop expired entries
    pub fn cleanup_expired(&self) {
        let now = self.clock.now();
        self.data.retain(|_, entry| entry.is_live(now));
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let now = self.clock.now();
        let entry = self.data.get(key)?.clone();
        if entry.is_live(now) {
            Some(entry)
        } else {
            self.data.remove_if(key, |_, e| !e.is_live(now));
            None
        }
    }

    fn expiry(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get_counter(&self, key: &str) -> CacheResult<Option<i64>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: CacheValue::Counter(count),
                ..
            }) => Ok(Some(count)),
            Some(_) => Err(CacheError::Malformed {
                key: key.to_string(),
                reason: "expected a counter, found a hash".to_string(),
            }),
        }
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        let now = self.clock.now();
        let fresh_expiry = self.expiry(ttl);

        let mut entry = self.data.entry(key.to_string()).or_insert(Entry {
            value: CacheValue::Counter(0),
            expires_at: fresh_expiry,
        });

        if !entry.is_live(now) {
            *entry = Entry {
                value: CacheValue::Counter(0),
                expires_at: fresh_expiry,
            };
        }
        if entry.expires_at.is_none() {
            entry.expires_at = fresh_expiry;
        }

        match &mut entry.value {
            CacheValue::Counter(count) => {
                *count += 1;
                Ok(*count)
            }
            CacheValue::Hash(_) => Err(CacheError::Malformed {
                key: key.to_string(),
                reason: "expected a counter, found a hash".to_string(),
            }),
        }
    }

    async fn hash_get_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        match self.live(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: CacheValue::Hash(fields),
                ..
            }) => Ok(fields),
            Some(_) => Err(CacheError::Malformed {
                key: key.to_string(),
                reason: "expected a hash, found a counter".to_string(),
            }),
        }
    }

    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> CacheResult<()> {
        let entry = Entry {
            value: CacheValue::Hash(fields.iter().cloned().collect()),
            expires_at: self.expiry(ttl),
        };
        self.data.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.data.remove(key);
        Ok(())
    }
}
