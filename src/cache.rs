//! String-keyed, TTL-bearing KV cache with FIFO-list and set capabilities.
//!
//! The interface is shaped after a remote cache (Redis-style keyspace, list
//! and set operations) but ships with an in-process backing so the core runs
//! self-contained. Unavailability is a first-class, recoverable outcome:
//! read paths fall through to the durable store, write paths log and
//! continue. The durable store is always the source of truth.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Outcome of a cache lookup.
///
/// `Unavailable` means the cache itself could not be reached; callers must
/// treat it exactly like `Miss` plus a degraded-mode log, never as an error
/// that propagates to clients on read paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Hit(T),
    Miss,
    Unavailable,
}

impl<T> Lookup<T> {
    pub fn hit(self) -> Option<T> {
        match self {
            Self::Hit(v) => Some(v),
            _ => None,
        }
    }

    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Cache write failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable")]
    Unavailable,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process cache with the remote-cache capability set.
///
/// TTL expiry is lazy (checked on read) with a `purge_expired` hook for the
/// sweeper. The `available` switch simulates a cache outage so degraded
/// paths stay exercisable.
pub struct Cache {
    entries: DashMap<String, Entry>,
    lists: DashMap<String, VecDeque<Bytes>>,
    sets: DashMap<String, std::collections::HashSet<String>>,
    available: AtomicBool,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            lists: DashMap::new(),
            sets: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Readiness probe.
    pub fn ping(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Flip availability (operational toggle, also used by outage tests).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.ping() {
            Ok(())
        } else {
            Err(CacheError::Unavailable)
        }
    }

    // === Plain keys ===

    pub fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<std::time::Duration>,
    ) -> Result<(), CacheError> {
        self.check_available()?;
        let expires_at = ttl.and_then(|t| Duration::from_std(t).ok()).map(|d| Utc::now() + d);
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    pub fn get(&self, key: &str) -> Lookup<Bytes> {
        if !self.ping() {
            return Lookup::Unavailable;
        }
        let now = Utc::now();
        // The read guard must be released before the expired-entry removal
        // below; holding both would contend on the same shard.
        let (value, expired) = match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => (None, true),
            Some(entry) => (Some(entry.value.clone()), false),
            None => (None, false),
        };
        if expired {
            self.entries.remove(key);
        }
        match value {
            Some(value) => Lookup::Hit(value),
            None => Lookup::Miss,
        }
    }

    pub fn del(&self, key: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        Ok(self.entries.remove(key).is_some()
            | self.lists.remove(key).is_some()
            | self.sets.remove(key).is_some())
    }

    pub fn has_key(&self, key: &str) -> Lookup<bool> {
        match self.get(key) {
            Lookup::Hit(_) => Lookup::Hit(true),
            Lookup::Miss => Lookup::Hit(self.lists.contains_key(key) || self.sets.contains_key(key)),
            Lookup::Unavailable => Lookup::Unavailable,
        }
    }

    // === JSON codec layered on plain keys ===

    pub fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<std::time::Duration>,
    ) -> Result<(), CacheError> {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, Bytes::from(bytes), ttl),
            Err(e) => {
                warn!(key, error = %e, "Failed to encode cache value");
                Ok(())
            }
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        match self.get(key) {
            Lookup::Hit(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Lookup::Hit(value),
                Err(e) => {
                    // Treat undecodable entries as stale.
                    warn!(key, error = %e, "Evicting undecodable cache entry");
                    let _ = self.del(key);
                    Lookup::Miss
                }
            },
            Lookup::Miss => Lookup::Miss,
            Lookup::Unavailable => Lookup::Unavailable,
        }
    }

    // === FIFO lists ===

    /// Append to the tail; returns the new length.
    pub fn push_right(&self, key: &str, value: Bytes) -> Result<usize, CacheError> {
        self.check_available()?;
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_back(value);
        Ok(list.len())
    }

    /// Pop from the head.
    pub fn pop_left(&self, key: &str) -> Lookup<Bytes> {
        if !self.ping() {
            return Lookup::Unavailable;
        }
        match self.lists.get_mut(key) {
            Some(mut list) => match list.pop_front() {
                Some(value) => Lookup::Hit(value),
                None => Lookup::Miss,
            },
            None => Lookup::Miss,
        }
    }

    pub fn list_len(&self, key: &str) -> Result<usize, CacheError> {
        self.check_available()?;
        Ok(self.lists.get(key).map_or(0, |l| l.len()))
    }

    /// Inclusive range, Redis `LRANGE` semantics for non-negative bounds.
    pub fn list_range(&self, key: &str, start: usize, stop: usize) -> Result<Vec<Bytes>, CacheError> {
        self.check_available()?;
        Ok(self
            .lists
            .get(key)
            .map(|l| {
                l.iter()
                    .skip(start)
                    .take(stop.saturating_sub(start) + 1)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    // === Sets ===

    pub fn set_add(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    pub fn set_remove(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        Ok(self
            .sets
            .get_mut(key)
            .map(|mut s| s.remove(member))
            .unwrap_or(false))
    }

    pub fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.check_available()?;
        Ok(self
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    // === Maintenance ===

    /// Drop expired plain entries eagerly. Lists and sets have no TTL.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }
}

// Cache key namespace. Kept in one place so invalidation sites and read
// sites cannot drift apart.
pub mod keys {
    use uuid::Uuid;

    pub const MESSAGE_QUEUE: &str = "message_queue";
    pub const MESSAGE_QUEUE_DLQ: &str = "message_queue:dlq";

    pub fn conversation(id: &Uuid) -> String {
        format!("conversation:{id}")
    }

    pub fn device_conversations(device_id: &str) -> String {
        format!("device_conversations:{device_id}")
    }

    pub fn conversation_messages(id: &Uuid) -> String {
        format!("conversation_messages:{id}")
    }

    pub fn message(id: &Uuid) -> String {
        format!("message:{id}")
    }

    pub fn device_token(token: &str) -> String {
        format!("device_token:{token}")
    }

    pub fn device_id_tokens(device_id: &str) -> String {
        format!("device_id_tokens:{device_id}")
    }

    pub fn file_upload(file_id: &Uuid) -> String {
        format!("file:upload:{file_id}")
    }
}
