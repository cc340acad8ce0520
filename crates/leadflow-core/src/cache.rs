//! Volatile in-process caches.
//!
//! Everything here is lost on restart. Entries expire after a fixed TTL and
//! the oldest entry is evicted once the cache is full, so a long-running
//! process cannot grow these maps without bound.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::{Correlation, TrackingStatus};

struct Slot<V> {
    value: V,
    inserted: Instant,
}

/// Thread-safe string-keyed map with TTL expiry and a size cap.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, Slot<V>>>,
    ttl: Duration,
    max_entries: usize,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Insert or replace. The TTL restarts on every write.
    pub fn insert(&self, key: &str, value: V) {
        let mut map = self.lock();
        self.purge_expired(&mut map);
        if !map.contains_key(key) {
            self.make_room(&mut map);
        }
        map.insert(
            key.to_string(),
            Slot { value, inserted: Instant::now() },
        );
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut map = self.lock();
        match map.get(key) {
            Some(slot) if slot.inserted.elapsed() <= self.ttl => Some(slot.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Mutate an existing live entry in place. Returns false if absent.
    pub fn update<F>(&self, key: &str, f: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let mut map = self.lock();
        match map.get_mut(key) {
            Some(slot) if slot.inserted.elapsed() <= self.ttl => {
                f(&mut slot.value);
                slot.inserted = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Mutate the entry, inserting `init()` first when absent or expired.
    pub fn upsert<I, F>(&self, key: &str, init: I, f: F)
    where
        I: FnOnce() -> V,
        F: FnOnce(&mut V),
    {
        let mut map = self.lock();
        let live = map
            .get(key)
            .is_some_and(|slot| slot.inserted.elapsed() <= self.ttl);
        if !live {
            map.remove(key);
            self.purge_expired(&mut map);
            self.make_room(&mut map);
            map.insert(
                key.to_string(),
                Slot { value: init(), inserted: Instant::now() },
            );
        }
        if let Some(slot) = map.get_mut(key) {
            f(&mut slot.value);
            slot.inserted = Instant::now();
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.lock().remove(key).map(|slot| slot.value)
    }

    /// Live (key, value) pairs.
    pub fn entries(&self) -> Vec<(String, V)> {
        let mut map = self.lock();
        self.purge_expired(&mut map);
        map.iter()
            .map(|(k, slot)| (k.clone(), slot.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let mut map = self.lock();
        self.purge_expired(&mut map);
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn make_room(&self, map: &mut HashMap<String, Slot<V>>) {
        while map.len() >= self.max_entries {
            let oldest = map
                .iter()
                .min_by_key(|(_, slot)| slot.inserted)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    map.remove(&k);
                }
                None => break,
            }
        }
    }

    fn purge_expired(&self, map: &mut HashMap<String, Slot<V>>) {
        let ttl = self.ttl;
        map.retain(|_, slot| slot.inserted.elapsed() <= ttl);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot<V>>> {
        // A panic while holding the lock leaves the map usable; take it back.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// What the dispatcher knew about a call at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallHandle {
    pub tracking_id: String,
    pub status: TrackingStatus,
    pub correlation: Correlation,
    pub updated_at: DateTime<Utc>,
}

/// Quick lookup from external call id to tracking identity, populated at
/// dispatch time so webhooks can correlate before the durable write is visible.
pub struct CallRegistry {
    calls: TtlCache<CallHandle>,
}

impl CallRegistry {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self { calls: TtlCache::new(ttl, max_entries) }
    }

    pub fn register(&self, external_call_id: &str, handle: CallHandle) {
        self.calls.insert(external_call_id, handle);
    }

    pub fn lookup(&self, external_call_id: &str) -> Option<CallHandle> {
        self.calls.get(external_call_id)
    }

    /// Update the cached status if the call is known. Terminal states stick.
    pub fn update_status(&self, external_call_id: &str, status: TrackingStatus) -> bool {
        self.calls.update(external_call_id, |h| {
            if h.status.can_transition_to(status) {
                h.status = status;
            }
            h.updated_at = Utc::now();
        })
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 3600), 10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), 10);
        cache.insert("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.remove("a"), Some(1));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_expiry() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::ZERO, 10);
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b", 2);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("c", 3);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_update_only_existing() {
        let cache: TtlCache<Vec<u32>> = TtlCache::new(Duration::from_secs(60), 10);
        assert!(!cache.update("k", |v| v.push(1)));
        cache.insert("k", vec![]);
        assert!(cache.update("k", |v| v.push(1)));
        assert_eq!(cache.get("k"), Some(vec![1]));
    }

    #[test]
    fn test_registry_status_is_monotonic() {
        let reg = CallRegistry::default();
        reg.register(
            "ext-1",
            CallHandle {
                tracking_id: "call-1".into(),
                status: TrackingStatus::Queued,
                correlation: Correlation::default(),
                updated_at: Utc::now(),
            },
        );
        assert!(reg.update_status("ext-1", TrackingStatus::Completed));
        assert!(reg.update_status("ext-1", TrackingStatus::InProgress));
        assert_eq!(reg.lookup("ext-1").unwrap().status, TrackingStatus::Completed);
        assert!(!reg.update_status("unknown", TrackingStatus::Ringing));
    }
}
