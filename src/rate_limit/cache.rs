use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Reset instant as reported by the shared store (epoch millis, store clock).
    reset_at_ms: u64,
    /// The same instant translated onto this process's clock.
    expires_local_ms: u64,
}

/// In-process memory of principals known to be spent until a given instant.
///
/// Entries are written only from authoritative store decisions, so a hit can only turn a
/// request away early. It never grants. Expiry is tracked on the local clock from the wait
/// the store reported, so the cache never compares local time with store time.
#[derive(Debug)]
pub struct LocalDenyCache {
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
}

impl Default for LocalDenyCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl LocalDenyCache {
    pub fn new(max_entries: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), max_entries: max_entries.max(1) }
    }

    /// If `key` is still spent at `local_now_ms`, returns the store's reset instant and the
    /// wait left on the local clock.
    pub fn check(&self, key: &str, local_now_ms: u64) -> Option<(u64, Duration)> {
        let mut guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.get(key).copied() {
            Some(e) if local_now_ms < e.expires_local_ms => {
                Some((e.reset_at_ms, Duration::from_millis(e.expires_local_ms - local_now_ms)))
            }
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    /// Remember that `key` is spent until `reset_at_ms` (store clock), which is `wait` away.
    pub fn remember(&self, key: &str, reset_at_ms: u64, wait: Duration, local_now_ms: u64) {
        let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        let entry = Entry { reset_at_ms, expires_local_ms: local_now_ms.saturating_add(wait_ms) };

        let mut guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.max_entries && !guard.contains_key(key) {
            guard.retain(|_, e| e.expires_local_ms > local_now_ms);
            if guard.len() >= self.max_entries {
                return;
            }
        }
        guard.insert(key.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn hit_until_reset_then_expires() {
        let cache = LocalDenyCache::default();
        cache.remember("u", 1_000, ms(1_000), 0);
        assert_eq!(cache.check("u", 999), Some((1_000, ms(1))));
        assert_eq!(cache.check("u", 1_000), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn expiry_follows_local_clock_not_store_clock() {
        let cache = LocalDenyCache::default();
        // Store says reset at 90_000 and we are 60s from it; the local clock reads 5_000.
        cache.remember("u", 90_000, ms(60_000), 5_000);
        assert_eq!(cache.check("u", 64_999), Some((90_000, ms(1))));
        assert_eq!(cache.check("u", 65_000), None);
    }

    #[test]
    fn full_cache_prunes_expired_before_refusing() {
        let cache = LocalDenyCache::new(2);
        cache.remember("a", 10, ms(10), 0);
        cache.remember("b", 500, ms(500), 0);
        cache.remember("c", 500, ms(400), 100);
        assert_eq!(cache.check("a", 100), None);
        assert_eq!(cache.check("c", 100), Some((500, ms(400))));

        cache.remember("d", 900, ms(800), 100);
        assert_eq!(cache.check("d", 100), None);
        assert_eq!(cache.len(), 2);
    }
}
