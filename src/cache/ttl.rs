//! In-memory key/value map with per-entry expiration.
//!
//! Expiry is checked lazily on read; expired entries stay in the map until
//! [`TtlCache::cleanup`] or [`TtlCache::delete`] removes them.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

use super::lock::{rw_read, rw_write};

const LOCK_TARGET: &str = "cache::ttl";

/// Expiration requested for a single [`TtlCache::set`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Use the cache's configured default.
    Default,
    Never,
    After(Duration),
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Generic expiring map guarded by a reader/writer lock.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    default_ttl: Option<Duration>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// `default_ttl` of `None` means entries never expire unless a duration
    /// is given explicitly.
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let guard = rw_read(&self.entries, LOCK_TARGET, "get");
        guard
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    pub fn set(&self, key: K, value: V, expiration: Expiration) {
        let ttl = match expiration {
            Expiration::Default => self.default_ttl,
            Expiration::Never => None,
            Expiration::After(ttl) => Some(ttl),
        };
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut guard = rw_write(&self.entries, LOCK_TARGET, "set");
        guard.insert(key, Entry { value, expires_at });
    }

    pub fn insert(&self, key: K, value: V) {
        self.set(key, value, Expiration::Default);
    }

    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        rw_write(&self.entries, LOCK_TARGET, "delete")
            .remove(key)
            .is_some()
    }

    /// Remove every entry expired as of now and return how many were dropped.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut guard = rw_write(&self.entries, LOCK_TARGET, "cleanup");
        let before = guard.len();
        guard.retain(|_, entry| !entry.is_expired(now));
        before - guard.len()
    }

    pub fn flush(&self) {
        rw_write(&self.entries, LOCK_TARGET, "flush").clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, LOCK_TARGET, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage for cached version lists, keyed by coordinate cache key.
pub trait VersionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<String>>;
    fn set(&self, key: String, versions: Vec<String>, expiration: Expiration);
}

impl VersionStore for TtlCache<String, Vec<String>> {
    fn get(&self, key: &str) -> Option<Vec<String>> {
        TtlCache::get(self, key)
    }

    fn set(&self, key: String, versions: Vec<String>, expiration: Expiration) {
        TtlCache::set(self, key, versions, expiration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl: Option<Duration>) -> TtlCache<String, String> {
        TtlCache::new(ttl)
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_default_ttl() {
        let cache = cache(Some(Duration::from_secs(10)));
        cache.insert("k".to_string(), "v".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_read_does_not_remove_entry() {
        let cache = cache(Some(Duration::from_secs(1)));
        cache.insert("k".to_string(), "v".to_string());
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.cleanup(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_default_never_expires() {
        let cache = cache(None);
        cache.insert("k".to_string(), "v".to_string());
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert_eq!(cache.cleanup(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_expiration_overrides_default() {
        let cache = cache(Some(Duration::from_secs(10)));
        cache.set("short".into(), "a".into(), Expiration::After(Duration::from_secs(1)));
        cache.set("forever".into(), "b".into(), Expiration::Never);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("forever").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn set_overwrites_and_refreshes_expiry() {
        let cache = cache(Some(Duration::from_secs(10)));
        cache.insert("k".to_string(), "old".to_string());
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert("k".to_string(), "new".to_string());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k").as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_counts_only_expired_entries() {
        let cache = cache(Some(Duration::from_secs(5)));
        cache.insert("a".to_string(), "1".to_string());
        cache.insert("b".to_string(), "2".to_string());
        cache.set("c".into(), "3".into(), Expiration::Never);
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.cleanup(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_and_flush() {
        let cache = cache(None);
        cache.insert("a".to_string(), "1".to_string());
        cache.insert("b".to_string(), "2".to_string());

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.flush();
        assert!(cache.is_empty());
    }

    #[test]
    fn version_store_reads_through_borrowed_keys() {
        let cache: TtlCache<String, Vec<String>> = TtlCache::new(None);
        VersionStore::set(
            &cache,
            "acme-infra-network".to_string(),
            vec!["1.0.0".to_string()],
            Expiration::Default,
        );
        assert_eq!(
            VersionStore::get(&cache, "acme-infra-network"),
            Some(vec!["1.0.0".to_string()])
        );
        assert_eq!(VersionStore::get(&cache, "acme-infra-other"), None);
    }
}
