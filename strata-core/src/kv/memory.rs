//! In-process key-value store
//!
//! Used when no Redis URL is configured and throughout the test suites. Expiry runs on
//! tokio's clock so paused-time tests can step past a TTL.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{glob_matcher, KvEntry, KvError, KvStore};

struct Stored {
    value: String,
    expires_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Stored>,
    /// Insertion order; scan cursors walk this index so deletes mid-scan never skip keys.
    order: BTreeMap<u64, String>,
    /// Expiry order, keyed by `(expires_at, seq)`.
    expiries: BTreeMap<(Instant, u64), String>,
    next_seq: u64,
}

impl Inner {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(stored) => {
                self.order.remove(&stored.seq);
                self.expiries.remove(&(stored.expires_at, stored.seq));
                true
            }
            None => false,
        }
    }

    /// Drop every entry whose expiry has passed.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        while let Some((&(expires_at, _), _)) = self.expiries.first_key_value() {
            if expires_at > now {
                break;
            }
            if let Some((_, key)) = self.expiries.pop_first() {
                self.remove(&key);
                purged += 1;
            }
        }
        purged
    }

    fn is_live(&self, key: &str, now: Instant) -> bool {
        self.entries
            .get(key)
            .map(|s| s.expires_at > now)
            .unwrap_or(false)
    }

    fn insert(&mut self, key: &str, value: String, ttl: Duration) {
        let now = Instant::now();
        self.purge_expired(now);

        let expires_at = now + ttl;
        if let Some(existing) = self.entries.get_mut(key) {
            let previous = (existing.expires_at, existing.seq);
            existing.value = value;
            existing.expires_at = expires_at;
            let seq = existing.seq;
            self.expiries.remove(&previous);
            self.expiries.insert((expires_at, seq), key.to_string());
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.order.insert(seq, key.to_string());
        self.expiries.insert((expires_at, seq), key.to_string());
        self.entries.insert(
            key.to_string(),
            Stored {
                value,
                expires_at,
                seq,
            },
        );
    }
}

/// Thread-safe in-memory [`KvStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, KvError> {
        self.inner
            .lock()
            .map_err(|_| KvError::Backend("memory store lock poisoned".to_string()))
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .map(|inner| inner.entries.values().filter(|s| s.expires_at > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, if it is live.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.inner.lock().ok()?;
        inner
            .entries
            .get(key)
            .filter(|s| s.expires_at > now)
            .map(|s| s.expires_at - now)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        if !inner.is_live(key, now) {
            inner.remove(key);
            return Ok(None);
        }
        Ok(inner.entries.get(key).map(|s| s.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError> {
        self.lock()?.insert(key, value, ttl);
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        let mut removed = 0;
        for key in keys {
            let live = inner.is_live(key, now);
            if inner.remove(key) && live {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), KvError> {
        let matcher = glob_matcher(pattern)?;
        let now = Instant::now();
        let mut inner = self.lock()?;
        inner.purge_expired(now);

        let page: Vec<(u64, &String)> = inner
            .order
            .range(cursor..)
            .take(count.max(1))
            .map(|(seq, key)| (*seq, key))
            .collect();

        let keys = page
            .iter()
            .filter(|(_, key)| inner.is_live(key, now) && matcher.is_match(key))
            .map(|(_, key)| (*key).clone())
            .collect();

        let next = match page.last() {
            Some((seq, _)) if inner.order.range(seq + 1..).next().is_some() => seq + 1,
            _ => 0,
        };
        Ok((next, keys))
    }

    async fn set_many_ex(&self, entries: Vec<KvEntry>) -> Result<(), KvError> {
        let mut inner = self.lock()?;
        for entry in entries {
            inner.insert(&entry.key, entry.value, entry.ttl);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), KvError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scan_all(store: &MemoryStore, pattern: &str, count: usize) -> Vec<String> {
        let mut cursor = 0;
        let mut found = Vec::new();
        loop {
            let (next, keys) = store.scan(cursor, pattern, count).await.unwrap();
            found.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort();
        found
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_ex("k", "v".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn scan_pages_through_matches() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .set_ex(&format!("a:{i}"), "x".into(), Duration::from_secs(60))
                .await
                .unwrap();
            store
                .set_ex(&format!("b:{i}"), "x".into(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let found = scan_all(&store, "a:*", 7).await;
        assert_eq!(found.len(), 25);
        assert!(found.iter().all(|k| k.starts_with("a:")));
    }

    #[tokio::test]
    async fn deleting_during_scan_does_not_skip_keys() {
        let store = MemoryStore::new();
        for i in 0..30 {
            store
                .set_ex(&format!("ns:{i}"), "x".into(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let mut cursor = 0;
        let mut deleted = 0;
        loop {
            let (next, keys) = store.scan(cursor, "ns:*", 4).await.unwrap();
            deleted += store.del(&keys).await.unwrap();
            if next == 0 {
                break;
            }
            cursor = next;
        }

        assert_eq!(deleted, 30);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn overwrite_keeps_single_entry() {
        let store = MemoryStore::new();
        store
            .set_many_ex(vec![
                KvEntry::new("k", "1", Duration::from_secs(60)),
                KvEntry::new("k", "2", Duration::from_secs(60)),
            ])
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
        assert_eq!(scan_all(&store, "*", 10).await, vec!["k".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_are_reclaimed_without_reads() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            store
                .set_ex(&format!("perf:metrics:{i}"), "x".into(), Duration::from_secs(1))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        for i in 0..10 {
            store
                .set_ex(&format!("fresh:{i}"), "x".into(), Duration::from_secs(60))
                .await
                .unwrap();
        }

        let inner = store.inner.lock().unwrap();
        assert_eq!(inner.entries.len(), 10);
        assert_eq!(inner.order.len(), 10);
        assert_eq!(inner.expiries.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_moves_expiry_and_scan_reclaims() {
        let store = MemoryStore::new();
        store.set_ex("short", "x".into(), Duration::from_secs(1)).await.unwrap();
        store.set_ex("kept", "1".into(), Duration::from_secs(1)).await.unwrap();
        store.set_ex("kept", "2".into(), Duration::from_secs(30)).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(scan_all(&store, "*", 10).await, vec!["kept".to_string()]);
        assert_eq!(store.inner.lock().unwrap().entries.len(), 1);
        assert_eq!(store.get("kept").await.unwrap().as_deref(), Some("2"));
    }
}
