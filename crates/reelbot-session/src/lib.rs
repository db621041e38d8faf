//! Reelbot Session Cache
//!
//! Per-user ephemeral records with a fixed time-to-live. Each user owns
//! exactly one record, replaced as a whole on every write. Expired records
//! are never returned: reads check the deadline, and a background sweeper
//! reclaims memory periodically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Cheap to clone; clones share the same storage.
#[derive(Debug)]
pub struct SessionCache<V> {
    ttl: Duration,
    entries: Arc<Mutex<HashMap<i64, Entry<V>>>>,
}

impl<V> Clone for SessionCache<V> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<V: Clone + Send + 'static> SessionCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn get(&self, user_id: i64) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let entry = entries.get(&user_id)?;
        if entry.is_live(now) {
            return Some(entry.value.clone());
        }
        entries.remove(&user_id);
        None
    }

    pub async fn set(&self, user_id: i64, value: V) {
        self.set_with_ttl(user_id, value, self.ttl).await;
    }

    pub async fn set_with_ttl(&self, user_id: i64, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(user_id, Entry { value, expires_at });
    }

    /// Removes everything stored for `user_id`. Returns whether a live
    /// record existed.
    pub async fn clear(&self, user_id: i64) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .remove(&user_id)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Drops expired records and returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    /// Number of stored records, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = cache.sweep().await;
                if removed > 0 {
                    debug!(removed, "Swept expired sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_TTL: Duration = Duration::from_secs(120);
    const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(150);

    #[tokio::test(start_paused = true)]
    async fn value_is_unobservable_after_ttl() {
        let cache = SessionCache::new(Duration::from_secs(120));
        cache.set(1, "searching").await;
        assert_eq!(cache.get(1).await, Some("searching"));

        tokio::time::advance(Duration::from_secs(119)).await;
        assert_eq!(cache.get(1).await, Some("searching"));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(cache.get(1).await, None);
        // lazy read removed it
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_measured_from_last_write() {
        let cache = SessionCache::new(Duration::from_secs(10));
        cache.set(1, 1u32).await;
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set(1, 2u32).await;
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get(1).await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_ttl_overrides_default() {
        let cache = SessionCache::new(Duration::from_secs(120));
        cache.set_with_ttl(1, "short", Duration::from_secs(1)).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(1).await, None);
    }

    #[tokio::test]
    async fn clear_only_touches_one_user() {
        let cache = SessionCache::new(DEFAULT_TTL);
        cache.set(1, "a").await;
        cache.set(2, "b").await;
        assert!(cache.clear(1).await);
        assert!(!cache.clear(1).await);
        assert_eq!(cache.get(1).await, None);
        assert_eq!(cache.get(2).await, Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_records() {
        let cache = SessionCache::new(Duration::from_secs(10));
        cache.set(1, "old").await;
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.set(2, "new").await;
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(2).await, Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_reclaims_expired_records() {
        let cache = SessionCache::new(Duration::from_secs(120));
        let handle = cache.spawn_sweeper(DEFAULT_SWEEP_INTERVAL);
        cache.set(1, "x").await;
        assert_eq!(cache.len().await, 1);

        tokio::time::sleep(DEFAULT_SWEEP_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(cache.len().await, 0);
        handle.abort();
    }
}
