//! Session id → hub, with per-entry expiry refreshed on access.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex as SyncMutex, PoisonError, Weak},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::future::join_all,
    mcphub_common::Dispose,
    tokio::{
        sync::Mutex,
        task::JoinHandle,
        time::{Instant, MissedTickBehavior},
    },
    tracing::{debug, info},
};

use crate::hub::HubService;

pub type HubCache = SessionCache<HubService>;

struct Entry<V> {
    value: Arc<V>,
    expires_at: Instant,
}

/// Evicted values are disposed before the cache lets go of them, so a
/// session never sees a half-torn-down value.
pub struct SessionCache<V: Dispose + 'static> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    ttl: Duration,
    sweeper: SyncMutex<Option<JoinHandle<()>>>,
}

impl<V: Dispose + 'static> SessionCache<V> {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            sweeper: SyncMutex::new(None),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Purge expired entries every `every` until the cache is dropped or
    /// shut down.
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) {
        let cache: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "swept expired sessions");
                }
            }
        });
        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<V>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let entry = entries.get_mut(key)?;
        if entry.expires_at <= now {
            entry.value.dispose().await;
            entries.remove(key);
            debug!(session = key, "session expired");
            return None;
        }
        entry.expires_at = now + self.ttl;
        Some(Arc::clone(&entry.value))
    }

    /// Return the live value for `key` or build one. Concurrent callers for
    /// the same key share a single build.
    pub async fn get_or_create<F, Fut, E>(&self, key: &str, build: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<V>, E>>,
    {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some(entry) = entries.get_mut(key) {
            if entry.expires_at > now {
                entry.expires_at = now + self.ttl;
                return Ok(Arc::clone(&entry.value));
            }
            entry.value.dispose().await;
            entries.remove(key);
            debug!(session = key, "session expired");
        }

        let value = build().await?;
        entries.insert(key.to_string(), Entry {
            value: Arc::clone(&value),
            expires_at: Instant::now() + self.ttl,
        });
        debug!(session = key, cached = entries.len(), "session cached");
        Ok(value)
    }

    /// Dispose and forget `key`. Returns whether it was cached.
    pub async fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(key) else {
            return false;
        };
        entry.value.dispose().await;
        entries.remove(key);
        info!(session = key, "session evicted");
        true
    }

    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        join_all(
            expired
                .iter()
                .filter_map(|key| entries.get(key))
                .map(|entry| entry.value.dispose()),
        )
        .await;
        for key in &expired {
            entries.remove(key);
            info!(session = %key, "session expired");
        }
        expired.len()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop sweeping and dispose everything.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
        let mut entries = self.entries.lock().await;
        join_all(entries.values().map(|entry| entry.value.dispose())).await;
        let count = entries.len();
        entries.clear();
        info!(sessions = count, "session cache shut down");
    }
}

impl<V: Dispose + 'static> Drop for SessionCache<V> {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
    }
}

#[async_trait]
impl<V: Dispose + 'static> Dispose for SessionCache<V> {
    fn owner_name(&self) -> &str {
        "session cache"
    }

    async fn dispose(&self) {
        self.shutdown().await;
    }
}
