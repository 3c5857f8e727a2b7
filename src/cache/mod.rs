pub mod sketch;

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::dns::{Message, Name, RecordType};
use crate::error::Result;

use self::sketch::FrequencySketch;

/// Injected at `start()` time to resolve a fresh answer for a stale key, per
/// the "pipeline→cache→pipeline back-reference" design note: a narrow
/// capability interface rather than a dependency on the whole pipeline type.
#[async_trait]
pub trait QueryResolver: Send + Sync {
    async fn resolve(&self, name: &Name, qtype: RecordType) -> Result<Message>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub domain: String,
    pub qtype: RecordType,
    hash: u64,
}

impl CacheKey {
    pub fn new(domain: &str, qtype: RecordType) -> CacheKey {
        let lowered = domain.to_lowercase();
        let hash = Self::compute_hash(&lowered, qtype);
        CacheKey {
            domain: lowered,
            qtype,
            hash,
        }
    }

    pub fn from_name(name: &Name, qtype: RecordType) -> CacheKey {
        Self::new(&name.to_lowercase_fqdn(), qtype)
    }

    fn compute_hash(domain: &str, qtype: RecordType) -> u64 {
        let mut hasher = rustc_hash_fallback_hasher();
        domain.hash(&mut hasher);
        qtype.to_u16().hash(&mut hasher);
        hasher.finish()
    }
}

fn rustc_hash_fallback_hasher() -> std::collections::hash_map::DefaultHasher {
    std::collections::hash_map::DefaultHasher::new()
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.qtype)
    }
}

#[derive(Debug, Clone)]
pub struct CacheValue {
    pub message: Message,
    refresh_deadline: Instant,
    retention_deadline: Instant,
}

impl CacheValue {
    pub fn is_stale(&self) -> bool {
        Instant::now() >= self.refresh_deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.retention_deadline
    }
}

struct RefreshRequest {
    name: Name,
    qtype: RecordType,
}

pub struct Cache {
    store: DashMap<CacheKey, CacheValue>,
    sketch: FrequencySketch,
    max_cost: u64,
    ttl: Duration,
    refresh_ttl: Duration,
    refresh_tx: parking_lot::Mutex<Option<mpsc::Sender<RefreshRequest>>>,
    refresh_rx: parking_lot::Mutex<Option<mpsc::Receiver<RefreshRequest>>>,
    worker_threads: usize,
    resolver: parking_lot::Mutex<Option<Arc<dyn QueryResolver>>>,
    worker_handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Cache {
    pub fn new(config: &CacheConfig) -> Arc<Cache> {
        let (tx, rx) = mpsc::channel(config.buffer_items.max(1) as usize);
        Arc::new(Cache {
            store: DashMap::new(),
            sketch: FrequencySketch::new(config.max_counters),
            max_cost: config.max_cost,
            ttl: Duration::from_secs(config.ttl_secs),
            refresh_ttl: Duration::from_secs(config.refresh_ttl_secs),
            refresh_tx: parking_lot::Mutex::new(Some(tx)),
            refresh_rx: parking_lot::Mutex::new(Some(rx)),
            worker_threads: config.threads,
            resolver: parking_lot::Mutex::new(None),
            worker_handles: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Late-bound resolver injection; must be called before `start()`.
    pub fn set_query(&self, resolver: Arc<dyn QueryResolver>) {
        *self.resolver.lock() = Some(resolver);
    }

    /// Lock-free read; returns even when stale.
    pub fn get(&self, name: &Name, qtype: RecordType) -> Option<CacheValue> {
        let key = CacheKey::from_name(name, qtype);
        self.store.get(&key).map(|v| v.clone())
    }

    /// As `get`, but enqueues a non-blocking refresh when the hit is stale.
    pub fn get_and_update(&self, name: &Name, qtype: RecordType) -> Option<CacheValue> {
        let key = CacheKey::from_name(name, qtype);
        let entry = self.store.get(&key)?.clone();
        self.sketch.increment(key.hash);

        if entry.is_stale() {
            let tx = self.refresh_tx.lock().clone();
            if let Some(tx) = tx {
                match tx.try_send(RefreshRequest {
                    name: name.clone(),
                    qtype,
                }) {
                    Ok(()) => trace!(key = %key, "refresh enqueued for stale entry"),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(key = %key, "refresh queue full, dropping refresh request")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        Some(entry)
    }

    /// Stores `message` with refresh-deadline = now + refresh_ttl and
    /// retention-deadline = now + ttl. Applies sampled-LFU admission when the
    /// cost budget is exhausted and this is a new key.
    pub fn set(&self, name: &Name, qtype: RecordType, message: Message) {
        let key = CacheKey::from_name(name, qtype);
        let now = Instant::now();
        let value = CacheValue {
            message,
            refresh_deadline: now + self.refresh_ttl,
            retention_deadline: now + self.ttl,
        };

        if self.store.contains_key(&key) || (self.store.len() as u64) < self.max_cost {
            self.store.insert(key, value);
            return;
        }

        // At budget: admit only if the new key is estimated at least as hot
        // as a sampled victim, evicting the victim to make room.
        if let Some(victim) = self.store.iter().next().map(|e| e.key().clone()) {
            if self.sketch.admit(key.hash, victim.hash) {
                self.store.remove(&victim);
                self.store.insert(key, value);
            } else {
                trace!(key = %key, "rejected by cache admission policy");
            }
        } else {
            self.store.insert(key, value);
        }
    }

    pub fn del(&self, name: &Name, qtype: RecordType) {
        let key = CacheKey::from_name(name, qtype);
        self.store.remove(&key);
    }

    /// Spawns the refresh worker pool. Must be called after `set_query`.
    pub fn start(self: &Arc<Self>) {
        let rx = self
            .refresh_rx
            .lock()
            .take()
            .expect("cache started more than once");
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = self.worker_handles.lock();
        for worker_id in 0..self.worker_threads {
            let cache = self.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                cache.refresh_worker_loop(worker_id, rx).await;
            }));
        }
    }

    async fn refresh_worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RefreshRequest>>>,
    ) {
        loop {
            let req = {
                let mut guard = rx.lock().await;
                guard.recv().await
            };
            let Some(req) = req else { break };

            let resolver = self.resolver.lock().clone();
            let Some(resolver) = resolver else {
                warn!(worker_id, "refresh worker has no resolver wired, dropping request");
                continue;
            };

            match resolver.resolve(&req.name, req.qtype).await {
                Ok(message) => {
                    self.set(&req.name, req.qtype, message);
                }
                Err(e) => {
                    warn!(
                        worker_id,
                        name = %req.name,
                        qtype = %req.qtype,
                        error = %e,
                        "refresh failed; entry remains stale"
                    );
                }
            }
        }
        debug!(worker_id, "cache refresh worker exiting");
    }

    /// Closes the refresh channel, letting every worker drain its queue and
    /// exit on its own, then joins them, then drops the store.
    pub async fn close(&self) {
        self.refresh_tx.lock().take();

        let handles: Vec<_> = self.worker_handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "cache refresh worker panicked during close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(max_cost: u64, ttl_secs: u64, refresh_ttl_secs: u64) -> CacheConfig {
        CacheConfig {
            max_counters: 10_000,
            max_cost,
            buffer_items: 16,
            ttl_secs,
            refresh_ttl_secs,
            threads: 1,
        }
    }

    fn sample_message() -> Message {
        Message::new_query(1, &Name::parse("example.com."), RecordType::A)
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = Cache::new(&small_config(10, 60, 30));
        let name = Name::parse("example.com.");
        cache.set(&name, RecordType::A, sample_message());
        let entry = cache.get(&name, RecordType::A).unwrap();
        assert_eq!(entry.message, sample_message());
        assert!(!entry.is_stale());
        assert!(!entry.is_expired());
    }

    #[test]
    fn miss_returns_none() {
        let cache = Cache::new(&small_config(10, 60, 30));
        assert!(cache.get(&Name::parse("absent.test."), RecordType::A).is_none());
    }

    #[test]
    fn del_removes_entry() {
        let cache = Cache::new(&small_config(10, 60, 30));
        let name = Name::parse("example.com.");
        cache.set(&name, RecordType::A, sample_message());
        cache.del(&name, RecordType::A);
        assert!(cache.get(&name, RecordType::A).is_none());
    }

    #[test]
    fn stale_entry_is_flagged_once_past_refresh_ttl() {
        let cache = Cache::new(&small_config(10, 60, 0));
        let name = Name::parse("example.com.");
        cache.set(&name, RecordType::A, sample_message());
        std::thread::sleep(Duration::from_millis(5));
        let entry = cache.get(&name, RecordType::A).unwrap();
        assert!(entry.is_stale());
        assert!(!entry.is_expired());
    }

    #[test]
    fn get_and_update_enqueues_refresh_for_stale_entries_only() {
        let cache = Cache::new(&small_config(10, 60, 0));
        let name = Name::parse("example.com.");
        cache.set(&name, RecordType::A, sample_message());
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get_and_update(&name, RecordType::A).is_some());
        let mut rx = cache.refresh_rx.lock().take().unwrap();
        let req = rx.try_recv().expect("a refresh request should be queued");
        assert_eq!(req.name, name);
    }

    #[test]
    fn set_at_budget_inserts_existing_key_without_eviction() {
        let cache = Cache::new(&small_config(1, 60, 30));
        let name = Name::parse("example.com.");
        cache.set(&name, RecordType::A, sample_message());
        // Re-setting the same key must not require eviction capacity.
        cache.set(&name, RecordType::A, sample_message());
        assert!(cache.get(&name, RecordType::A).is_some());
    }
}
