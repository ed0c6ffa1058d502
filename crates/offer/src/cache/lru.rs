//! Weighted LRU cache with reservations, pinning and background eviction.
//!
//! Admission is two-phase: `reserve` accounts the capacity up front, then
//! the entry is either confirmed (file fully written and moved in) or the
//! reservation cancelled. Reserved entries are never evicted; neither are
//! pinned entries nor entries the eviction judge refuses.
//!
//! Crossing the eviction threshold starts a single background sweep which
//! evicts least-recently-used evictable entries until usage drops below the
//! safe threshold. The sweep is observable: [`WeightedLruCache::eviction_running`]
//! and [`WeightedLruCache::wait_for_eviction`] replace busy-polling.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::{OfferError, OfferResult};

/// Decides whether an entry may be evicted (on top of the pin check).
pub type EvictionJudge<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// Invoked for each evicted entry (deletes the backing file).
pub type EvictionListener<K> = Arc<dyn Fn(&K) + Send + Sync>;

struct EntryMeta {
    weight: u64,
    queue_key: (i128, u64),
    pins: u32,
}

struct Inner<K> {
    /// LRU order: (last access stamp, tiebreak) -> key.
    queue: BTreeMap<(i128, u64), K>,
    entries: HashMap<K, EntryMeta>,
    reserved: HashMap<K, u64>,
    usage: u64,
    seq: u64,
    sweeping: bool,
}

/// Capacity-bounded LRU cache of weighted entries.
pub struct WeightedLruCache<K> {
    max_capacity: u64,
    eviction_threshold: u64,
    safe_threshold: u64,
    inner: Arc<Mutex<Inner<K>>>,
    sweep_done: Arc<Notify>,
    judge: EvictionJudge<K>,
    listener: EvictionListener<K>,
}

impl<K> WeightedLruCache<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Thresholds must be strictly ordered: `safe < eviction < max`.
    pub fn new(
        max_capacity: u64,
        eviction_threshold: u64,
        safe_threshold: u64,
        judge: EvictionJudge<K>,
        listener: EvictionListener<K>,
        initial_entries: Vec<(K, u64, i128)>,
    ) -> OfferResult<Self> {
        if safe_threshold == 0 || safe_threshold >= eviction_threshold || eviction_threshold >= max_capacity
        {
            return Err(OfferError::BadRequest(format!(
                "invalid cache thresholds: safe={safe_threshold}, eviction={eviction_threshold}, max={max_capacity}"
            )));
        }

        let mut inner = Inner {
            queue: BTreeMap::new(),
            entries: HashMap::new(),
            reserved: HashMap::new(),
            usage: 0,
            seq: 0,
            sweeping: false,
        };

        for (key, weight, stamp) in initial_entries {
            if inner.entries.contains_key(&key) {
                return Err(OfferError::BadRequest(format!("duplicate cache entry {key:?}")));
            }
            let queue_key = (stamp, inner.seq);
            inner.seq += 1;
            inner.queue.insert(queue_key, key.clone());
            inner.usage += weight;
            inner.entries.insert(
                key,
                EntryMeta {
                    weight,
                    queue_key,
                    pins: 0,
                },
            );
        }

        let cache = Self {
            max_capacity,
            eviction_threshold,
            safe_threshold,
            inner: Arc::new(Mutex::new(inner)),
            sweep_done: Arc::new(Notify::new()),
            judge,
            listener,
        };
        cache.start_sweep_if_needed();
        Ok(cache)
    }

    /// Reserve capacity for an entry about to be written.
    pub fn reserve(&self, key: K, weight: u64) -> OfferResult<()> {
        {
            let mut inner = self.lock();
            if inner.entries.contains_key(&key) || inner.reserved.contains_key(&key) {
                return Err(OfferError::AlreadyExists(format!("cache entry {key:?}")));
            }
            if inner.usage + weight >= self.max_capacity {
                let message = format!(
                    "cannot reserve {weight} bytes for {key:?}: usage {} of max {}",
                    inner.usage, self.max_capacity
                );
                warn!("{message}");
                return Err(OfferError::CapacityExceeded(message));
            }
            inner.usage += weight;
            inner.reserved.insert(key, weight);
        }
        self.start_sweep_if_needed();
        Ok(())
    }

    /// Confirm a reservation, adding the entry to the LRU queue.
    pub fn confirm(&self, key: &K, stamp: i128) -> OfferResult<()> {
        let mut inner = self.lock();
        let weight = inner.reserved.remove(key).ok_or_else(|| {
            OfferError::BadRequest(format!("no active reservation for {key:?}"))
        })?;
        let queue_key = (stamp, inner.seq);
        inner.seq += 1;
        inner.queue.insert(queue_key, key.clone());
        inner.entries.insert(
            key.clone(),
            EntryMeta {
                weight,
                queue_key,
                pins: 0,
            },
        );
        Ok(())
    }

    /// Cancel a reservation, releasing its capacity.
    pub fn cancel(&self, key: &K) -> OfferResult<()> {
        let mut inner = self.lock();
        let weight = inner.reserved.remove(key).ok_or_else(|| {
            OfferError::BadRequest(format!("no active reservation for {key:?}"))
        })?;
        inner.usage -= weight;
        Ok(())
    }

    /// Refresh an entry's position in the LRU order. Unknown entries are
    /// ignored (concurrent eviction).
    pub fn touch(&self, key: &K, stamp: i128) -> bool {
        let mut inner = self.lock();
        let Some(meta) = inner.entries.get(key) else {
            return false;
        };
        let old_key = meta.queue_key;
        let new_key = (stamp, inner.seq);
        inner.seq += 1;
        inner.queue.remove(&old_key);
        inner.queue.insert(new_key, key.clone());
        if let Some(meta) = inner.entries.get_mut(key) {
            meta.queue_key = new_key;
        }
        true
    }

    /// Whether a confirmed entry exists (reservations do not count).
    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Whether a reservation exists for the key.
    pub fn is_reserved(&self, key: &K) -> bool {
        self.lock().reserved.contains_key(key)
    }

    /// Increment an entry's pin count. Returns `false` if the entry is not
    /// (or no longer) cached.
    pub fn pin(&self, key: &K) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(key) {
            Some(meta) => {
                meta.pins += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement an entry's pin count (saturating).
    pub fn unpin(&self, key: &K) {
        let mut inner = self.lock();
        if let Some(meta) = inner.entries.get_mut(key) {
            meta.pins = meta.pins.saturating_sub(1);
        }
    }

    pub fn pin_count(&self, key: &K) -> u32 {
        self.lock().entries.get(key).map(|m| m.pins).unwrap_or(0)
    }

    /// Current usage: confirmed plus reserved bytes.
    pub fn usage(&self) -> u64 {
        self.lock().usage
    }

    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    /// Whether a background eviction sweep is currently running.
    pub fn eviction_running(&self) -> bool {
        self.lock().sweeping
    }

    /// Resolve once the current sweep (if any) has finished.
    pub async fn wait_for_eviction(&self) {
        loop {
            let notified = self.sweep_done.notified();
            if !self.eviction_running() {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_sweep_if_needed(&self) {
        {
            let mut inner = self.lock();
            if inner.usage < self.eviction_threshold || inner.sweeping {
                return;
            }
            inner.sweeping = true;
            info!(
                usage = inner.usage,
                eviction_threshold = self.eviction_threshold,
                safe_threshold = self.safe_threshold,
                "cache over eviction threshold, starting sweep"
            );
        }

        let inner = Arc::clone(&self.inner);
        let sweep_done = Arc::clone(&self.sweep_done);
        let judge = Arc::clone(&self.judge);
        let listener = Arc::clone(&self.listener);
        let safe_threshold = self.safe_threshold;

        tokio::task::spawn_blocking(move || {
            Self::sweep(&inner, &judge, &listener, safe_threshold);
            sweep_done.notify_waiters();
        });
    }

    fn sweep(
        inner: &Mutex<Inner<K>>,
        judge: &EvictionJudge<K>,
        listener: &EvictionListener<K>,
        safe_threshold: u64,
    ) {
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());

        let candidates: Vec<(i128, u64)> = inner.queue.keys().copied().collect();
        let mut evicted = 0u64;
        for queue_key in candidates {
            if inner.usage < safe_threshold {
                break;
            }
            let Some(key) = inner.queue.get(&queue_key).cloned() else {
                continue;
            };
            let evictable = inner
                .entries
                .get(&key)
                .map(|meta| meta.pins == 0 && judge(&key))
                .unwrap_or(false);
            if !evictable {
                continue;
            }

            let Some(meta) = inner.entries.remove(&key) else {
                continue;
            };
            inner.queue.remove(&queue_key);
            inner.usage -= meta.weight;
            evicted += meta.weight;
            listener(&key);
        }

        if inner.usage >= safe_threshold {
            warn!(
                usage = inner.usage,
                safe_threshold, "eviction sweep could not reach safe threshold"
            );
        } else {
            info!(evicted, usage = inner.usage, "eviction sweep finished");
        }
        inner.sweeping = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(
        max: u64,
        eviction: u64,
        safe: u64,
        initial: Vec<(String, u64, i128)>,
    ) -> (WeightedLruCache<String>, Arc<Mutex<Vec<String>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cache = WeightedLruCache::new(
            max,
            eviction,
            safe,
            Arc::new(|_: &String| true),
            Arc::new(move |key: &String| sink.lock().unwrap().push(key.clone())),
            initial,
        )
        .unwrap();
        (cache, evicted)
    }

    #[tokio::test]
    async fn reserve_confirm_cancel() {
        let (cache, _) = cache(1000, 900, 500, vec![]);

        cache.reserve("a".to_string(), 100).unwrap();
        assert!(cache.is_reserved(&"a".to_string()));
        assert!(!cache.contains(&"a".to_string()));
        assert_eq!(cache.usage(), 100);

        cache.confirm(&"a".to_string(), 2).unwrap();
        assert!(cache.contains(&"a".to_string()));

        cache.reserve("b".to_string(), 50).unwrap();
        cache.cancel(&"b".to_string()).unwrap();
        assert_eq!(cache.usage(), 100);

        // Double cancel / unknown confirm are errors.
        assert!(cache.cancel(&"b".to_string()).is_err());
        assert!(cache.confirm(&"b".to_string(), 4).is_err());
    }

    #[tokio::test]
    async fn reservation_beyond_max_capacity_fails() {
        let (cache, _) = cache(1000, 900, 500, vec![]);
        cache.reserve("a".to_string(), 800).unwrap();
        let result = cache.reserve("b".to_string(), 300);
        assert!(matches!(result, Err(OfferError::CapacityExceeded(_))));
    }

    #[tokio::test]
    async fn sweep_evicts_lru_first_and_stops_at_safe_threshold() {
        let initial = vec![
            ("old".to_string(), 300, 1),
            ("mid".to_string(), 300, 2),
            ("new".to_string(), 300, 3),
        ];
        let (cache, evicted) = cache(2000, 1000, 700, initial);

        // 900 < eviction threshold: nothing running.
        assert!(!cache.eviction_running());

        cache.reserve("incoming".to_string(), 200).unwrap();
        cache.wait_for_eviction().await;

        // Evicting "old" brings usage to 800, still >= 700; "mid" brings it
        // to 500 and the sweep stops.
        assert_eq!(*evicted.lock().unwrap(), vec!["old".to_string(), "mid".to_string()]);
        assert!(cache.contains(&"new".to_string()));
        assert_eq!(cache.usage(), 500);
    }

    #[tokio::test]
    async fn pinned_entries_survive_sweeps() {
        let initial = vec![
            ("pinned".to_string(), 600, 1),
            ("loose".to_string(), 300, 2),
        ];
        let (cache, evicted) = cache(2000, 1000, 700, initial);
        assert!(cache.pin(&"pinned".to_string()));

        cache.reserve("incoming".to_string(), 200).unwrap();
        cache.wait_for_eviction().await;

        assert_eq!(*evicted.lock().unwrap(), vec!["loose".to_string()]);
        assert!(cache.contains(&"pinned".to_string()));

        // Unpinning makes it evictable on the next sweep.
        cache.unpin(&"pinned".to_string());
        cache.reserve("more".to_string(), 200).unwrap();
        cache.wait_for_eviction().await;
        assert!(!cache.contains(&"pinned".to_string()));
    }

    #[tokio::test]
    async fn touch_protects_recently_used_entries() {
        let initial = vec![
            ("a".to_string(), 400, 1),
            ("b".to_string(), 400, 2),
        ];
        let (cache, evicted) = cache(2000, 1000, 700, initial);

        // "a" becomes the most recently used.
        assert!(cache.touch(&"a".to_string(), 10));

        cache.reserve("c".to_string(), 250).unwrap();
        cache.wait_for_eviction().await;

        assert_eq!(*evicted.lock().unwrap(), vec!["b".to_string()]);
        assert!(cache.contains(&"a".to_string()));
    }
}
