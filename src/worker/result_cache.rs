use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::trace;

/// Matched node ids, shared between the cache and whoever asked for them.
pub type CachedIds = Arc<Vec<usize>>;

struct CacheState {
    entries: BTreeMap<String, CachedIds>,
    /// Sum of `entries` lengths.
    total: usize,
    rng: StdRng,
}

/// Search results keyed by opaque strings, bounded by the total number of
/// node ids held.
///
/// Eviction picks a key uniformly at random; there is no notion of recency,
/// so a hot entry is as likely to go as a cold one.
pub struct ResultCache {
    budget: usize,
    state: Mutex<CacheState>,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ResultCache")
            .field("budget", &self.budget)
            .field("entries", &state.entries.len())
            .field("total", &state.total)
            .finish()
    }
}

impl ResultCache {
    pub fn new(budget: usize) -> ResultCache {
        ResultCache::with_rng(budget, StdRng::from_os_rng())
    }

    /// Cache with a caller-provided RNG so eviction can be replayed.
    pub fn with_rng(budget: usize, rng: StdRng) -> ResultCache {
        ResultCache {
            budget,
            state: Mutex::new(CacheState {
                entries: BTreeMap::new(),
                total: 0,
                rng,
            }),
        }
    }

    // A panic while holding the lock can't leave the map half-updated in a way
    // that matters for a cache, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite `key`, then evict random entries until the total
    /// size is back within budget.  The entry just stored is a candidate like
    /// any other.
    pub fn store(&self, key: String, value: CachedIds) {
        let mut guard = self.lock();
        let state = &mut *guard;

        state.total += value.len();
        if let Some(old) = state.entries.insert(key, value) {
            state.total -= old.len();
        }

        while state.total > self.budget && !state.entries.is_empty() {
            let victim_ix = state.rng.random_range(0..state.entries.len());
            let victim = match state.entries.keys().nth(victim_ix) {
                Some(key) => key.clone(),
                None => break,
            };
            if let Some(evicted) = state.entries.remove(&victim) {
                state.total -= evicted.len();
                trace!(key = victim.as_str(), size = evicted.len(), "evicted cache entry");
            }
        }
    }

    pub fn retrieve(&self, key: &str) -> Option<CachedIds> {
        self.lock().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Node ids currently held across all entries.
    pub fn total_size(&self) -> usize {
        self.lock().total
    }
}
