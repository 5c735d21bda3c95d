//! Result cache with single-flight coalescing (component C2)
//!
//! Content-addressed by `Fingerprint`. Concurrent lookups for the same
//! fingerprint coalesce onto one producer; everyone else waits on a
//! `Notify` and re-reads the map once woken, rather than racing to produce
//! duplicate work. Failures are cached for a short negative TTL so a
//! persistently failing point does not get re-attempted on every request
//! in a hot sweep.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use crate::fingerprint::Fingerprint;

#[derive(Clone)]
enum EntryState<V> {
    Pending,
    Ready(V),
    Failed,
}

struct Entry<V> {
    state: EntryState<V>,
    inserted_at: Instant,
    last_used_at: Instant,
    notify: Arc<Notify>,
}

pub struct ResultCache<V> {
    entries: DashMap<Fingerprint, Entry<V>>,
    max_entries: usize,
    max_age: Duration,
    negative_ttl: Duration,
}

/// The outcome of a single cache lookup, reported to the caller so it can
/// record accurate cache-hit metrics on the response. `Hit` means the value
/// was already `Ready` in the map; `Produced` means this call became the
/// single-flight producer and just computed it.
pub enum Lookup<V> {
    Hit(V),
    Produced(V),
    Miss,
}

/// Lets the cache tell a cancelled in-flight production apart from a
/// genuine compute failure. A cancelled production is never negatively
/// cached — it would otherwise poison the entry for every other caller
/// sharing the fingerprint, not just the cancelled one.
pub trait CacheError {
    fn is_cancellation(&self) -> bool {
        false
    }
}

impl CacheError for anyhow::Error {}
impl<'a> CacheError for &'a str {}

impl<V: Clone + Send + Sync + 'static> ResultCache<V> {
    pub fn new(max_entries: usize, max_age_secs: u64, negative_ttl_secs: u64) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            max_age: Duration::from_secs(max_age_secs),
            negative_ttl: Duration::from_secs(negative_ttl_secs),
        }
    }

    fn is_live(&self, entry: &Entry<V>, now: Instant) -> bool {
        match entry.state {
            EntryState::Pending => true,
            EntryState::Ready(_) => now.duration_since(entry.inserted_at) < self.max_age,
            EntryState::Failed => now.duration_since(entry.inserted_at) < self.negative_ttl,
        }
    }

    /// Look up a fingerprint, coalescing concurrent producers for a miss
    /// onto a single call to `produce`. Returns `Lookup::Hit(value)` for a
    /// pre-existing `Ready` entry, `Lookup::Produced(value)` when this call
    /// became the producer, and `Lookup::Miss` when a still-live `Failed`
    /// entry is observed (the original error is not retained; the caller
    /// should treat this as its own failure case). A producer's own
    /// failure surfaces through this function's `Err`, not `Lookup::Miss`.
    ///
    /// A producer result for which `is_cancellation()` is true is never
    /// turned into a `Failed` entry: the slot is removed instead, so any
    /// waiter — and a subsequent retry of the cancelled caller itself —
    /// re-enters production from scratch rather than inheriting a
    /// negatively-cached failure that was never a real compute error.
    pub async fn lookup_or_insert<F, Fut, E>(
        &self,
        fingerprint: Fingerprint,
        produce: F,
    ) -> Result<Lookup<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
        E: CacheError,
    {
        loop {
            let now = Instant::now();
            let mut become_producer = false;
            let notify = {
                match self.entries.get_mut(&fingerprint) {
                    Some(mut entry) if self.is_live(&entry, now) => match &entry.state {
                        EntryState::Ready(value) => {
                            let value = value.clone();
                            entry.last_used_at = now;
                            return Ok(Lookup::Hit(value));
                        }
                        EntryState::Failed => return Ok(Lookup::Miss),
                        EntryState::Pending => Some(entry.notify.clone()),
                    },
                    _ => {
                        // No live entry: claim the slot as Pending and become
                        // the producer. Insert happens below, outside this
                        // match, to avoid holding the shard lock across the
                        // insert call on a fresh key.
                        become_producer = true;
                        None
                    }
                }
            };

            if become_producer {
                self.evict_if_needed();
                let notify = Arc::new(Notify::new());
                self.entries.insert(
                    fingerprint.clone(),
                    Entry {
                        state: EntryState::Pending,
                        inserted_at: now,
                        last_used_at: now,
                        notify: notify.clone(),
                    },
                );

                let result = produce().await;
                match &result {
                    Ok(value) => {
                        if let Some(mut entry) = self.entries.get_mut(&fingerprint) {
                            entry.state = EntryState::Ready(value.clone());
                            entry.inserted_at = Instant::now();
                        }
                    }
                    Err(err) if err.is_cancellation() => {
                        self.entries.remove(&fingerprint);
                    }
                    Err(_) => {
                        if let Some(mut entry) = self.entries.get_mut(&fingerprint) {
                            entry.state = EntryState::Failed;
                            entry.inserted_at = Instant::now();
                        }
                    }
                }
                notify.notify_waiters();
                return result.map(Lookup::Produced);
            }

            if let Some(notify) = notify {
                notify.notified().await;
                // Loop around and re-read the map; whatever state the
                // producer left behind is picked up freshly, never an
                // interleaved view.
                continue;
            }
        }
    }

    /// Evict the least-recently-used `Ready`/`Failed` entry if the map is
    /// at capacity. `Pending` entries are never evicted — a waiter must
    /// always be able to observe the outcome it is waiting on.
    fn evict_if_needed(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let victim = self
            .entries
            .iter()
            .filter(|e| !matches!(e.value().state, EntryState::Pending))
            .min_by_key(|e| e.value().last_used_at)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
