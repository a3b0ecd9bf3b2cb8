//! Per-session lock table: a bounded, idle-evicting map from session id to
//! an async mutex, with a `run_exclusive` idiom that always releases.
//!
//! Grounded on the cache layer's `DistributedMutex`: a `DashMap` of lock
//! state keyed by resource, generalized here from the teacher's
//! lease/fencing-token model down to the spec's simpler bounded-LRU
//! in-process mutex map (fencing tokens belong to the outbox/durable-tier
//! write path, not the lock itself).

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::StoreResult;
use crate::model::SessionId;

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    last_used: Instant,
}

/// Bounded map of per-session mutexes. Capacity is enforced with an LRU
/// policy; entries idle past `idle_ttl` are eligible for eviction on the
/// next access, but a mutex currently held by [`LockTable::run_exclusive`]
/// is never evicted: `make_room` refuses to let `lru::LruCache`'s own
/// capacity eviction pick an in-use slot, growing past `capacity` instead
/// when every slot is held, and `evict_idle` shrinks back down once that
/// pressure clears.
pub struct LockTable {
    slots: SyncMutex<LruCache<SessionId, Slot>>,
    idle_ttl: Duration,
    capacity: usize,
}

impl LockTable {
    /// Build a table bounded to `capacity` live entries.
    pub fn new(capacity: usize, idle_ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: SyncMutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
            idle_ttl,
            capacity,
        }
    }

    /// Lazily create (or fetch) the mutex for `id`, bumping its LRU
    /// recency and evicting idle entries that have outlived `idle_ttl`.
    fn get_or_create(&self, id: &SessionId) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock();
        self.evict_idle(&mut slots);

        if let Some(slot) = slots.get_mut(id) {
            slot.last_used = Instant::now();
            return slot.mutex.clone();
        }

        self.make_room(&mut slots);

        let mutex = Arc::new(AsyncMutex::new(()));
        slots.put(
            id.clone(),
            Slot {
                mutex: mutex.clone(),
                last_used: Instant::now(),
            },
        );
        mutex
    }

    /// Ensure there is room for one more slot without letting
    /// `LruCache::put`'s own capacity eviction evict a mutex that is
    /// still held by an in-flight `run_exclusive` call. Walks entries
    /// from least- to most-recently-used, evicting the first one whose
    /// `Arc` has no other owner; entries walked past are reinserted in
    /// their original relative order. If every slot is currently held,
    /// grows the cache by one instead of evicting a held mutex —
    /// `evict_idle` shrinks it back toward `capacity` once that slot
    /// goes idle.
    fn make_room(&self, slots: &mut LruCache<SessionId, Slot>) {
        if slots.len() < slots.cap().get() {
            return;
        }
        let mut held = Vec::new();
        let mut freed = false;
        while !freed {
            match slots.pop_lru() {
                Some((id, slot)) => {
                    if Arc::strong_count(&slot.mutex) == 1 {
                        freed = true;
                    } else {
                        held.push((id, slot));
                    }
                }
                None => break,
            }
        }
        if !freed {
            let grown = NonZeroUsize::new(slots.cap().get() + 1).unwrap();
            slots.resize(grown);
        }
        for (id, slot) in held.into_iter().rev() {
            slots.put(id, slot);
        }
    }

    fn evict_idle(&self, slots: &mut LruCache<SessionId, Slot>) {
        let idle_ttl = self.idle_ttl;
        let stale: Vec<SessionId> = slots
            .iter()
            .filter(|(_, slot)| {
                slot.last_used.elapsed() > idle_ttl && Arc::strong_count(&slot.mutex) == 1
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            slots.pop(&id);
        }

        // Undo a temporary grow from `make_room` once there's idle room.
        if slots.cap().get() > self.capacity && slots.len() <= self.capacity {
            slots.resize(NonZeroUsize::new(self.capacity).unwrap());
        }
    }

    /// Run `body` while holding the exclusive lock for `id`, guaranteeing
    /// release on every exit path including an early error return.
    pub async fn run_exclusive<F, Fut, T>(&self, id: &SessionId, body: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mutex = self.get_or_create(id);
        let _guard = mutex.lock().await;
        body().await
    }

    /// Number of live (non-evicted) entries. Exposed for tests and health
    /// introspection, not part of the public storage contract.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether the table currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
