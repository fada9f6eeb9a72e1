//! Connection registry: cached pool handles keyed by connection identifier.
//!
//! Every identifier maps to a slot with two locks: a state lock that is only
//! ever held for bookkeeping, and a creation gate held across `create()`.
//! The map itself is locked only long enough to find or insert a slot, so a
//! slow pool creation for one identifier never blocks callers using another,
//! and never blocks reads of any identifier.
//!
//! ```text
//! get_or_create("conn1", create)
//!   → map lock: find or insert slot for "conn1"      (short)
//!   → state lock: Ready   → touch, return handle     (short)
//!                 Retired → slot was evicted, look it up again
//!                 Vacant  → take the creation gate, re-check state,
//!                           run create() holding only the gate
//! ```
//!
//! Concurrent creators of the same identifier queue on the gate and find
//! the slot `Ready` once the first one finishes. Eviction takes the gate
//! before the state lock, so eviction and creation for one identifier never
//! interleave. Lock order is gate, then state, then map.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// A cached handle and its usage bookkeeping.
#[derive(Debug)]
struct PooledEntry<H> {
    handle: H,
    created_at: Instant,
    last_used: Instant,
    hits: u64,
}

impl<H: Clone> PooledEntry<H> {
    fn new(handle: H) -> Self {
        let now = Instant::now();
        Self {
            handle,
            created_at: now,
            last_used: now,
            hits: 0,
        }
    }

    /// Refresh the last-used time. Never moves backwards.
    fn touch(&mut self) {
        self.last_used = self.last_used.max(Instant::now());
        self.hits += 1;
    }

    fn snapshot(&self) -> EntrySnapshot<H> {
        EntrySnapshot {
            handle: self.handle.clone(),
            created_at: self.created_at,
            last_used: self.last_used,
            hits: self.hits,
        }
    }
}

#[derive(Debug)]
enum SlotState<H> {
    /// Inserted but no pool yet; a creation may be in flight.
    Vacant,
    Ready(PooledEntry<H>),
    /// Evicted or failed. Already unlinked from the map.
    Retired,
}

struct SlotInner<H> {
    state: Mutex<SlotState<H>>,
    /// Held for the whole of a creation.
    gate: Arc<Mutex<()>>,
}

type Slot<H> = Arc<SlotInner<H>>;

/// Outcome of checking a slot's state on the acquisition path.
enum Reuse<H> {
    Hit(H),
    Vacant,
    Retired,
}

/// Point-in-time view of one registry entry.
#[derive(Clone, Debug)]
pub struct EntrySnapshot<H> {
    pub handle: H,
    pub created_at: Instant,
    pub last_used: Instant,
    /// Cache hits since creation.
    pub hits: u64,
}

/// Handle-free summary of an entry, for stats and logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub id: String,
    pub idle: Duration,
    pub age: Duration,
    pub hits: u64,
}

/// An entry removed from the registry whose handle still needs closing.
#[derive(Debug)]
pub struct Evicted<H> {
    pub id: String,
    pub handle: H,
    pub idle: Duration,
}

/// Concurrency-safe map from connection identifier to pooled handle.
///
/// The registry owns every handle it stores. Callers receive clones and
/// must not close them; closing happens after [`evict`](Self::evict),
/// [`evict_idle`](Self::evict_idle) or [`drain`](Self::drain).
pub struct ConnectionRegistry<H> {
    slots: Mutex<HashMap<String, Slot<H>>>,
}

impl<H: Clone> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, id: &str) -> Option<Slot<H>> {
        self.slots.lock().await.get(id).cloned()
    }

    async fn slot_or_insert(&self, id: &str) -> Slot<H> {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(id.to_string()).or_insert_with(|| {
            Arc::new(SlotInner {
                state: Mutex::new(SlotState::Vacant),
                gate: Arc::new(Mutex::new(())),
            })
        });
        Arc::clone(slot)
    }

    /// Remove `slot` from the map if it is still the one registered for `id`.
    async fn unlink(&self, id: &str, slot: &Slot<H>) {
        let mut slots = self.slots.lock().await;
        if slots.get(id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(id);
        }
    }

    async fn all_slots(&self) -> Vec<(String, Slot<H>)> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Touch and clone a `Ready` slot's handle.
    async fn reuse(id: &str, slot: &SlotInner<H>) -> Reuse<H> {
        let mut state = slot.state.lock().await;
        match &mut *state {
            SlotState::Ready(entry) => {
                entry.touch();
                tracing::debug!(%id, hits = entry.hits, "reusing cached pool");
                Reuse::Hit(entry.handle.clone())
            }
            SlotState::Vacant => Reuse::Vacant,
            SlotState::Retired => Reuse::Retired,
        }
    }

    /// Read an entry without refreshing it. An identifier whose first pool
    /// is still being created has no entry yet.
    pub async fn lookup(&self, id: &str) -> Option<EntrySnapshot<H>> {
        let slot = self.slot(id).await?;
        let state = slot.state.lock().await;
        match &*state {
            SlotState::Ready(entry) => Some(entry.snapshot()),
            SlotState::Vacant | SlotState::Retired => None,
        }
    }

    /// Return the cached handle for `id`, or run `create` to make one.
    ///
    /// At most one `create` runs per identifier at a time. Concurrent callers
    /// wait for it and then share its handle. A hit refreshes the entry's
    /// last-used time in the same critical section as the lookup.
    ///
    /// If `create` fails nothing is cached and the error is returned;
    /// callers that were waiting retry `create` themselves. If the returned
    /// future is dropped mid-creation the slot stays empty and the next
    /// caller creates.
    ///
    /// An empty `id` is never cached: `create` runs and its result is
    /// returned as is.
    pub async fn get_or_create<F, Fut, E>(&self, id: &str, create: F) -> Result<H, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H, E>>,
    {
        if id.is_empty() {
            return create().await;
        }

        let (slot, _gate) = loop {
            let slot = self.slot_or_insert(id).await;
            match Self::reuse(id, &slot).await {
                Reuse::Hit(handle) => return Ok(handle),
                Reuse::Retired => continue,
                Reuse::Vacant => {}
            }
            let gate = Arc::clone(&slot.gate).lock_owned().await;
            // Whoever held the gate before us may have finished or failed.
            match Self::reuse(id, &slot).await {
                Reuse::Hit(handle) => return Ok(handle),
                Reuse::Retired => continue,
                Reuse::Vacant => break (slot, gate),
            }
        };

        let created = create().await;
        let mut state = slot.state.lock().await;
        match created {
            Ok(handle) => {
                *state = SlotState::Ready(PooledEntry::new(handle.clone()));
                Ok(handle)
            }
            Err(err) => {
                *state = SlotState::Retired;
                self.unlink(id, &slot).await;
                Err(err)
            }
        }
    }

    /// Refresh the last-used time of `id`. Returns `false` if absent.
    pub async fn touch(&self, id: &str) -> bool {
        let Some(slot) = self.slot(id).await else {
            return false;
        };
        let mut state = slot.state.lock().await;
        match &mut *state {
            SlotState::Ready(entry) => {
                entry.touch();
                true
            }
            SlotState::Vacant | SlotState::Retired => false,
        }
    }

    /// Remove `id` and hand back its handle for closing.
    ///
    /// Waits for an in-flight creation of the same identifier to finish.
    pub async fn evict(&self, id: &str) -> Option<H> {
        let slot = self.slot(id).await?;
        let _gate = slot.gate.lock().await;
        let mut state = slot.state.lock().await;
        let previous = std::mem::replace(&mut *state, SlotState::Retired);
        self.unlink(id, &slot).await;
        match previous {
            SlotState::Ready(entry) => Some(entry.handle),
            SlotState::Vacant | SlotState::Retired => None,
        }
    }

    /// Remove every entry idle for strictly longer than `threshold`.
    ///
    /// Slots with a creation in flight are skipped. Empty slots left behind
    /// by cancelled creations are cleaned up.
    pub async fn evict_idle(&self, threshold: Duration) -> Vec<Evicted<H>> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        for (id, slot) in self.all_slots().await {
            let Ok(_gate) = slot.gate.try_lock() else {
                tracing::trace!(%id, "creation in flight, skipping this sweep");
                continue;
            };
            let mut state = slot.state.lock().await;
            let idle = match &*state {
                SlotState::Ready(entry) => Some(now.saturating_duration_since(entry.last_used)),
                SlotState::Vacant => None,
                SlotState::Retired => continue,
            };
            let Some(idle) = idle else {
                *state = SlotState::Retired;
                self.unlink(&id, &slot).await;
                continue;
            };
            if idle <= threshold {
                continue;
            }
            let previous = std::mem::replace(&mut *state, SlotState::Retired);
            self.unlink(&id, &slot).await;
            if let SlotState::Ready(entry) = previous {
                evicted.push(Evicted {
                    id,
                    handle: entry.handle,
                    idle,
                });
            }
        }

        evicted
    }

    /// Remove every entry, waiting for in-flight creations to settle.
    pub async fn drain(&self) -> Vec<Evicted<H>> {
        let now = Instant::now();
        let slots = std::mem::take(&mut *self.slots.lock().await);
        let mut drained = Vec::with_capacity(slots.len());

        for (id, slot) in slots {
            let _gate = slot.gate.lock().await;
            let mut state = slot.state.lock().await;
            if let SlotState::Ready(entry) = std::mem::replace(&mut *state, SlotState::Retired) {
                drained.push(Evicted {
                    id,
                    handle: entry.handle,
                    idle: now.saturating_duration_since(entry.last_used),
                });
            }
        }

        drained
    }

    /// Whether `id` currently holds a pool.
    pub async fn contains(&self, id: &str) -> bool {
        self.lookup(id).await.is_some()
    }

    /// Number of identifiers holding a pool. Creations in flight are not
    /// counted.
    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Identifiers holding a pool, sorted.
    pub async fn ids(&self) -> Vec<String> {
        self.snapshot().await.into_iter().map(|info| info.id).collect()
    }

    /// Summaries of every entry holding a pool, sorted by identifier.
    pub async fn snapshot(&self) -> Vec<EntryInfo> {
        let now = Instant::now();
        let mut infos = Vec::new();
        for (id, slot) in self.all_slots().await {
            let state = slot.state.lock().await;
            if let SlotState::Ready(entry) = &*state {
                infos.push(EntryInfo {
                    id,
                    idle: now.saturating_duration_since(entry.last_used),
                    age: now.saturating_duration_since(entry.created_at),
                    hits: entry.hits,
                });
            }
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

impl<H: Clone> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> std::fmt::Debug for ConnectionRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry").finish_non_exhaustive()
    }
}
