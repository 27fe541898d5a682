use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::trace;

use crate::entry::CacheEntry;
use crate::entry::EntryStatus;
use crate::error::ApiError;
use crate::types::CacheKey;
use crate::types::CachedValue;

type ListenerFn = dyn Fn(&CacheEntry) + Send + Sync + 'static;

struct Listener {
    id:       u64,
    // The highest entry version delivered so far. Deliveries of older versions are dropped, so a listener never
    // goes back in time even if two writers race to notify.
    seen:     AtomicU64,
    callback: Box<ListenerFn>,
}

impl Listener {
    fn deliver(&self, entry: &CacheEntry) {
        let version = entry.version();
        if self.seen.fetch_max(version, Ordering::AcqRel) < version {
            (self.callback)(entry);
        }
    }
}

struct Slot {
    entry:          CacheEntry,
    listeners:      Vec<Arc<Listener>>,
    // Store-wide unique; changes whenever the slot is evicted. Work started against an older generation must not
    // write into the slot.
    generation:     u64,
    // Number of outstanding optimistic patches on this key.
    pins:           usize,
    // A fetch result was discarded while pinned; mark stale when the last pin goes.
    deferred_stale: bool,
}

impl Slot {
    fn new(key: CacheKey, generation: u64) -> Self {
        Self {
            entry: CacheEntry::new(key),
            listeners: Vec::new(),
            generation,
            pins: 0,
            deferred_stale: false,
        }
    }
}

/// Process-wide store of cache entries.
///
/// Every change of an entry goes through one of the methods of this type or through a [`Transaction`]; nothing
/// else can mutate a slot. A transaction holds the store's write lock for its whole duration, which is what makes a
/// mutation's snapshot and optimistic patch atomic with respect to any other mutation. Listeners are notified after
/// the lock is released.
pub struct EntityCache {
    slots:           RwLock<HashMap<CacheKey, Slot>>,
    next_listen:     AtomicU64,
    next_generation: AtomicU64,
}

impl Debug for EntityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("EntityCache").field("entries", &slots.len()).finish()
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityCache {
    pub fn new() -> Self {
        Self {
            slots:           RwLock::new(HashMap::new()),
            next_listen:     AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Run `f` with exclusive access to all slots, then notify the listeners of every key it changed.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let (result, notifications) = {
            let mut slots = self.slots.write();
            let mut tx = Transaction {
                slots:       &mut slots,
                generations: &self.next_generation,
                changed:     Vec::new(),
            };
            let result = f(&mut tx);
            let notifications = tx.collect_notifications();
            (result, notifications)
        };

        for (entry, listeners) in notifications {
            for listener in listeners {
                listener.deliver(&entry);
            }
        }

        result
    }

    /// Current entry without any side effects.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.slots.read().get(key).map(|slot| slot.entry.clone())
    }

    pub fn value(&self, key: &CacheKey) -> Option<CachedValue> {
        self.slots.read().get(key).and_then(|slot| slot.entry.value().cloned())
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.slots.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Return the entry for `key`, creating an idle one if absent. If the entry needs refreshing it is atomically
    /// switched to [`EntryStatus::Loading`] and the second tuple element is `true`: the caller is then responsible for
    /// starting the fetch.
    pub fn read(&self, key: &CacheKey, max_age: Duration) -> (CacheEntry, bool) {
        {
            let slots = self.slots.read();
            if let Some(slot) = slots.get(key) {
                if !slot.entry.needs_refresh(max_age) {
                    return (slot.entry.clone(), false);
                }
            }
        }

        self.transact(|tx| {
            let needs_refresh = tx.entry_or_idle(key).needs_refresh(max_age);
            if needs_refresh {
                tx.set_status(key, EntryStatus::Loading);
            }
            (tx.entry_or_idle(key).clone(), needs_refresh)
        })
    }

    /// Apply a pure transformation to the value under `key` and mark it ready.
    pub fn write<F>(&self, key: &CacheKey, updater: F) -> CacheEntry
    where
        F: FnOnce(Option<&CachedValue>) -> Option<CachedValue>,
    {
        self.transact(|tx| {
            let new_value = updater(tx.value(key));
            tx.put(key, new_value);
            tx.entry_or_idle(key).clone()
        })
    }

    /// Mark `key` stale; the displayed value is kept.
    pub fn invalidate(&self, key: &CacheKey) {
        self.transact(|tx| tx.mark_stale(key));
    }

    pub fn invalidate_user_scoped(&self) {
        self.transact(|tx| tx.invalidate_user_scoped());
    }

    /// Drop the entry of `key`. Subscribers get a final idle entry without a value and stay subscribed.
    pub fn evict(&self, key: &CacheKey) {
        self.transact(|tx| tx.evict(key));
    }

    /// Drop every user-scoped entry.
    pub fn evict_user_scoped(&self) {
        self.transact(|tx| {
            for key in tx.keys().into_iter().filter(CacheKey::is_user_scoped) {
                tx.evict(&key);
            }
        });
    }

    /// Drop everything, listeners included.
    pub fn clear(&self) {
        self.slots.write().clear();
    }

    /// Call `listener` on every change of `key`. The listener is removed when the returned handle is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, key: CacheKey, listener: F) -> Subscription
    where
        F: Fn(&CacheEntry) + Send + Sync + 'static,
    {
        let id = self.next_listen.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.write();
        let slot = slots
            .entry(key)
            .or_insert_with(|| Slot::new(key, self.next_generation.fetch_add(1, Ordering::Relaxed)));
        slot.listeners.push(Arc::new(Listener {
            id,
            seen: AtomicU64::new(slot.entry.version()),
            callback: Box::new(listener),
        }));
        trace!("subscribed #{id} to {key}");

        Subscription {
            key,
            id,
            cache: Arc::downgrade(self),
        }
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.slots.read().get(key).map_or(0, |slot| slot.listeners.len())
    }

    fn unsubscribe(&self, key: &CacheKey, id: u64) {
        if let Some(slot) = self.slots.write().get_mut(key) {
            slot.listeners.retain(|l| l.id != id);
        }
        trace!("unsubscribed #{id} from {key}");
    }

    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.slots.read().get(key).is_some_and(|slot| slot.pins > 0)
    }

    /// Switch `key` to loading. The returned generation must be handed back to [`complete_fetch`](Self::complete_fetch)
    /// or [`fail_fetch`](Self::fail_fetch).
    pub(crate) fn begin_fetch(&self, key: &CacheKey) -> u64 {
        self.transact(|tx| {
            if tx.entry_or_idle(key).status() != EntryStatus::Loading {
                tx.set_status(key, EntryStatus::Loading);
            }
            tx.slot_mut(key).generation
        })
    }

    /// Store a fetch result. A key with an outstanding optimistic patch keeps its patched value; it is only marked
    /// for a refetch once the patch settles. Results for a key evicted since the fetch began are dropped.
    pub(crate) fn complete_fetch(&self, key: &CacheKey, generation: u64, value: CachedValue) {
        self.transact(|tx| {
            if !tx.is_generation(key, generation) {
                trace!("{key} was evicted while fetching; dropping the result");
                return;
            }
            let slot = tx.slot_mut(key);
            if slot.pins > 0 {
                trace!("{key} is pinned by a pending mutation; deferring fetched value");
                slot.deferred_stale = true;
                let status = if slot.entry.value().is_some() {
                    EntryStatus::Ready
                }
                else {
                    EntryStatus::Idle
                };
                tx.set_status(key, status);
            }
            else {
                slot.entry.set_fetched(value);
                tx.touch(key);
            }
        });
    }

    pub(crate) fn fail_fetch(&self, key: &CacheKey, generation: u64, error: Arc<ApiError>) {
        self.transact(|tx| {
            if !tx.is_generation(key, generation) {
                return;
            }
            tx.slot_mut(key).entry.set_failed(error);
            tx.touch(key);
        });
    }
}

/// Exclusive access to the store for the duration of [`EntityCache::transact`].
pub struct Transaction<'a> {
    slots:       &'a mut HashMap<CacheKey, Slot>,
    generations: &'a AtomicU64,
    changed:     Vec<CacheKey>,
}

impl Transaction<'_> {
    fn slot_mut(&mut self, key: &CacheKey) -> &mut Slot {
        let generations = self.generations;
        self.slots
            .entry(*key)
            .or_insert_with(|| Slot::new(*key, generations.fetch_add(1, Ordering::Relaxed)))
    }

    fn entry_or_idle(&mut self, key: &CacheKey) -> &CacheEntry {
        &self.slot_mut(key).entry
    }

    fn touch(&mut self, key: &CacheKey) {
        if !self.changed.contains(key) {
            self.changed.push(*key);
        }
        self.slot_mut(key).entry.bump_version();
    }

    fn collect_notifications(self) -> Vec<(CacheEntry, Vec<Arc<Listener>>)> {
        let slots = self.slots;
        self.changed
            .into_iter()
            .filter_map(|key| {
                slots.get(&key).and_then(|slot| {
                    (!slot.listeners.is_empty()).then(|| (slot.entry.clone(), slot.listeners.clone()))
                })
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.slots.keys().copied().collect()
    }

    /// Generation of the slot of `key`, if there is one.
    pub fn generation(&self, key: &CacheKey) -> Option<u64> {
        self.slots.get(key).map(|slot| slot.generation)
    }

    pub fn is_generation(&self, key: &CacheKey, generation: u64) -> bool {
        self.generation(key) == Some(generation)
    }

    pub fn entry(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    pub fn value(&self, key: &CacheKey) -> Option<&CachedValue> {
        self.slots.get(key).and_then(|slot| slot.entry.value())
    }

    /// Iterate over all values currently held.
    pub fn values(&self) -> impl Iterator<Item = (&CacheKey, &CachedValue)> {
        self.slots
            .iter()
            .filter_map(|(key, slot)| slot.entry.value().map(|value| (key, value)))
    }

    pub fn put(&mut self, key: &CacheKey, value: Option<CachedValue>) {
        self.slot_mut(key).entry.set_value(value);
        self.touch(key);
    }

    pub fn set_status(&mut self, key: &CacheKey, status: EntryStatus) {
        self.slot_mut(key).entry.set_status(status);
        self.touch(key);
    }

    pub fn mark_stale(&mut self, key: &CacheKey) {
        if let Some(slot) = self.slots.get_mut(key) {
            if !slot.entry.is_stale() {
                slot.entry.set_stale(true);
                self.touch(key);
            }
        }
    }

    /// Leave the loading state without a fetch result; the key stays due for a refetch.
    pub fn abandon_loading(&mut self, key: &CacheKey) {
        let Some(slot) = self.slots.get_mut(key)
        else {
            return;
        };
        if slot.entry.status() == EntryStatus::Loading {
            let status = if slot.entry.value().is_some() {
                EntryStatus::Ready
            }
            else {
                EntryStatus::Idle
            };
            slot.entry.set_status(status);
            slot.entry.set_stale(true);
            self.touch(key);
        }
    }

    pub fn invalidate_user_scoped(&mut self) {
        for key in self.keys().into_iter().filter(CacheKey::is_user_scoped) {
            self.mark_stale(&key);
        }
    }

    /// Drop the entry of `key`. A slot kept for its listeners gets a new generation, which detaches it from any
    /// pending mutation or fetch.
    pub fn evict(&mut self, key: &CacheKey) {
        if let Some(slot) = self.slots.get_mut(key) {
            if slot.listeners.is_empty() {
                self.slots.remove(key);
            }
            else {
                slot.generation = self.generations.fetch_add(1, Ordering::Relaxed);
                slot.entry.restore_from(&CacheEntry::new(*key));
                slot.pins = 0;
                slot.deferred_stale = false;
                self.touch(key);
            }
        }
    }

    /// Restore the state captured in `snapshot`. `None` stands for a key that had no entry at snapshot time; it is
    /// reset to an idle entry. Keys evicted in the meantime stay evicted.
    pub fn restore(&mut self, key: &CacheKey, snapshot: Option<&CacheEntry>) {
        let Some(slot) = self.slots.get_mut(key)
        else {
            return;
        };
        match snapshot {
            Some(snapshot) => slot.entry.restore_from(snapshot),
            None => slot.entry.restore_from(&CacheEntry::new(*key)),
        }
        self.touch(key);
    }

    pub fn pin(&mut self, key: &CacheKey) {
        self.slot_mut(key).pins += 1;
    }

    pub fn unpin(&mut self, key: &CacheKey) {
        let Some(slot) = self.slots.get_mut(key)
        else {
            return;
        };
        slot.pins = slot.pins.saturating_sub(1);
        if slot.pins == 0 && slot.deferred_stale {
            slot.deferred_stale = false;
            self.mark_stale(key);
        }
    }
}

/// Handle of a cache listener. Dropping it unsubscribes.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct Subscription {
    key:   CacheKey,
    id:    u64,
    cache: Weak<EntityCache>,
}

impl Subscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.unsubscribe(&self.key, self.id);
        }
    }
}
