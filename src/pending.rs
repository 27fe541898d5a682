use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::cache::Transaction;
use crate::entry::CacheEntry;
use crate::mutation::EntityKey;
use crate::mutation::MutationKind;
use crate::types::CacheKey;
use crate::types::CachedValue;

#[derive(Debug, Clone)]
struct Captured {
    key:        CacheKey,
    before:     Option<CacheEntry>,
    // Version right after the optimistic patch; a different version at rollback means someone else wrote the key.
    patched:    u64,
    generation: u64,
}

/// Pre-mutation state of every entry an optimistic patch touched.
///
/// Slots are tracked by generation. A slot evicted while the mutation is pending (e.g. on logout) is left alone at
/// settlement: neither restored, nor unpinned, nor reconciled.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    captured: Vec<Captured>,
    // Keys settled on success without an optimistic patch, with their generation at apply time.
    watched:  Vec<(CacheKey, Option<u64>)>,
}

impl Snapshot {
    /// Patch `key` with `value`, remembering what was there before. The key is pinned until [`Snapshot::commit`] or
    /// [`Snapshot::rollback`].
    pub(crate) fn patch(&mut self, tx: &mut Transaction<'_>, key: CacheKey, value: CachedValue) {
        let before = tx.entry(&key).cloned();
        tx.pin(&key);
        tx.put(&key, Some(value));
        let patched = tx.entry(&key).map_or(0, CacheEntry::version);
        let generation = tx.generation(&key).unwrap_or_default();
        self.captured.push(Captured {
            key,
            before,
            patched,
            generation,
        });
    }

    /// Remember the generation of a key that is only written on commit.
    pub(crate) fn watch(&mut self, tx: &Transaction<'_>, key: CacheKey) {
        self.watched.push((key, tx.generation(&key)));
    }

    /// Tells if `key` is still the slot this snapshot was taken against. Keys the snapshot knows nothing about are
    /// considered current.
    pub fn is_current(&self, tx: &Transaction<'_>, key: &CacheKey) -> bool {
        let recorded = self
            .captured
            .iter()
            .find(|c| c.key == *key)
            .map(|c| Some(c.generation))
            .or_else(|| self.watched.iter().find(|(k, _)| k == key).map(|(_, g)| *g));
        recorded.is_none_or(|generation| generation.is_some() && tx.generation(key) == generation)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.captured.iter().map(|c| &c.key)
    }

    pub fn before(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.captured
            .iter()
            .find(|c| c.key == *key)
            .and_then(|c| c.before.as_ref())
    }

    pub fn len(&self) -> usize {
        self.captured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captured.is_empty()
    }

    /// Keep the patched values.
    pub(crate) fn commit(self, tx: &mut Transaction<'_>) {
        for captured in self.captured {
            if tx.is_generation(&captured.key, captured.generation) {
                tx.unpin(&captured.key);
            }
        }
    }

    /// Put every touched entry back exactly as it was. Entries written by someone else after the patch are restored
    /// too, and also marked stale so they converge on the next read.
    pub(crate) fn rollback(self, tx: &mut Transaction<'_>) {
        // Reverse order, in case a key was captured more than once.
        for captured in self.captured.into_iter().rev() {
            if !tx.is_generation(&captured.key, captured.generation) {
                trace!("{} was evicted while the mutation was pending", captured.key);
                continue;
            }
            let overwritten = tx
                .entry(&captured.key)
                .is_some_and(|entry| entry.version() != captured.patched);
            tx.restore(&captured.key, captured.before.as_ref());
            if overwritten {
                tx.mark_stale(&captured.key);
            }
            // A fetch running at patch time was either deferred already or will land after the unpin.
            tx.abandon_loading(&captured.key);
            tx.unpin(&captured.key);
        }
    }
}

/// A mutation between its optimistic patch and settlement.
#[derive(Clone)]
pub struct PendingMutation {
    id:                u64,
    entity_key:        EntityKey,
    kind:              MutationKind,
    submitted_at:      Instant,
    previous_snapshot: Snapshot,
}

impl PendingMutation {
    pub(crate) fn new(id: u64, entity_key: EntityKey, kind: MutationKind, previous_snapshot: Snapshot) -> Self {
        Self {
            id,
            entity_key,
            kind,
            submitted_at: Instant::now(),
            previous_snapshot,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entity_key(&self) -> EntityKey {
        self.entity_key
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    pub fn previous_snapshot(&self) -> &Snapshot {
        &self.previous_snapshot
    }

    pub(crate) fn into_snapshot(self) -> Snapshot {
        self.previous_snapshot
    }
}

impl Debug for PendingMutation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("PendingMutation")
            .field("id", &self.id)
            .field("entity_key", &self.entity_key)
            .field("kind", &self.kind)
            .field("touched", &self.previous_snapshot.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntityCache;
    use crate::test::fixtures;
    use crate::types::SortOrder;
    use crate::types::SpotId;
    use crate::types::UserId;
    use std::sync::Arc;

    #[test]
    fn rollback_restores_and_flags_foreign_writes() {
        let cache = EntityCache::new();
        let key = CacheKey::Reviews(SpotId(1), SortOrder::Recent);
        cache.write(&key, |_| Some(CachedValue::Reviews(vec![])));
        let before = cache.peek(&key).expect("entry");

        let snapshot = cache.transact(|tx| {
            let mut snapshot = Snapshot::default();
            snapshot.patch(tx, key, CachedValue::Reviews(vec![fixtures::review(1, 1, 1, 0, false)]));
            snapshot
        });
        assert!(cache.is_pinned(&key));

        // Someone else writes after the patch.
        cache.write(&key, |v| v.cloned());

        cache.transact(|tx| snapshot.rollback(tx));
        let after = cache.peek(&key).expect("entry");
        assert_eq!(after.value(), before.value());
        assert!(after.is_stale());
        assert!(!cache.is_pinned(&key));
    }

    #[test]
    fn evicted_keys_are_left_alone() {
        let cache = Arc::new(EntityCache::new());
        let own = CacheKey::UserReview(SpotId(1), UserId(1));
        let review = fixtures::review(7, 1, 1, 0, false);
        cache.write(&own, |_| Some(CachedValue::UserReview(Some(review.clone()))));
        let _sub = cache.subscribe(own, |_| ());

        let snapshot = cache.transact(|tx| {
            let mut snapshot = Snapshot::default();
            let mut liked = review.clone();
            liked.liked_by_me = true;
            snapshot.patch(tx, own, CachedValue::UserReview(Some(liked)));
            snapshot.watch(tx, CacheKey::Favourites);
            snapshot
        });

        cache.evict(&own);
        cache.write(&CacheKey::Favourites, |_| Some(CachedValue::Favourites(vec![])));
        cache.transact(|tx| {
            assert!(!snapshot.is_current(tx, &own));
            assert!(!snapshot.is_current(tx, &CacheKey::Favourites));
            snapshot.rollback(tx);
        });

        let entry = cache.peek(&own).expect("slot kept for the listener");
        assert!(entry.value().is_none());
        assert!(!cache.is_pinned(&own));
    }
}
