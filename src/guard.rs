use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::mutation::EntityKey;
use crate::mutation::KindClass;

#[derive(Debug, Clone, Copy)]
struct LockState {
    // Identifies the acquisition, so that a stale permit cannot release somebody else's lock.
    token:       u64,
    acquired_at: Instant,
    released:    bool,
}

/// Per-entity interaction lock.
///
/// At most one mutation of a given [`KindClass`] may be outstanding per entity, no matter how many screens expose a
/// control for it. The lock is released on settlement. A non-zero `cooldown` additionally keeps a released lock
/// closed until `cooldown` has passed since acquisition, which serves as a UI-level minimum disable duration; it never
/// shortens the time a lock is held.
pub struct InteractionGuard {
    cooldown:   Duration,
    locks:      Mutex<HashMap<(EntityKey, KindClass), LockState>>,
    next_token: AtomicU64,
}

impl Debug for InteractionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractionGuard")
            .field("cooldown", &self.cooldown)
            .field("locks", &self.locks.lock().len())
            .finish()
    }
}

impl InteractionGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            locks: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn is_closed(&self, state: &LockState) -> bool {
        !state.released || state.acquired_at.elapsed() < self.cooldown
    }

    /// Never fails loudly: `false` simply means "ignore this tap".
    pub fn try_acquire(&self, entity: EntityKey, class: KindClass) -> bool {
        self.acquire(entity, class).is_some()
    }

    fn acquire(&self, entity: EntityKey, class: KindClass) -> Option<u64> {
        let mut locks = self.locks.lock();
        if let Some(state) = locks.get(&(entity, class)) {
            if self.is_closed(state) {
                trace!("guard closed for {entity} / {class:?}");
                return None;
            }
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        locks.insert(
            (entity, class),
            LockState {
                token,
                acquired_at: Instant::now(),
                released: false,
            },
        );
        Some(token)
    }

    pub fn release(&self, entity: EntityKey, class: KindClass) {
        self.release_if(entity, class, |_| true);
    }

    fn release_if(&self, entity: EntityKey, class: KindClass, owned: impl Fn(&LockState) -> bool) {
        let mut locks = self.locks.lock();
        if !locks.get(&(entity, class)).is_some_and(&owned) {
            trace!("{entity} / {class:?} is not held by the releasing permit");
        }
        else if self.cooldown.is_zero() {
            locks.remove(&(entity, class));
        }
        else if let Some(state) = locks.get_mut(&(entity, class)) {
            state.released = true;
        }
        // Drop cooled down records so the map does not grow with every entity ever touched.
        locks.retain(|_, state| !state.released || state.acquired_at.elapsed() < self.cooldown);
    }

    pub fn is_locked(&self, entity: EntityKey, class: KindClass) -> bool {
        self.locks
            .lock()
            .get(&(entity, class))
            .is_some_and(|state| self.is_closed(state))
    }

    /// Like [`try_acquire`](Self::try_acquire), but returns a permit releasing the lock when dropped.
    pub fn try_permit(self: &Arc<Self>, entity: EntityKey, class: KindClass) -> Option<GuardPermit> {
        self.acquire(entity, class).map(|token| GuardPermit {
            guard: Arc::clone(self),
            entity,
            class,
            token,
        })
    }

    pub fn clear(&self) {
        self.locks.lock().clear();
    }
}

/// An acquired interaction lock.
#[must_use = "the lock is released as soon as the permit is dropped"]
pub struct GuardPermit {
    guard:  Arc<InteractionGuard>,
    entity: EntityKey,
    class:  KindClass,
    token:  u64,
}

impl Debug for GuardPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardPermit")
            .field("entity", &self.entity)
            .field("class", &self.class)
            .finish()
    }
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        let token = self.token;
        self.guard.release_if(self.entity, self.class, |state| state.token == token);
    }
}
