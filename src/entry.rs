use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ApiError;
use crate::types::CacheKey;
use crate::types::CachedValue;

/// Fetch state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Never fetched.
    Idle,
    Loading,
    Ready,
    /// The last fetch failed and there is no previous value to fall back to.
    Error,
}

/// A point-in-time copy of one cache slot. Screens only ever see copies; the cache owns the slot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key:             CacheKey,
    value:           Option<CachedValue>,
    status:          EntryStatus,
    last_fetched_at: Option<Instant>,
    failed_at:       Option<Instant>,
    error:           Option<Arc<ApiError>>,
    stale:           bool,
    version:         u64,
}

impl CacheEntry {
    pub(crate) fn new(key: CacheKey) -> Self {
        Self {
            key,
            value: None,
            status: EntryStatus::Idle,
            last_fetched_at: None,
            failed_at: None,
            error: None,
            stale: false,
            version: 0,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> Option<&CachedValue> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<CachedValue> {
        self.value
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn last_fetched_at(&self) -> Option<Instant> {
        self.last_fetched_at
    }

    /// Error of the last failed fetch. With a value present this is a stale-read condition: the value is still
    /// good to display alongside an error banner.
    pub fn error(&self) -> Option<&Arc<ApiError>> {
        self.error.as_ref()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    #[inline]
    pub fn is_stale_read(&self) -> bool {
        self.status == EntryStatus::Ready && self.error.is_some()
    }

    /// Monotonic per-key change counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When the last fetch failed, if it did.
    pub fn failed_at(&self) -> Option<Instant> {
        self.failed_at
    }

    /// Tells if a read should trigger a background fetch. A failed fetch is not retried right away: the entry ages
    /// from the time of the failure, so the next attempt happens once it is `max_age` old or when it is invalidated.
    pub fn needs_refresh(&self, max_age: Duration) -> bool {
        match self.status {
            EntryStatus::Loading => false,
            EntryStatus::Idle => true,
            EntryStatus::Ready | EntryStatus::Error => {
                if self.stale {
                    return true;
                }
                let since = if self.error.is_some() {
                    self.failed_at
                }
                else {
                    self.last_fetched_at
                };
                since.is_none_or(|at| at.elapsed() >= max_age)
            }
        }
    }

    /// Same value, status, and error. Versions are ignored.
    pub fn same_state(&self, other: &CacheEntry) -> bool {
        self.key == other.key
            && self.value == other.value
            && self.status == other.status
            && self.last_fetched_at == other.last_fetched_at
            && self.failed_at == other.failed_at
            && self.stale == other.stale
            && self.error.as_deref() == other.error.as_deref()
    }

    pub(crate) fn set_value(&mut self, value: Option<CachedValue>) {
        self.value = value;
        self.status = EntryStatus::Ready;
    }

    pub(crate) fn set_status(&mut self, status: EntryStatus) {
        self.status = status;
    }

    pub(crate) fn set_fetched(&mut self, value: CachedValue) {
        self.value = Some(value);
        self.status = EntryStatus::Ready;
        self.last_fetched_at = Some(Instant::now());
        self.failed_at = None;
        self.error = None;
        self.stale = false;
    }

    pub(crate) fn set_failed(&mut self, error: Arc<ApiError>) {
        self.status = if self.value.is_some() {
            EntryStatus::Ready
        }
        else {
            EntryStatus::Error
        };
        self.error = Some(error);
        self.failed_at = Some(Instant::now());
        // The failed attempt consumes the invalidation.
        self.stale = false;
    }

    pub(crate) fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    pub(crate) fn bump_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Copy everything but the version from a snapshot.
    pub(crate) fn restore_from(&mut self, snapshot: &CacheEntry) {
        self.value = snapshot.value.clone();
        self.status = snapshot.status;
        self.last_fetched_at = snapshot.last_fetched_at;
        self.failed_at = snapshot.failed_at;
        self.error = snapshot.error.clone();
        self.stale = snapshot.stale;
    }
}
