use std::fmt;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use moka::future::Cache;
use tracing::debug;
use tracing::instrument;

use crate::cache::EntityCache;
use crate::error::ApiError;
use crate::traits::RemoteApi;
use crate::types::CacheKey;
use crate::types::CachedValue;

/// Coalesces concurrent fetches of the same key into one remote call.
///
/// moka runs at most one initializer per key at a time and hands its outcome to every waiter; the resulting value is
/// dropped from moka as soon as the call settles, so it only ever holds in-flight requests and the [`EntityCache`]
/// stays the one place where fetched values live.
pub struct RequestDeduplicator<API>
where
    API: RemoteApi,
{
    api:      Arc<API>,
    cache:    Arc<EntityCache>,
    inflight: Cache<CacheKey, CachedValue>,
}

impl<API> Debug for RequestDeduplicator<API>
where
    API: RemoteApi,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("inflight", &self.inflight.entry_count())
            .finish()
    }
}

impl<API> RequestDeduplicator<API>
where
    API: RemoteApi,
{
    pub fn new(api: Arc<API>, cache: Arc<EntityCache>, capacity: u64) -> Self {
        Self {
            api,
            cache,
            inflight: Cache::builder().name("spot-sync-inflight").max_capacity(capacity).build(),
        }
    }

    /// Fetch `key` from the remote API, joining an in-flight request for the same key if there is one.
    pub async fn fetch(&self, key: CacheKey) -> Result<CachedValue, Arc<ApiError>> {
        let api = Arc::clone(&self.api);
        self.fetch_with(key, async move { api.load(&key).await }).await
    }

    /// Same as [`fetch`](Self::fetch) but with a custom loader. The loader only runs if no request for `key` is in
    /// flight.
    #[instrument(level = "trace", skip(self, loader))]
    pub async fn fetch_with<F>(&self, key: CacheKey, loader: F) -> Result<CachedValue, Arc<ApiError>>
    where
        F: Future<Output = Result<CachedValue, ApiError>>,
    {
        let cache = &self.cache;
        let outcome = self
            .inflight
            .try_get_with(key, async move {
                debug!("fetching {key}");
                let mut loading = Loading {
                    cache,
                    key,
                    generation: cache.begin_fetch(&key),
                    settled: false,
                };
                let result = loader.await;
                loading.settled = true;
                match result {
                    Ok(value) => {
                        cache.complete_fetch(&key, loading.generation, value.clone());
                        Ok(value)
                    }
                    Err(err) => {
                        debug!("fetch of {key} failed: {err}");
                        cache.fail_fetch(&key, loading.generation, Arc::new(err.clone()));
                        Err(err)
                    }
                }
            })
            .await;

        if outcome.is_ok() {
            self.inflight.invalidate(&key).await;
        }

        outcome
    }

    pub fn clear(&self) {
        self.inflight.invalidate_all();
    }
}

// Puts the entry back out of the loading state if the fetch future is dropped before the loader returns. Otherwise
// the key would never be refetched.
struct Loading<'a> {
    cache:      &'a EntityCache,
    key:        CacheKey,
    generation: u64,
    settled:    bool,
}

impl Drop for Loading<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("fetch of {} was cancelled", self.key);
            let (key, generation) = (self.key, self.generation);
            self.cache.transact(|tx| {
                if tx.is_generation(&key, generation) {
                    tx.abandon_loading(&key);
                }
            });
        }
    }
}
