use std::sync::Arc;
use std::time::Duration;

use fieldx_plus::fx_plus;
use tokio::runtime::Handle;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::cache::EntityCache;
use crate::cache::Subscription;
use crate::coordinator::MutationCoordinator;
use crate::dedup::RequestDeduplicator;
use crate::entry::CacheEntry;
use crate::error::ApiError;
use crate::error::SyncError;
use crate::guard::InteractionGuard;
use crate::mutation::EntityKey;
use crate::mutation::Mutation;
use crate::mutation::MutationOutcome;
use crate::pending::PendingMutation;
use crate::traits::RemoteApi;
use crate::types::CacheKey;
use crate::types::CachedValue;
use crate::types::ImageId;
use crate::types::ImageOwner;
use crate::types::ImageUpload;
use crate::types::ReviewDraft;
use crate::types::ReviewId;
use crate::types::SpotId;
use crate::types::UserId;

/// The client-side synchronization engine.
///
/// Owns the entity cache and routes reads through the request deduplicator and writes through the mutation
/// coordinator. There are no globals: construct one per session and share it.
///
/// ```ignore
/// let sync = SpotSync::builder()
///     .api(HttpApi::new(&HttpConfig::builder().base_url("https://api.example.com").token(token).build()?)?)
///     .max_age(Duration::from_secs(30))
///     .build()?;
///
/// sync.login(UserId(42));
/// let entry = sync.read(CacheKey::Reviews(SpotId(12), SortOrder::Recent));
/// let outcome = sync.toggle_like(SpotId(12), ReviewId(7)).await?;
/// ```
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`SpotSync`].", "", "See [`SpotSync::builder()`] method."),
        method_doc("Implement builder pattern for [`SpotSync`]."),
    )
)]
pub struct SpotSync<API>
where
    API: RemoteApi,
{
    #[fieldx(vis(pub), builder(vis(pub), required, into), get(clone))]
    api: Arc<API>,

    /// Entries fetched longer than this ago are refetched on the next read.
    #[fieldx(vis(pub), get(copy), default(Duration::from_secs(60)))]
    max_age: Duration,

    /// Minimum time an interaction lock is held, counted from acquisition.
    #[fieldx(vis(pub), get(copy), default(Duration::ZERO))]
    guard_cooldown: Duration,

    /// Upper bound of concurrently tracked in-flight fetches.
    #[fieldx(vis(pub), get(copy), default(1_000))]
    inflight_capacity: u64,

    /// The signed-in user.
    #[fieldx(vis(pub), lock, get(copy), set(private), default(None))]
    user: Option<UserId>,

    #[fieldx(vis(pub), lazy, get(clone), builder(off))]
    cache: Arc<EntityCache>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    guard: Arc<InteractionGuard>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    dedup: Arc<RequestDeduplicator<API>>,

    #[fieldx(vis(pub(crate)), lazy, get(clone), builder(off))]
    coordinator: Arc<MutationCoordinator<API>>,
}

impl<API> SpotSync<API>
where
    API: RemoteApi,
{
    fn build_cache(&self) -> Arc<EntityCache> {
        Arc::new(EntityCache::new())
    }

    fn build_guard(&self) -> Arc<InteractionGuard> {
        Arc::new(InteractionGuard::new(self.guard_cooldown()))
    }

    fn build_dedup(&self) -> Arc<RequestDeduplicator<API>> {
        Arc::new(RequestDeduplicator::new(self.api(), self.cache(), self.inflight_capacity()))
    }

    fn build_coordinator(&self) -> Arc<MutationCoordinator<API>> {
        Arc::new(MutationCoordinator::new(self.api(), self.cache(), self.guard()))
    }

    /// Current entry of `key`. Missing, stale, and expired entries get a background refresh; the call never waits
    /// for the network.
    pub fn read(&self, key: CacheKey) -> CacheEntry {
        self.read_with_max_age(key, self.max_age())
    }

    pub fn read_with_max_age(&self, key: CacheKey, max_age: Duration) -> CacheEntry {
        let (entry, refresh) = self.cache().read(&key, max_age);
        if refresh {
            self.spawn_fetch(key);
        }
        entry
    }

    /// Current entry of `key` without triggering a fetch.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.cache().peek(key)
    }

    /// Apply a local transformation of the value under `key`.
    pub fn write<F>(&self, key: &CacheKey, updater: F) -> CacheEntry
    where
        F: FnOnce(Option<&CachedValue>) -> Option<CachedValue>,
    {
        self.cache().write(key, updater)
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.cache().invalidate(key);
    }

    /// Call `listener` with every new state of `key` until the returned handle is dropped.
    pub fn subscribe<F>(&self, key: CacheKey, listener: F) -> Subscription
    where
        F: Fn(&CacheEntry) + Send + Sync + 'static,
    {
        self.cache().subscribe(key, listener)
    }

    /// Fetch `key` and wait for the result, joining a fetch already in flight.
    #[instrument(level = "trace", skip(self))]
    pub async fn fetch(&self, key: CacheKey) -> Result<CachedValue, Arc<ApiError>> {
        self.dedup().fetch(key).await
    }

    /// Manual retry: mark `key` stale and fetch it.
    pub async fn refresh(&self, key: CacheKey) -> Result<CachedValue, Arc<ApiError>> {
        self.invalidate(&key);
        self.fetch(key).await
    }

    fn spawn_fetch(&self, key: CacheKey) {
        let (Ok(handle), Some(myself)) = (Handle::try_current(), self.myself())
        else {
            warn!("no runtime to refresh {key} on");
            self.cache().transact(|tx| tx.abandon_loading(&key));
            return;
        };

        handle.spawn(async move {
            if let Err(err) = myself.dedup().fetch(key).await {
                debug!("background refresh of {key} failed: {err}");
            }
        });
    }

    /// Run `mutation` through the optimistic-update protocol.
    ///
    /// The mutation runs on its own task, so dropping the returned future does not leave the cache half-settled.
    #[instrument(level = "trace", skip(self))]
    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationOutcome, SyncError> {
        let coordinator = self.coordinator();
        let user = self.user();
        Ok(tokio::spawn(async move { coordinator.mutate(mutation, user).await }).await?)
    }

    pub async fn toggle_like(&self, spot_id: SpotId, review_id: ReviewId) -> Result<MutationOutcome, SyncError> {
        self.mutate(Mutation::ToggleLike { spot_id, review_id }).await
    }

    pub async fn create_review(&self, spot_id: SpotId, draft: ReviewDraft) -> Result<MutationOutcome, SyncError> {
        self.mutate(Mutation::CreateReview { spot_id, draft }).await
    }

    pub async fn update_review(
        &self,
        spot_id: SpotId,
        review_id: ReviewId,
        draft: ReviewDraft,
    ) -> Result<MutationOutcome, SyncError> {
        self.mutate(Mutation::UpdateReview {
            spot_id,
            review_id,
            draft,
        })
        .await
    }

    pub async fn delete_review(&self, spot_id: SpotId, review_id: ReviewId) -> Result<MutationOutcome, SyncError> {
        self.mutate(Mutation::DeleteReview { spot_id, review_id }).await
    }

    pub async fn toggle_favourite(&self, spot_id: SpotId) -> Result<MutationOutcome, SyncError> {
        self.mutate(Mutation::ToggleFavourite { spot_id }).await
    }

    pub async fn favourite(&self, spot_id: SpotId) -> Result<MutationOutcome, SyncError> {
        self.mutate(Mutation::SetFavourite {
            spot_id,
            favourite: true,
        })
        .await
    }

    pub async fn unfavourite(&self, spot_id: SpotId) -> Result<MutationOutcome, SyncError> {
        self.mutate(Mutation::SetFavourite {
            spot_id,
            favourite: false,
        })
        .await
    }

    pub async fn attach_image(&self, owner: ImageOwner, upload: ImageUpload) -> Result<MutationOutcome, SyncError> {
        self.mutate(Mutation::AttachImage { owner, upload }).await
    }

    pub async fn detach_image(&self, owner: ImageOwner, image_id: ImageId) -> Result<MutationOutcome, SyncError> {
        self.mutate(Mutation::DetachImage { owner, image_id }).await
    }

    /// Mutations applied optimistically and still waiting for the server.
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.coordinator().pending()
    }

    pub fn is_pending(&self, entity: EntityKey) -> bool {
        self.coordinator().is_pending(entity)
    }

    /// `userReview(spot, me)` for the signed-in user.
    pub fn user_review_key(&self, spot_id: SpotId) -> Option<CacheKey> {
        self.user().map(|user| CacheKey::UserReview(spot_id, user))
    }

    /// Start a session. Entries of a previous user are dropped.
    pub fn login(&self, user: UserId) {
        if self.user().is_some_and(|previous| previous != user) {
            self.cache().evict_user_scoped();
        }
        self.set_user(Some(user));
        info!("signed in as user #{user}");
    }

    /// End the session, dropping every user-scoped entry.
    pub fn logout(&self) {
        self.set_user(None);
        self.cache().evict_user_scoped();
        info!("signed out");
    }

    /// Drop all cached state. Mutations in flight still run to completion but leave the cleared cache and any lock taken
    /// after this call alone.
    pub fn close(&self) {
        self.dedup().clear();
        self.guard().clear();
        self.cache().clear();
        self.set_user(None);
        debug!("engine closed");
    }
}
