use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::cache::EntityCache;
use crate::error::ApiError;
use crate::graph::FanOut;
use crate::graph::InvalidationGraph;
use crate::graph::PatchContext;
use crate::guard::InteractionGuard;
use crate::mutation::EntityKey;
use crate::mutation::Mutation;
use crate::mutation::MutationKind;
use crate::mutation::MutationOutcome;
use crate::mutation::MutationResponse;
use crate::pending::PendingMutation;
use crate::pending::Snapshot;
use crate::traits::RemoteApi;
use crate::types::Review;
use crate::types::ReviewId;
use crate::types::UserId;

/// What is needed to settle a mutation once its remote call returns.
struct Applied {
    id:      u64,
    kind:    MutationKind,
    ctx:     PatchContext,
    fan_out: FanOut,
}

/// Runs the optimistic-mutation protocol: guard, snapshot and patch, remote call, then commit or rollback.
pub struct MutationCoordinator<API>
where
    API: RemoteApi,
{
    api:              Arc<API>,
    cache:            Arc<EntityCache>,
    guard:            Arc<InteractionGuard>,
    graph:            InvalidationGraph,
    pending:          Mutex<HashMap<u64, PendingMutation>>,
    next_id:          AtomicU64,
    next_provisional: AtomicI64,
}

impl<API> Debug for MutationCoordinator<API>
where
    API: RemoteApi,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("pending", &self.pending.lock().len())
            .field("guard", &self.guard)
            .finish()
    }
}

impl<API> MutationCoordinator<API>
where
    API: RemoteApi,
{
    pub fn new(api: Arc<API>, cache: Arc<EntityCache>, guard: Arc<InteractionGuard>) -> Self {
        Self {
            api,
            cache,
            guard,
            graph: InvalidationGraph,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_provisional: AtomicI64::new(-1),
        }
    }

    pub fn guard(&self) -> &Arc<InteractionGuard> {
        &self.guard
    }

    /// Apply `mutation` optimistically, send it, and settle the cache according to the outcome.
    ///
    /// The returned future must be driven to completion for the guard and the pins to be released; callers that may
    /// be cancelled should run it on its own task.
    #[instrument(level = "debug", skip(self, mutation), fields(slot = ?mutation.guard_slot()))]
    pub async fn mutate(&self, mutation: Mutation, user: Option<UserId>) -> MutationOutcome {
        let (entity, class) = mutation.guard_slot();
        let Some(_permit) = self.guard.try_permit(entity, class)
        else {
            debug!("{entity} already has an outstanding {class:?} mutation");
            return MutationOutcome::GuardRejected;
        };

        let applied = self.apply(&mutation, entity, user);
        let kind = applied.kind;

        match self.send(&mutation, kind).await {
            Ok(response) => {
                self.commit(&mutation, &applied, &response);
                MutationOutcome::Committed { kind, response }
            }
            Err(err) => {
                warn!("{kind:?} on {entity} failed: {err}");
                self.rollback(&applied, &err);
                MutationOutcome::RolledBack {
                    kind,
                    error: Arc::new(err),
                }
            }
        }
    }

    /// Mutations that have been applied optimistically and not yet settled.
    pub fn pending(&self) -> Vec<PendingMutation> {
        let mut pending = self.pending.lock().values().cloned().collect::<Vec<_>>();
        pending.sort_by_key(PendingMutation::id);
        pending
    }

    pub fn is_pending(&self, entity: EntityKey) -> bool {
        self.pending.lock().values().any(|p| p.entity_key() == entity)
    }

    fn provisional_review(&self, mutation: &Mutation, user: Option<UserId>) -> Option<Review> {
        let Mutation::CreateReview { spot_id, draft } = mutation
        else {
            return None;
        };
        let id = ReviewId(self.next_provisional.fetch_sub(1, Ordering::Relaxed));
        Some(Review {
            id,
            food_spot_id: *spot_id,
            user_id: user.unwrap_or(UserId(0)),
            author_name: None,
            rating: draft.rating,
            comment: draft.comment.clone(),
            likes_count: 0,
            liked_by_me: false,
            created_at: Some(Utc::now()),
            images: Vec::new(),
        })
    }

    // Snapshot and patch happen under one cache transaction, so no other mutation or fetch can interleave.
    fn apply(&self, mutation: &Mutation, entity: EntityKey, user: Option<UserId>) -> Applied {
        let provisional = self.provisional_review(mutation, user);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.cache.transact(|tx| {
            let kind = self.graph.resolve_kind(mutation, tx);
            let ctx = self.graph.context(mutation, kind, tx, user, provisional);
            let fan_out = self.graph.fan_out(mutation, kind, &ctx, &tx.keys());

            let mut snapshot = Snapshot::default();
            for key in &fan_out.patch {
                let patched = tx.value(key).and_then(|value| self.graph.patch(mutation, kind, &ctx, value));
                if let Some(value) = patched {
                    snapshot.patch(tx, *key, value);
                }
            }
            for key in &fan_out.settle {
                snapshot.watch(tx, *key);
            }

            debug!("{kind:?} #{id} on {entity}: patched {} key(s)", snapshot.len());
            self.pending
                .lock()
                .insert(id, PendingMutation::new(id, entity, kind, snapshot));

            Applied { id, kind, ctx, fan_out }
        })
    }

    async fn send(&self, mutation: &Mutation, kind: MutationKind) -> Result<MutationResponse, ApiError> {
        let api = &self.api;
        Ok(match mutation {
            Mutation::ToggleLike { review_id, .. } => MutationResponse::Like(api.toggle_like(*review_id).await?),
            Mutation::CreateReview { spot_id, draft } => {
                MutationResponse::Review(api.create_review(*spot_id, draft).await?)
            }
            Mutation::UpdateReview {
                spot_id,
                review_id,
                draft,
            } => MutationResponse::Review(api.update_review(*spot_id, *review_id, draft).await?),
            Mutation::DeleteReview { spot_id, review_id } => {
                api.delete_review(*spot_id, *review_id).await?;
                MutationResponse::Done
            }
            Mutation::ToggleFavourite { spot_id } | Mutation::SetFavourite { spot_id, .. } => {
                if kind == MutationKind::Favourite {
                    api.add_favourite(*spot_id).await?;
                }
                else {
                    api.remove_favourite(*spot_id).await?;
                }
                MutationResponse::Done
            }
            Mutation::AttachImage { owner, upload } => MutationResponse::Image(api.upload_image(*owner, upload).await?),
            Mutation::DetachImage { owner, image_id } => {
                api.delete_image(*owner, *image_id).await?;
                MutationResponse::Done
            }
        })
    }

    fn take_snapshot(&self, id: u64) -> Snapshot {
        self.pending
            .lock()
            .remove(&id)
            .map(PendingMutation::into_snapshot)
            .unwrap_or_default()
    }

    fn commit(&self, mutation: &Mutation, applied: &Applied, response: &MutationResponse) {
        let snapshot = self.take_snapshot(applied.id);
        self.cache.transact(|tx| {
            for key in &applied.fan_out.settle {
                if !snapshot.is_current(tx, key) {
                    continue;
                }
                let settled = tx
                    .value(key)
                    .and_then(|value| self.graph.reconcile(mutation, applied.kind, &applied.ctx, response, value));
                if let Some(value) = settled {
                    tx.put(key, Some(value));
                }
            }
            snapshot.commit(tx);
            for key in &applied.fan_out.refresh {
                tx.mark_stale(key);
            }
        });
        debug!("{:?} #{} committed", applied.kind, applied.id);
    }

    fn rollback(&self, applied: &Applied, error: &ApiError) {
        let snapshot = self.take_snapshot(applied.id);
        self.cache.transact(|tx| {
            snapshot.rollback(tx);
            if error.is_auth() {
                tx.invalidate_user_scoped();
            }
        });
        debug!("{:?} #{} rolled back", applied.kind, applied.id);
    }
}
