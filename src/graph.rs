//! Declarative fan-out of mutations over cache keys.
//!
//! The same review or food spot is denormalized into several cache entries: review lists in every sort order, the
//! user's own review, the spot detail, the spot list, and the favourites list. [`RULES`] declares once, per mutation
//! kind, which of those views get an optimistic patch, which get the authoritative server values on success, and
//! which are only marked stale because their new content cannot be computed locally (e.g. the server-side
//! "most liked" ordering).
use crate::cache::Transaction;
use crate::mutation::Mutation;
use crate::mutation::MutationKind;
use crate::mutation::MutationResponse;
use crate::types::CacheKey;
use crate::types::CachedValue;
use crate::types::FoodSpot;
use crate::types::LikeState;
use crate::types::Review;
use crate::types::ReviewId;
use crate::types::SortOrder;
use crate::types::SpotId;
use crate::types::UserId;

/// A class of cache keys relative to the mutated food spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// `reviews(spot, *)`
    ReviewLists,
    /// `reviews(spot, recent)`
    RecentList,
    /// `reviews(spot, most_liked)`
    MostLikedList,
    /// `userReview(spot, *)`
    UserReviews,
    /// `userReview(spot, me)`
    OwnUserReview,
    /// `foodSpot(spot)`
    SpotDetail,
    /// `foodSpots()`
    SpotList,
    /// `favourites()`
    Favourites,
}

/// Fan-out declaration of one mutation kind.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub kinds:   &'static [MutationKind],
    /// Receive the optimistic patch before the remote call.
    pub patch:   &'static [Target],
    /// Receive authoritative values from the server response.
    pub settle:  &'static [Target],
    /// Marked stale once the mutation commits.
    pub refresh: &'static [Target],
}

use MutationKind as K;
use Target as T;

pub static RULES: &[Rule] = &[
    Rule {
        kinds:   &[K::Like, K::Unlike],
        patch:   &[T::ReviewLists, T::UserReviews],
        settle:  &[T::ReviewLists, T::UserReviews],
        refresh: &[T::MostLikedList],
    },
    Rule {
        kinds:   &[K::Create],
        patch:   &[T::RecentList, T::OwnUserReview],
        settle:  &[T::RecentList, T::UserReviews],
        refresh: &[T::MostLikedList, T::SpotDetail, T::SpotList],
    },
    Rule {
        kinds:   &[K::Update],
        patch:   &[T::ReviewLists, T::UserReviews],
        settle:  &[T::ReviewLists, T::UserReviews],
        refresh: &[T::SpotDetail, T::SpotList],
    },
    Rule {
        kinds:   &[K::Delete],
        patch:   &[T::ReviewLists, T::UserReviews],
        settle:  &[],
        refresh: &[T::SpotDetail, T::SpotList],
    },
    Rule {
        kinds:   &[K::Favourite, K::Unfavourite],
        patch:   &[T::Favourites, T::SpotDetail, T::SpotList],
        settle:  &[],
        refresh: &[],
    },
    Rule {
        kinds:   &[K::AttachImage],
        patch:   &[],
        settle:  &[T::ReviewLists, T::UserReviews, T::SpotDetail, T::SpotList, T::Favourites],
        refresh: &[],
    },
    Rule {
        kinds:   &[K::DetachImage],
        patch:   &[T::ReviewLists, T::UserReviews, T::SpotDetail, T::SpotList, T::Favourites],
        settle:  &[],
        refresh: &[],
    },
];

/// Concrete keys a mutation fans out to, given the keys currently cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    pub patch:   Vec<CacheKey>,
    pub settle:  Vec<CacheKey>,
    pub refresh: Vec<CacheKey>,
}

/// Facts gathered from the cache at apply time, shared by every patched key so all copies end up identical.
#[derive(Debug, Clone, Default)]
pub struct PatchContext {
    pub user:        Option<UserId>,
    /// Target like state, computed once from the live liked flag.
    pub like:        Option<LikeState>,
    /// A local copy of the mutated spot, needed to insert it into the favourites list.
    pub spot:        Option<FoodSpot>,
    /// Placeholder shown in place of a review being created.
    pub provisional: Option<Review>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidationGraph;

impl InvalidationGraph {
    pub fn rule(&self, kind: MutationKind) -> &'static Rule {
        RULES
            .iter()
            .find(|rule| rule.kinds.contains(&kind))
            .unwrap_or_else(|| unreachable!("no fan-out rule for {kind:?}"))
    }

    /// Decide the concrete kind from the live cache state.
    pub fn resolve_kind(&self, mutation: &Mutation, tx: &Transaction<'_>) -> MutationKind {
        match mutation {
            Mutation::ToggleLike { review_id, .. } => {
                if find_review(tx, *review_id).is_some_and(|r| r.liked_by_me) {
                    MutationKind::Unlike
                }
                else {
                    MutationKind::Like
                }
            }
            Mutation::CreateReview { .. } => MutationKind::Create,
            Mutation::UpdateReview { .. } => MutationKind::Update,
            Mutation::DeleteReview { .. } => MutationKind::Delete,
            Mutation::ToggleFavourite { spot_id } => {
                if is_favourite(tx, *spot_id) {
                    MutationKind::Unfavourite
                }
                else {
                    MutationKind::Favourite
                }
            }
            Mutation::SetFavourite { favourite, .. } => {
                if *favourite {
                    MutationKind::Favourite
                }
                else {
                    MutationKind::Unfavourite
                }
            }
            Mutation::AttachImage { .. } => MutationKind::AttachImage,
            Mutation::DetachImage { .. } => MutationKind::DetachImage,
        }
    }

    pub fn context(
        &self,
        mutation: &Mutation,
        kind: MutationKind,
        tx: &Transaction<'_>,
        user: Option<UserId>,
        provisional: Option<Review>,
    ) -> PatchContext {
        let like = match kind {
            MutationKind::Like | MutationKind::Unlike => mutation.review_id().map(|id| {
                let current = find_review(tx, id).map(Review::like_state).unwrap_or(LikeState {
                    liked:       kind == MutationKind::Unlike,
                    likes_count: 0,
                });
                current.toggled()
            }),
            _ => None,
        };

        let spot = match kind {
            MutationKind::Favourite => find_spot(tx, mutation.spot_id()).cloned(),
            _ => None,
        };

        PatchContext {
            user,
            like,
            spot,
            provisional,
        }
    }

    /// Resolve the rule of `kind` into concrete keys out of `keys`.
    pub fn fan_out(&self, mutation: &Mutation, kind: MutationKind, ctx: &PatchContext, keys: &[CacheKey]) -> FanOut {
        let rule = self.rule(kind);
        let spot_id = mutation.spot_id();
        let resolve = |targets: &[Target]| {
            keys.iter()
                .filter(|key| targets.iter().any(|t| matches_target(*t, key, spot_id, ctx.user)))
                .copied()
                .collect::<Vec<_>>()
        };

        let mut fan_out = FanOut {
            patch:   resolve(rule.patch),
            settle:  resolve(rule.settle),
            refresh: resolve(rule.refresh),
        };

        // Without a local copy of the spot there is nothing to insert into the favourites list; refetch it instead.
        if kind == MutationKind::Favourite && ctx.spot.is_none() {
            fan_out.patch.retain(|key| *key != CacheKey::Favourites);
            fan_out.refresh.extend(keys.iter().filter(|key| **key == CacheKey::Favourites));
        }

        fan_out
    }

    /// The optimistic value of one patched key, or `None` if the patch does not change it.
    pub fn patch(
        &self,
        mutation: &Mutation,
        kind: MutationKind,
        ctx: &PatchContext,
        value: &CachedValue,
    ) -> Option<CachedValue> {
        match (kind, mutation) {
            (K::Like | K::Unlike, Mutation::ToggleLike { review_id, .. }) => {
                let like = ctx.like?;
                map_review(value, *review_id, |review| review.set_like(like))
            }
            (K::Create, Mutation::CreateReview { .. }) => {
                let provisional = ctx.provisional.as_ref()?;
                match value {
                    CachedValue::Reviews(reviews) if !reviews.iter().any(|r| r.id == provisional.id) => {
                        let mut reviews = reviews.clone();
                        reviews.insert(0, provisional.clone());
                        Some(CachedValue::Reviews(reviews))
                    }
                    CachedValue::UserReview(_) => Some(CachedValue::UserReview(Some(provisional.clone()))),
                    _ => None,
                }
            }
            (K::Update, Mutation::UpdateReview { review_id, draft, .. }) => map_review(value, *review_id, |review| {
                review.rating = draft.rating;
                review.comment = draft.comment.clone();
            }),
            (K::Delete, Mutation::DeleteReview { review_id, .. }) => remove_review(value, *review_id),
            (K::Favourite | K::Unfavourite, _) => {
                let favourite = kind == K::Favourite;
                let spot_id = mutation.spot_id();
                match value {
                    CachedValue::Favourites(spots) => {
                        let present = spots.iter().any(|s| s.id == spot_id);
                        if favourite && !present {
                            let mut spot = ctx.spot.clone()?;
                            spot.is_favourite = true;
                            let mut spots = spots.clone();
                            spots.push(spot);
                            Some(CachedValue::Favourites(spots))
                        }
                        else if !favourite && present {
                            Some(CachedValue::Favourites(
                                spots.iter().filter(|s| s.id != spot_id).cloned().collect(),
                            ))
                        }
                        else {
                            None
                        }
                    }
                    _ => map_spot(value, spot_id, |spot| spot.is_favourite = favourite),
                }
            }
            (K::DetachImage, Mutation::DetachImage { owner, image_id }) => match mutation.review_id() {
                Some(review_id) => map_review(value, review_id, |review| review.images.retain(|i| i.id != *image_id)),
                None => map_spot(value, owner.spot_id(), |spot| spot.images.retain(|i| i.id != *image_id)),
            },
            _ => None,
        }
    }

    /// The authoritative value of one settled key, or `None` if the response does not change it.
    pub fn reconcile(
        &self,
        mutation: &Mutation,
        kind: MutationKind,
        ctx: &PatchContext,
        response: &MutationResponse,
        value: &CachedValue,
    ) -> Option<CachedValue> {
        match (kind, response) {
            (K::Like | K::Unlike, MutationResponse::Like(like)) => {
                map_review(value, mutation.review_id()?, |review| review.set_like(*like))
            }
            (K::Create, MutationResponse::Review(created)) => {
                let provisional_id = ctx.provisional.as_ref()?.id;
                map_review(value, provisional_id, |review| *review = created.clone())
            }
            (K::Update, MutationResponse::Review(updated)) => {
                map_review(value, updated.id, |review| *review = updated.clone())
            }
            (K::AttachImage, MutationResponse::Image(image)) => {
                let Mutation::AttachImage { owner, .. } = mutation
                else {
                    return None;
                };
                let attach = |images: &mut Vec<_>| {
                    if !images.contains(image) {
                        images.push(image.clone());
                    }
                };
                match mutation.review_id() {
                    Some(review_id) => map_review(value, review_id, |review| attach(&mut review.images)),
                    None => map_spot(value, owner.spot_id(), |spot| attach(&mut spot.images)),
                }
            }
            _ => None,
        }
    }
}

fn matches_target(target: Target, key: &CacheKey, spot_id: SpotId, user: Option<UserId>) -> bool {
    match (target, key) {
        (T::ReviewLists, CacheKey::Reviews(id, _)) => *id == spot_id,
        (T::RecentList, CacheKey::Reviews(id, SortOrder::Recent)) => *id == spot_id,
        (T::MostLikedList, CacheKey::Reviews(id, SortOrder::MostLiked)) => *id == spot_id,
        (T::UserReviews, CacheKey::UserReview(id, _)) => *id == spot_id,
        (T::OwnUserReview, CacheKey::UserReview(id, owner)) => *id == spot_id && Some(*owner) == user,
        (T::SpotDetail, CacheKey::FoodSpot(id)) => *id == spot_id,
        (T::SpotList, CacheKey::FoodSpots) => true,
        (T::Favourites, CacheKey::Favourites) => true,
        _ => false,
    }
}

// Copies can disagree, e.g. after a deferred fetch. The user's own review wins over the recent list, which wins over
// anything else; ties go by key so the pick never depends on map order.
fn review_copy_rank(key: &CacheKey) -> (u8, i64, i64) {
    match key {
        CacheKey::UserReview(spot, user) => (0, spot.0, user.0),
        CacheKey::Reviews(spot, SortOrder::Recent) => (1, spot.0, 0),
        CacheKey::Reviews(spot, SortOrder::MostLiked) => (2, spot.0, 0),
        _ => (3, 0, 0),
    }
}

// The spot detail is the freshest copy of a single spot.
fn spot_copy_rank(key: &CacheKey) -> u8 {
    match key {
        CacheKey::FoodSpot(_) => 0,
        CacheKey::FoodSpots => 1,
        CacheKey::Favourites => 2,
        _ => 3,
    }
}

fn find_review<'a>(tx: &'a Transaction<'_>, id: ReviewId) -> Option<&'a Review> {
    tx.values()
        .filter_map(|(key, value)| value.find_review(id).map(|review| (review_copy_rank(key), review)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, review)| review)
}

fn find_spot<'a>(tx: &'a Transaction<'_>, id: SpotId) -> Option<&'a FoodSpot> {
    tx.values()
        .filter_map(|(key, value)| value.find_spot(id).map(|spot| (spot_copy_rank(key), spot)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, spot)| spot)
}

fn is_favourite(tx: &Transaction<'_>, spot_id: SpotId) -> bool {
    // The favourites list is the most direct evidence; fall back to the flag on any spot copy.
    if let Some(CachedValue::Favourites(spots)) = tx.value(&CacheKey::Favourites) {
        return spots.iter().any(|s| s.id == spot_id);
    }
    find_spot(tx, spot_id).is_some_and(|s| s.is_favourite)
}

fn map_review<F>(value: &CachedValue, id: ReviewId, f: F) -> Option<CachedValue>
where
    F: FnOnce(&mut Review),
{
    match value {
        CachedValue::Reviews(reviews) => {
            let idx = reviews.iter().position(|r| r.id == id)?;
            let mut reviews = reviews.clone();
            f(&mut reviews[idx]);
            Some(CachedValue::Reviews(reviews))
        }
        CachedValue::UserReview(Some(review)) if review.id == id => {
            let mut review = review.clone();
            f(&mut review);
            Some(CachedValue::UserReview(Some(review)))
        }
        _ => None,
    }
}

fn remove_review(value: &CachedValue, id: ReviewId) -> Option<CachedValue> {
    match value {
        CachedValue::Reviews(reviews) if reviews.iter().any(|r| r.id == id) => {
            Some(CachedValue::Reviews(reviews.iter().filter(|r| r.id != id).cloned().collect()))
        }
        CachedValue::UserReview(Some(review)) if review.id == id => Some(CachedValue::UserReview(None)),
        _ => None,
    }
}

fn map_spot<F>(value: &CachedValue, id: SpotId, f: F) -> Option<CachedValue>
where
    F: FnOnce(&mut FoodSpot),
{
    match value {
        CachedValue::FoodSpot(spot) if spot.id == id => {
            let mut spot = spot.clone();
            f(&mut spot);
            Some(CachedValue::FoodSpot(spot))
        }
        CachedValue::FoodSpots(spots) | CachedValue::Favourites(spots) => {
            let idx = spots.iter().position(|s| s.id == id)?;
            let mut spots = spots.clone();
            f(&mut spots[idx]);
            Some(match value {
                CachedValue::Favourites(_) => CachedValue::Favourites(spots),
                _ => CachedValue::FoodSpots(spots),
            })
        }
        _ => None,
    }
}
