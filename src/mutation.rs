use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use crate::error::ApiError;
use crate::types::Image;
use crate::types::ImageId;
use crate::types::ImageOwner;
use crate::types::ImageUpload;
use crate::types::LikeState;
use crate::types::Review;
use crate::types::ReviewDraft;
use crate::types::ReviewId;
use crate::types::SpotId;

/// The server entity a mutation is about. Guard locks are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Review(ReviewId),
    FoodSpot(SpotId),
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Review(id) => write!(f, "review#{id}"),
            EntityKey::FoodSpot(id) => write!(f, "spot#{id}"),
        }
    }
}

/// Mutations of the same class on the same entity are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindClass {
    LikeToggle,
    /// Create, update, and delete of a review plus its image attachments.
    ReviewLifecycle,
    Favourite,
    SpotImages,
}

/// The concrete kind a mutation resolves to once the live cache state is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Like,
    Unlike,
    Create,
    Update,
    Delete,
    Favourite,
    Unfavourite,
    AttachImage,
    DetachImage,
}

/// A write requested by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Resolves to [`MutationKind::Like`] or [`MutationKind::Unlike`] from the cached liked flag at apply time.
    ToggleLike { spot_id: SpotId, review_id: ReviewId },
    CreateReview { spot_id: SpotId, draft: ReviewDraft },
    UpdateReview {
        spot_id:   SpotId,
        review_id: ReviewId,
        draft:     ReviewDraft,
    },
    DeleteReview { spot_id: SpotId, review_id: ReviewId },
    /// Resolves to [`MutationKind::Favourite`] or [`MutationKind::Unfavourite`] from the cached state at apply time.
    ToggleFavourite { spot_id: SpotId },
    SetFavourite { spot_id: SpotId, favourite: bool },
    AttachImage { owner: ImageOwner, upload: ImageUpload },
    DetachImage { owner: ImageOwner, image_id: ImageId },
}

impl Mutation {
    pub fn spot_id(&self) -> SpotId {
        match self {
            Mutation::ToggleLike { spot_id, .. }
            | Mutation::CreateReview { spot_id, .. }
            | Mutation::UpdateReview { spot_id, .. }
            | Mutation::DeleteReview { spot_id, .. }
            | Mutation::ToggleFavourite { spot_id }
            | Mutation::SetFavourite { spot_id, .. } => *spot_id,
            Mutation::AttachImage { owner, .. } | Mutation::DetachImage { owner, .. } => owner.spot_id(),
        }
    }

    /// The guard slot this mutation must hold while outstanding.
    pub fn guard_slot(&self) -> (EntityKey, KindClass) {
        match self {
            Mutation::ToggleLike { review_id, .. } => (EntityKey::Review(*review_id), KindClass::LikeToggle),
            // There is no review id before creation; one own review per spot makes the spot the natural lock owner.
            Mutation::CreateReview { spot_id, .. } => (EntityKey::FoodSpot(*spot_id), KindClass::ReviewLifecycle),
            Mutation::UpdateReview { review_id, .. } | Mutation::DeleteReview { review_id, .. } => {
                (EntityKey::Review(*review_id), KindClass::ReviewLifecycle)
            }
            Mutation::ToggleFavourite { spot_id } | Mutation::SetFavourite { spot_id, .. } => {
                (EntityKey::FoodSpot(*spot_id), KindClass::Favourite)
            }
            Mutation::AttachImage { owner, .. } | Mutation::DetachImage { owner, .. } => match owner {
                ImageOwner::Review { review_id, .. } => (EntityKey::Review(*review_id), KindClass::ReviewLifecycle),
                ImageOwner::FoodSpot(spot_id) => (EntityKey::FoodSpot(*spot_id), KindClass::SpotImages),
            },
        }
    }

    /// The review this mutation targets, if any.
    pub fn review_id(&self) -> Option<ReviewId> {
        match self {
            Mutation::ToggleLike { review_id, .. }
            | Mutation::UpdateReview { review_id, .. }
            | Mutation::DeleteReview { review_id, .. } => Some(*review_id),
            Mutation::AttachImage {
                owner: ImageOwner::Review { review_id, .. },
                ..
            }
            | Mutation::DetachImage {
                owner: ImageOwner::Review { review_id, .. },
                ..
            } => Some(*review_id),
            _ => None,
        }
    }
}

/// Payload returned by the remote call of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationResponse {
    Review(Review),
    Like(LikeState),
    Image(Image),
    Done,
}

/// The definitive result of [`SpotSync::mutate`](crate::SpotSync::mutate).
#[derive(Debug, Clone)]
pub enum MutationOutcome {
    /// The remote call succeeded; the cache holds the authoritative values.
    Committed {
        kind:     MutationKind,
        response: MutationResponse,
    },
    /// The remote call failed; every touched entry is back to its pre-mutation state.
    RolledBack { kind: MutationKind, error: Arc<ApiError> },
    /// An equivalent mutation is already outstanding. Nothing was patched and nothing was sent.
    GuardRejected,
}

impl MutationOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, MutationOutcome::Committed { .. })
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, MutationOutcome::RolledBack { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, MutationOutcome::GuardRejected)
    }

    pub fn kind(&self) -> Option<MutationKind> {
        match self {
            MutationOutcome::Committed { kind, .. } | MutationOutcome::RolledBack { kind, .. } => Some(*kind),
            MutationOutcome::GuardRejected => None,
        }
    }

    pub fn error(&self) -> Option<&Arc<ApiError>> {
        match self {
            MutationOutcome::RolledBack { error, .. } => Some(error),
            _ => None,
        }
    }
}
