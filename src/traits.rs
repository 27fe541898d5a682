use async_trait::async_trait;

use crate::error::ApiError;
use crate::types::CacheKey;
use crate::types::CachedValue;
use crate::types::FoodSpot;
use crate::types::Image;
use crate::types::ImageId;
use crate::types::ImageOwner;
use crate::types::ImageUpload;
use crate::types::LikeState;
use crate::types::Review;
use crate::types::ReviewDraft;
use crate::types::ReviewId;
use crate::types::SortOrder;
use crate::types::SpotId;
use crate::types::UserId;
use crate::types::UserProfile;

/// The remote API, the only source of truth for every cached entity.
///
/// Implementations are expected to apply their own transport timeouts; a timeout is reported as
/// [`ApiError::Timeout`] and handled like any other failure.
#[async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    /// `GET /food-spots`
    async fn food_spots(&self) -> Result<Vec<FoodSpot>, ApiError>;
    /// `GET /food-spots/{id}`
    async fn food_spot(&self, id: SpotId) -> Result<FoodSpot, ApiError>;
    /// `GET /food-spots/{id}/reviews?sort={sort}`
    async fn reviews(&self, spot_id: SpotId, sort: SortOrder) -> Result<Vec<Review>, ApiError>;
    /// `GET /favourites`
    async fn favourites(&self) -> Result<Vec<FoodSpot>, ApiError>;
    /// `GET /profile`
    async fn profile(&self) -> Result<UserProfile, ApiError>;

    /// `POST /food-spots/{id}/reviews`
    async fn create_review(&self, spot_id: SpotId, draft: &ReviewDraft) -> Result<Review, ApiError>;
    /// `PUT /food-spots/{id}/reviews/{review_id}`
    async fn update_review(&self, spot_id: SpotId, review_id: ReviewId, draft: &ReviewDraft)
        -> Result<Review, ApiError>;
    /// `DELETE /food-spots/{id}/reviews/{review_id}`
    async fn delete_review(&self, spot_id: SpotId, review_id: ReviewId) -> Result<(), ApiError>;
    /// `POST /reviews/{id}/like`. Every call flips the like; the response carries the resulting state.
    async fn toggle_like(&self, review_id: ReviewId) -> Result<LikeState, ApiError>;
    /// `POST /food-spots/{id}/favourite`
    async fn add_favourite(&self, spot_id: SpotId) -> Result<(), ApiError>;
    /// `DELETE /food-spots/{id}/favourite`
    async fn remove_favourite(&self, spot_id: SpotId) -> Result<(), ApiError>;
    /// `POST /images/{modelType}/{id}`
    async fn upload_image(&self, owner: ImageOwner, upload: &ImageUpload) -> Result<Image, ApiError>;
    /// `DELETE /images/{modelType}/{id}/{imageId}`
    async fn delete_image(&self, owner: ImageOwner, image_id: ImageId) -> Result<(), ApiError>;

    /// There is no dedicated endpoint for a user's own review; it is picked out of the most recent reviews.
    async fn user_review(&self, spot_id: SpotId, user_id: UserId) -> Result<Option<Review>, ApiError> {
        Ok(self
            .reviews(spot_id, SortOrder::Recent)
            .await?
            .into_iter()
            .find(|review| review.user_id == user_id))
    }

    /// Fetch the value of any cache key.
    async fn load(&self, key: &CacheKey) -> Result<CachedValue, ApiError> {
        Ok(match *key {
            CacheKey::FoodSpots => CachedValue::FoodSpots(self.food_spots().await?),
            CacheKey::FoodSpot(id) => CachedValue::FoodSpot(self.food_spot(id).await?),
            CacheKey::Reviews(id, sort) => CachedValue::Reviews(self.reviews(id, sort).await?),
            CacheKey::UserReview(id, user) => CachedValue::UserReview(self.user_review(id, user).await?),
            CacheKey::Favourites => CachedValue::Favourites(self.favourites().await?),
            CacheKey::Profile => CachedValue::Profile(self.profile().await?),
        })
    }
}
