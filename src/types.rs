use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::fmt::Display;

macro_rules! entity_id {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<i64> for $name {
                fn from(id: i64) -> Self {
                    Self(id)
                }
            }
        )+
    };
}

entity_id!(
    /// Server id of a food spot.
    SpotId,
    /// Server id of a review. Negative values are provisional ids of reviews not yet confirmed by the server.
    ReviewId,
    UserId,
    ImageId,
);

impl ReviewId {
    #[inline]
    pub fn is_provisional(&self) -> bool {
        self.0 < 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Recent,
    MostLiked,
}

impl SortOrder {
    pub const ALL: [SortOrder; 2] = [SortOrder::Recent, SortOrder::MostLiked];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Recent => "recent",
            SortOrder::MostLiked => "most_liked",
        }
    }
}

impl Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id:  ImageId,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodSpot {
    pub id:             SpotId,
    pub name:           String,
    #[serde(default)]
    pub address:        Option<String>,
    #[serde(default)]
    pub category:       Option<String>,
    /// Server-side aggregate of all review ratings.
    #[serde(default)]
    pub average_rating: Option<f32>,
    #[serde(default)]
    pub reviews_count:  u32,
    #[serde(default)]
    pub is_favourite:   bool,
    #[serde(default)]
    pub images:         Vec<Image>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id:           ReviewId,
    pub food_spot_id: SpotId,
    pub user_id:      UserId,
    #[serde(default)]
    pub author_name:  Option<String>,
    pub rating:       u8,
    #[serde(default)]
    pub comment:      Option<String>,
    #[serde(default)]
    pub likes_count:  u32,
    #[serde(default)]
    pub liked_by_me:  bool,
    #[serde(default)]
    pub created_at:   Option<DateTime<Utc>>,
    #[serde(default)]
    pub images:       Vec<Image>,
}

impl Review {
    /// Apply an authoritative or speculative like state.
    pub fn set_like(&mut self, like: LikeState) {
        self.liked_by_me = like.liked;
        self.likes_count = like.likes_count;
    }

    pub fn like_state(&self) -> LikeState {
        LikeState {
            liked:       self.liked_by_me,
            likes_count: self.likes_count,
        }
    }
}

/// Payload of review create/update requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDraft {
    pub rating:  u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Like state as reported by `POST /reviews/{id}/like`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikeState {
    pub liked:       bool,
    pub likes_count: u32,
}

impl LikeState {
    /// The state after one toggle. The count never goes below zero.
    pub fn toggled(self) -> Self {
        if self.liked {
            LikeState {
                liked:       false,
                likes_count: self.likes_count.saturating_sub(1),
            }
        }
        else {
            LikeState {
                liked:       true,
                likes_count: self.likes_count.saturating_add(1),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id:    UserId,
    pub name:  String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Raw image payload for `POST /images/{modelType}/{id}`.
#[derive(Clone, PartialEq)]
pub struct ImageUpload {
    pub file_name:    String,
    pub content_type: String,
    pub bytes:        Vec<u8>,
}

impl fmt::Debug for ImageUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageUpload")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// The entity an image is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageOwner {
    Review { spot_id: SpotId, review_id: ReviewId },
    FoodSpot(SpotId),
}

impl ImageOwner {
    /// The `{modelType}` path segment of the image endpoints.
    pub fn model_type(&self) -> &'static str {
        match self {
            ImageOwner::Review { .. } => "review",
            ImageOwner::FoodSpot(_) => "food_spot",
        }
    }

    pub fn model_id(&self) -> i64 {
        match self {
            ImageOwner::Review { review_id, .. } => review_id.0,
            ImageOwner::FoodSpot(spot_id) => spot_id.0,
        }
    }

    pub fn spot_id(&self) -> SpotId {
        match self {
            ImageOwner::Review { spot_id, .. } => *spot_id,
            ImageOwner::FoodSpot(spot_id) => *spot_id,
        }
    }
}

/// Identifies one cacheable query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    FoodSpots,
    FoodSpot(SpotId),
    Reviews(SpotId, SortOrder),
    UserReview(SpotId, UserId),
    Favourites,
    Profile,
}

impl CacheKey {
    /// Keys whose content depends on who is signed in. They are dropped on logout and marked stale on auth failures.
    pub fn is_user_scoped(&self) -> bool {
        matches!(self, CacheKey::UserReview(..) | CacheKey::Favourites | CacheKey::Profile)
    }

    pub fn spot_id(&self) -> Option<SpotId> {
        match self {
            CacheKey::FoodSpot(id) | CacheKey::Reviews(id, _) | CacheKey::UserReview(id, _) => Some(*id),
            _ => None,
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::FoodSpots => write!(f, "foodSpots()"),
            CacheKey::FoodSpot(id) => write!(f, "foodSpot({id})"),
            CacheKey::Reviews(id, sort) => write!(f, "reviews({id}, {sort})"),
            CacheKey::UserReview(id, user) => write!(f, "userReview({id}, {user})"),
            CacheKey::Favourites => write!(f, "favourites()"),
            CacheKey::Profile => write!(f, "profile()"),
        }
    }
}

/// The value stored under a [`CacheKey`]. The variant always matches the key kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    FoodSpots(Vec<FoodSpot>),
    FoodSpot(FoodSpot),
    Reviews(Vec<Review>),
    UserReview(Option<Review>),
    Favourites(Vec<FoodSpot>),
    Profile(UserProfile),
}

impl CachedValue {
    pub fn as_reviews(&self) -> Option<&[Review]> {
        match self {
            CachedValue::Reviews(reviews) => Some(reviews),
            _ => None,
        }
    }

    pub fn as_user_review(&self) -> Option<Option<&Review>> {
        match self {
            CachedValue::UserReview(review) => Some(review.as_ref()),
            _ => None,
        }
    }

    pub fn as_food_spot(&self) -> Option<&FoodSpot> {
        match self {
            CachedValue::FoodSpot(spot) => Some(spot),
            _ => None,
        }
    }

    /// Both `foodSpots()` and `favourites()` hold spot lists.
    pub fn as_spots(&self) -> Option<&[FoodSpot]> {
        match self {
            CachedValue::FoodSpots(spots) | CachedValue::Favourites(spots) => Some(spots),
            _ => None,
        }
    }

    pub fn as_profile(&self) -> Option<&UserProfile> {
        match self {
            CachedValue::Profile(profile) => Some(profile),
            _ => None,
        }
    }

    /// Find a review by id wherever this value may hold one.
    pub fn find_review(&self, id: ReviewId) -> Option<&Review> {
        match self {
            CachedValue::Reviews(reviews) => reviews.iter().find(|r| r.id == id),
            CachedValue::UserReview(Some(review)) if review.id == id => Some(review),
            _ => None,
        }
    }

    /// Find a food spot by id wherever this value may hold one.
    pub fn find_spot(&self, id: SpotId) -> Option<&FoodSpot> {
        match self {
            CachedValue::FoodSpot(spot) if spot.id == id => Some(spot),
            CachedValue::FoodSpots(spots) | CachedValue::Favourites(spots) => spots.iter().find(|s| s.id == id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlike_never_goes_negative() {
        let state = LikeState {
            liked:       true,
            likes_count: 0,
        };
        assert_eq!(state.toggled().likes_count, 0);
        assert!(!state.toggled().liked);
    }

    #[test]
    fn user_scoped_keys() {
        assert!(CacheKey::Favourites.is_user_scoped());
        assert!(CacheKey::Profile.is_user_scoped());
        assert!(CacheKey::UserReview(SpotId(1), UserId(2)).is_user_scoped());
        assert!(!CacheKey::Reviews(SpotId(1), SortOrder::Recent).is_user_scoped());
        assert!(!CacheKey::FoodSpots.is_user_scoped());
    }

    #[test]
    fn key_display() {
        assert_eq!(
            CacheKey::Reviews(SpotId(12), SortOrder::MostLiked).to_string(),
            "reviews(12, most_liked)"
        );
        assert_eq!(CacheKey::UserReview(SpotId(12), UserId(3)).to_string(), "userReview(12, 3)");
    }
}
