use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ApiError;
use crate::traits::RemoteApi;
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

#[derive(Default)]
struct Server {
    spots:       BTreeMap<SpotId, FoodSpot>,
    reviews:     BTreeMap<ReviewId, Review>,
    // Reviews liked by the signed-in user.
    liked:       BTreeSet<ReviewId>,
    favourites:  BTreeSet<SpotId>,
    next_review: i64,
    next_image:  i64,
}

impl Server {
    fn spot_view(&self, spot: &FoodSpot) -> FoodSpot {
        let mut spot = spot.clone();
        spot.is_favourite = self.favourites.contains(&spot.id);
        spot.reviews_count = self.reviews.values().filter(|r| r.food_spot_id == spot.id).count() as u32;
        spot
    }

    fn review_view(&self, review: &Review) -> Review {
        let mut review = review.clone();
        review.liked_by_me = self.liked.contains(&review.id);
        review
    }

    fn review_mut(&mut self, id: ReviewId) -> Result<&mut Review, ApiError> {
        self.reviews.get_mut(&id).ok_or_else(|| not_found("review", id))
    }

    fn images_mut(&mut self, owner: ImageOwner) -> Result<&mut Vec<Image>, ApiError> {
        match owner {
            ImageOwner::Review { review_id, .. } => Ok(&mut self.review_mut(review_id)?.images),
            ImageOwner::FoodSpot(spot_id) => self
                .spots
                .get_mut(&spot_id)
                .map(|spot| &mut spot.images)
                .ok_or_else(|| not_found("food spot", spot_id)),
        }
    }
}

fn not_found(what: &str, id: impl fmt::Display) -> ApiError {
    ApiError::Server {
        status:  404,
        message: format!("{what} {id} not found"),
    }
}

/// In-memory [`RemoteApi`] with scripted latency and failures.
///
/// Every operation is identified by the name of its trait method (`"toggle_like"`, `"reviews"`, ...). A call is
/// counted as soon as it starts; then it waits on the operation's gate, if one is installed; then it fails if a failure
/// was queued for the operation.
pub struct MockApi {
    user:     UserId,
    server:   Mutex<Server>,
    calls:    Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ApiError>>>,
    gates:    Mutex<HashMap<&'static str, Arc<Notify>>>,
}

impl Debug for MockApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockApi")
            .field("user", &self.user)
            .field("calls", &*self.calls.lock())
            .finish()
    }
}

impl MockApi {
    /// A server where `user` is signed in.
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            server: Mutex::new(Server {
                next_review: 1_000,
                next_image: 5_000,
                ..Default::default()
            }),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn add_spot(&self, spot: FoodSpot) {
        let mut server = self.server.lock();
        if spot.is_favourite {
            server.favourites.insert(spot.id);
        }
        server.spots.insert(spot.id, spot);
    }

    pub fn add_review(&self, review: Review) {
        let mut server = self.server.lock();
        if review.liked_by_me {
            server.liked.insert(review.id);
        }
        server.reviews.insert(review.id, review);
    }

    /// Simulate likes from other users.
    pub fn set_likes(&self, review_id: ReviewId, likes_count: u32) {
        if let Some(review) = self.server.lock().reviews.get_mut(&review_id) {
            review.likes_count = likes_count;
        }
    }

    /// Server-side state of a review as the signed-in user sees it.
    pub fn review(&self, review_id: ReviewId) -> Option<Review> {
        let server = self.server.lock();
        server.reviews.get(&review_id).map(|r| server.review_view(r))
    }

    pub fn is_favourite(&self, spot_id: SpotId) -> bool {
        self.server.lock().favourites.contains(&spot_id)
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Wait until `op` has been called at least `count` times.
    pub async fn wait_for_calls(&self, op: &str, count: usize) {
        while self.calls(op) < count {
            tokio::task::yield_now().await;
        }
    }

    /// Make the next call of `op` fail with `error`. Failures queue up.
    pub fn fail_next(&self, op: &'static str, error: ApiError) {
        self.failures.lock().entry(op).or_default().push_back(error);
    }

    /// Hold the next call of `op` until the returned gate is notified.
    pub fn gate(&self, op: &'static str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().insert(op, Arc::clone(&gate));
        gate
    }

    async fn enter(&self, op: &'static str) -> Result<(), ApiError> {
        *self.calls.lock().entry(op).or_default() += 1;

        let gate = self.gates.lock().remove(op);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let failure = self.failures.lock().get_mut(op).and_then(VecDeque::pop_front);
        failure.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl RemoteApi for MockApi {
    async fn food_spots(&self) -> Result<Vec<FoodSpot>, ApiError> {
        self.enter("food_spots").await?;
        let server = self.server.lock();
        Ok(server.spots.values().map(|s| server.spot_view(s)).collect())
    }

    async fn food_spot(&self, id: SpotId) -> Result<FoodSpot, ApiError> {
        self.enter("food_spot").await?;
        let server = self.server.lock();
        server
            .spots
            .get(&id)
            .map(|s| server.spot_view(s))
            .ok_or_else(|| not_found("food spot", id))
    }

    async fn reviews(&self, spot_id: SpotId, sort: SortOrder) -> Result<Vec<Review>, ApiError> {
        self.enter("reviews").await?;
        let server = self.server.lock();
        let mut reviews = server
            .reviews
            .values()
            .filter(|r| r.food_spot_id == spot_id)
            .map(|r| server.review_view(r))
            .collect::<Vec<_>>();
        match sort {
            SortOrder::Recent => reviews.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id))),
            SortOrder::MostLiked => reviews.sort_by(|a, b| (b.likes_count, b.id).cmp(&(a.likes_count, a.id))),
        }
        Ok(reviews)
    }

    async fn favourites(&self) -> Result<Vec<FoodSpot>, ApiError> {
        self.enter("favourites").await?;
        let server = self.server.lock();
        Ok(server
            .favourites
            .iter()
            .filter_map(|id| server.spots.get(id))
            .map(|s| server.spot_view(s))
            .collect())
    }

    async fn profile(&self) -> Result<UserProfile, ApiError> {
        self.enter("profile").await?;
        Ok(UserProfile {
            id:    self.user,
            name:  format!("user{}", self.user),
            email: None,
        })
    }

    async fn create_review(&self, spot_id: SpotId, draft: &ReviewDraft) -> Result<Review, ApiError> {
        self.enter("create_review").await?;
        if !(1..=5).contains(&draft.rating) {
            return Err(ApiError::Validation {
                message: "The given data was invalid.".into(),
                fields:  BTreeMap::from([("rating".to_string(), vec![
                    "The rating must be between 1 and 5.".to_string()
                ])]),
            });
        }

        let mut server = self.server.lock();
        if !server.spots.contains_key(&spot_id) {
            return Err(not_found("food spot", spot_id));
        }
        server.next_review += 1;
        let review = Review {
            id:           ReviewId(server.next_review),
            food_spot_id: spot_id,
            user_id:      self.user,
            author_name:  Some(format!("user{}", self.user)),
            rating:       draft.rating,
            comment:      draft.comment.clone(),
            likes_count:  0,
            liked_by_me:  false,
            created_at:   Some(Utc::now()),
            images:       Vec::new(),
        };
        server.reviews.insert(review.id, review.clone());
        Ok(review)
    }

    async fn update_review(&self, _spot_id: SpotId, review_id: ReviewId, draft: &ReviewDraft)
        -> Result<Review, ApiError> {
        self.enter("update_review").await?;
        let mut server = self.server.lock();
        let review = server.review_mut(review_id)?;
        review.rating = draft.rating;
        review.comment = draft.comment.clone();
        let review = review.clone();
        Ok(server.review_view(&review))
    }

    async fn delete_review(&self, _spot_id: SpotId, review_id: ReviewId) -> Result<(), ApiError> {
        self.enter("delete_review").await?;
        let mut server = self.server.lock();
        server.liked.remove(&review_id);
        server
            .reviews
            .remove(&review_id)
            .map(|_| ())
            .ok_or_else(|| not_found("review", review_id))
    }

    async fn toggle_like(&self, review_id: ReviewId) -> Result<LikeState, ApiError> {
        self.enter("toggle_like").await?;
        let mut server = self.server.lock();
        let liked = !server.liked.contains(&review_id);
        let review = server.review_mut(review_id)?;
        review.likes_count = if liked {
            review.likes_count + 1
        }
        else {
            review.likes_count.saturating_sub(1)
        };
        let likes_count = review.likes_count;
        if liked {
            server.liked.insert(review_id);
        }
        else {
            server.liked.remove(&review_id);
        }
        Ok(LikeState { liked, likes_count })
    }

    async fn add_favourite(&self, spot_id: SpotId) -> Result<(), ApiError> {
        self.enter("add_favourite").await?;
        self.server.lock().favourites.insert(spot_id);
        Ok(())
    }

    async fn remove_favourite(&self, spot_id: SpotId) -> Result<(), ApiError> {
        self.enter("remove_favourite").await?;
        self.server.lock().favourites.remove(&spot_id);
        Ok(())
    }

    async fn upload_image(&self, owner: ImageOwner, upload: &ImageUpload) -> Result<Image, ApiError> {
        self.enter("upload_image").await?;
        let mut server = self.server.lock();
        server.next_image += 1;
        let image = Image {
            id:  ImageId(server.next_image),
            url: format!("https://img.example.com/{}/{}", server.next_image, upload.file_name),
        };
        server.images_mut(owner)?.push(image.clone());
        Ok(image)
    }

    async fn delete_image(&self, owner: ImageOwner, image_id: ImageId) -> Result<(), ApiError> {
        self.enter("delete_image").await?;
        let mut server = self.server.lock();
        let images = server.images_mut(owner)?;
        let before = images.len();
        images.retain(|i| i.id != image_id);
        if images.len() == before {
            return Err(not_found("image", image_id));
        }
        Ok(())
    }
}
