#![allow(dead_code)]

use std::sync::Arc;

use spot_sync::prelude::*;
use spot_sync::test::fixtures;
use spot_sync::test::MockApi;

pub const ME: UserId = UserId(1);
pub const NOODLES: SpotId = SpotId(12);
pub const TACOS: SpotId = SpotId(13);
/// My own review of the noodle bar.
pub const MINE: ReviewId = ReviewId(7);
pub const THEIRS: ReviewId = ReviewId(9);

pub fn recent(spot: SpotId) -> CacheKey {
    CacheKey::Reviews(spot, SortOrder::Recent)
}

pub fn most_liked(spot: SpotId) -> CacheKey {
    CacheKey::Reviews(spot, SortOrder::MostLiked)
}

pub fn own(spot: SpotId) -> CacheKey {
    CacheKey::UserReview(spot, ME)
}

/// Two spots; the noodle bar has my review and two others, the taco stand has none.
pub fn setup() -> (Arc<MockApi>, Arc<SpotSync<MockApi>>) {
    let api = Arc::new(MockApi::new(ME));
    api.add_spot(fixtures::spot(NOODLES.0, "Noodle Bar"));
    api.add_spot(fixtures::spot(TACOS.0, "Taco Stand"));
    api.add_review(fixtures::review(MINE.0, NOODLES.0, ME.0, 3, false));
    api.add_review(fixtures::review(THEIRS.0, NOODLES.0, 2, 4, false));
    api.add_review(fixtures::review(10, NOODLES.0, 3, 1, true));

    let sync = SpotSync::builder()
        .api(Arc::clone(&api))
        .build()
        .expect("engine builds");
    sync.login(ME);
    (api, sync)
}

/// Fetch every key so the views are populated the way open screens would have them.
pub async fn warm(sync: &SpotSync<MockApi>, keys: &[CacheKey]) {
    for key in keys {
        sync.fetch(*key).await.expect("warm-up fetch");
    }
}

pub fn value(sync: &SpotSync<MockApi>, key: &CacheKey) -> CachedValue {
    sync.peek(key)
        .and_then(|entry| entry.into_value())
        .unwrap_or_else(|| panic!("no value for {key}"))
}

pub fn review_in(sync: &SpotSync<MockApi>, key: &CacheKey, id: ReviewId) -> Option<Review> {
    value(sync, key).find_review(id).cloned()
}

pub fn is_stale(sync: &SpotSync<MockApi>, key: &CacheKey) -> bool {
    sync.peek(key).is_some_and(|entry| entry.is_stale())
}

pub async fn wait_until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    while !cond() {
        tokio::task::yield_now().await;
    }
}
