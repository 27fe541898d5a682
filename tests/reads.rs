mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spot_sync::prelude::*;

use common::*;

#[tokio::test]
async fn concurrent_reads_share_one_fetch() {
    let (api, sync) = setup();
    let gate = api.gate("reviews");

    let first = sync.read(recent(NOODLES));
    let second = sync.read(recent(NOODLES));
    assert_eq!(first.status(), EntryStatus::Loading);
    assert_eq!(second.status(), EntryStatus::Loading);

    api.wait_for_calls("reviews", 1).await;
    // A caller waiting for the value joins the request already in flight.
    let waiter = tokio::spawn({
        let sync = Arc::clone(&sync);
        async move { sync.fetch(recent(NOODLES)).await }
    });
    tokio::task::yield_now().await;
    gate.notify_one();

    let value = waiter.await.expect("join").expect("fetch");
    assert_eq!(value.as_reviews().map(|r| r.len()), Some(3));
    wait_until(|| sync.peek(&recent(NOODLES)).is_some_and(|e| e.status() == EntryStatus::Ready)).await;
    assert_eq!(api.calls("reviews"), 1);
}

#[tokio::test]
async fn repeated_reads_are_identical() {
    let (api, sync) = setup();
    warm(&sync, &[CacheKey::FoodSpots]).await;

    let first = sync.read(CacheKey::FoodSpots);
    let second = sync.read(CacheKey::FoodSpots);
    assert!(first.same_state(&second));
    assert_eq!(first.version(), second.version());
    assert_eq!(api.calls("food_spots"), 1);
}

#[tokio::test]
async fn failed_refresh_keeps_the_last_value() {
    let (api, sync) = setup();
    warm(&sync, &[CacheKey::FoodSpot(NOODLES)]).await;

    api.fail_next("food_spot", ApiError::Timeout);
    let err = sync.refresh(CacheKey::FoodSpot(NOODLES)).await.expect_err("refresh fails");
    assert_eq!(*err, ApiError::Timeout);

    let entry = sync.read(CacheKey::FoodSpot(NOODLES));
    assert_eq!(entry.status(), EntryStatus::Ready);
    assert!(entry.is_stale_read());
    assert_eq!(entry.error().map(|e| e.class()), Some(FailureClass::Transport));
    assert_eq!(
        entry.value().and_then(|v| v.as_food_spot()).map(|s| s.name.clone()),
        Some("Noodle Bar".to_string())
    );
    // No automatic retry.
    assert_eq!(api.calls("food_spot"), 2);

    // A manual retry clears the error.
    sync.refresh(CacheKey::FoodSpot(NOODLES)).await.expect("retry");
    let entry = sync.peek(&CacheKey::FoodSpot(NOODLES)).expect("entry");
    assert!(entry.error().is_none());
    assert!(!entry.is_stale());
}

#[tokio::test]
async fn first_fetch_failure_is_an_error_entry() {
    let (api, sync) = setup();
    api.fail_next("favourites", ApiError::Transport("dns lookup failed".into()));

    assert!(sync.fetch(CacheKey::Favourites).await.is_err());
    let entry = sync.read(CacheKey::Favourites);
    assert_eq!(entry.status(), EntryStatus::Error);
    assert!(entry.value().is_none());
    assert!(!entry.is_stale_read());
}

#[tokio::test(start_paused = true)]
async fn failed_entries_age_like_fetched_ones() {
    let (api, sync) = setup();
    warm(&sync, &[CacheKey::FoodSpots]).await;

    api.fail_next("food_spots", ApiError::Timeout);
    assert!(sync.refresh(CacheKey::FoodSpots).await.is_err());
    assert_eq!(sync.read(CacheKey::FoodSpots).status(), EntryStatus::Ready);
    assert_eq!(api.calls("food_spots"), 2);

    tokio::time::advance(Duration::from_secs(3_600)).await;
    let entry = sync.read(CacheKey::FoodSpots);
    assert_eq!(entry.status(), EntryStatus::Loading);
    assert!(entry.value().is_some());

    api.wait_for_calls("food_spots", 3).await;
    wait_until(|| sync.peek(&CacheKey::FoodSpots).is_some_and(|e| e.status() == EntryStatus::Ready)).await;
    assert!(sync.peek(&CacheKey::FoodSpots).is_some_and(|e| e.error().is_none()));
}

#[tokio::test(start_paused = true)]
async fn abandoned_fetch_does_not_block_later_reads() {
    let (api, sync) = setup();
    let _gate = api.gate("food_spots");

    let abandoned = tokio::time::timeout(Duration::from_millis(20), sync.fetch(CacheKey::FoodSpots)).await;
    assert!(abandoned.is_err());
    assert_eq!(api.calls("food_spots"), 1);

    let entry = sync.read(CacheKey::FoodSpots);
    assert_eq!(entry.status(), EntryStatus::Loading);
    api.wait_for_calls("food_spots", 2).await;
    wait_until(|| sync.peek(&CacheKey::FoodSpots).is_some_and(|e| e.status() == EntryStatus::Ready)).await;
    assert_eq!(value(&sync, &CacheKey::FoodSpots).as_spots().map(|s| s.len()), Some(2));
}

#[tokio::test(start_paused = true)]
async fn expired_entries_refresh_in_background() {
    let (api, sync) = setup();
    warm(&sync, &[CacheKey::FoodSpots]).await;

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(sync.read(CacheKey::FoodSpots).status(), EntryStatus::Ready);
    assert_eq!(api.calls("food_spots"), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let entry = sync.read(CacheKey::FoodSpots);
    // The old value stays visible while the refresh runs.
    assert_eq!(entry.status(), EntryStatus::Loading);
    assert!(entry.value().is_some());

    api.wait_for_calls("food_spots", 2).await;
    wait_until(|| sync.peek(&CacheKey::FoodSpots).is_some_and(|e| e.status() == EntryStatus::Ready)).await;

    // Shorter maximum age for a single read.
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(
        sync.read_with_max_age(CacheKey::FoodSpots, Duration::from_secs(1)).status(),
        EntryStatus::Loading
    );
}

#[tokio::test]
async fn invalidate_keeps_value_and_refetches_on_read() {
    let (api, sync) = setup();
    warm(&sync, &[recent(NOODLES)]).await;

    sync.invalidate(&recent(NOODLES));
    let entry = sync.peek(&recent(NOODLES)).expect("entry");
    assert!(entry.is_stale());
    assert!(entry.value().is_some());

    let entry = sync.read(recent(NOODLES));
    assert_eq!(entry.status(), EntryStatus::Loading);
    api.wait_for_calls("reviews", 2).await;
}

#[tokio::test]
async fn subscribers_observe_the_same_sequence() {
    let (_api, sync) = setup();
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));

    let sub_first = sync.subscribe(recent(NOODLES), {
        let seen = Arc::clone(&first);
        move |entry| seen.lock().push((entry.version(), entry.status()))
    });
    let _sub_second = sync.subscribe(recent(NOODLES), {
        let seen = Arc::clone(&second);
        move |entry| seen.lock().push((entry.version(), entry.status()))
    });

    warm(&sync, &[recent(NOODLES)]).await;
    sync.toggle_like(NOODLES, THEIRS).await.expect("mutation");
    sync.invalidate(&recent(NOODLES));

    assert_eq!(*first.lock(), *second.lock());
    let versions = first.lock().iter().map(|(v, _)| *v).collect::<Vec<_>>();
    assert!(versions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(first.lock()[0].1, EntryStatus::Loading);

    drop(sub_first);
    let count = first.lock().len();
    sync.invalidate(&recent(NOODLES));
    sync.write(&recent(NOODLES), |value| value.cloned());
    assert_eq!(first.lock().len(), count);
    assert_eq!(second.lock().len(), count + 1);
}

#[tokio::test]
async fn logout_leaves_subscribers_with_an_empty_entry() {
    let (_api, sync) = setup();
    warm(&sync, &[CacheKey::Favourites, own(NOODLES), recent(NOODLES)]).await;

    let last = Arc::new(Mutex::new(None));
    let _sub = sync.subscribe(CacheKey::Favourites, {
        let last = Arc::clone(&last);
        move |entry| *last.lock() = Some(entry.clone())
    });

    sync.logout();
    let entry = last.lock().clone().expect("notified");
    assert_eq!(entry.status(), EntryStatus::Idle);
    assert!(entry.value().is_none());
    assert!(sync.peek(&own(NOODLES)).is_none());
    assert!(sync.peek(&recent(NOODLES)).is_some());
    assert!(sync.user_review_key(NOODLES).is_none());
}
