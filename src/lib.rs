//! # spot-sync
//!
//! Client-side cache synchronization and optimistic mutations for a food-spot review service.
//!
//! The same server entity is usually shown on several screens at once: a review sits in the "recent" list, the "most
//! liked" list, and possibly as the user's own review; a food spot appears in the spot list, its detail page, and the
//! favourites. `spot-sync` keeps all those copies consistent while letting the UI react to user actions instantly.
//!
//! # The Basics
//!
//! - All entries live in one explicitly constructed [`SpotSync`] engine; there are no globals.
//! - Reads never block. A missing, stale, or expired entry is returned as is and refreshed in the background.
//! - Concurrent fetches of the same key share one network request.
//! - Every write is a [`Mutation`]. It is applied optimistically to every cached copy of the entity, sent to the
//!   server, and then either committed with the server's authoritative values or rolled back to the exact
//!   pre-mutation state.
//! - Which copies a mutation touches is declared in one place, the [invalidation graph](graph::RULES).
//! - An interaction guard admits at most one outstanding mutation per entity and kind class; a duplicate tap is
//!   ignored with [`MutationOutcome::GuardRejected`] and never reaches the network.
//!
//! # Remote API
//!
//! The engine talks to the server through the [`RemoteApi`] trait. With the `http` feature enabled, [`HttpApi`]
//! implements it over REST/JSON with bearer-token authentication.
//!
//! ```ignore
//! let api = HttpApi::new(&HttpConfig::builder().base_url("https://api.example.com").token(token).build()?)?;
//! let sync = SpotSync::builder().api(api).build()?;
//! sync.login(UserId(42));
//!
//! let _sub = sync.subscribe(CacheKey::Reviews(SpotId(12), SortOrder::Recent), |entry| render(entry));
//! let entry = sync.read(CacheKey::Reviews(SpotId(12), SortOrder::Recent));
//!
//! match sync.toggle_like(SpotId(12), ReviewId(7)).await? {
//!     MutationOutcome::RolledBack { error, .. } => show_banner(error.user_message()),
//!     _ => (),
//! }
//! ```

pub mod cache;
pub mod coordinator;
pub mod decode;
pub mod dedup;
pub mod engine;
pub mod entry;
pub mod error;
pub mod graph;
pub mod guard;
#[cfg(feature = "http")]
pub mod http;
pub mod mutation;
pub mod pending;
pub mod test;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use engine::SpotSync;
#[doc(inline)]
pub use error::ApiError;
#[doc(inline)]
pub use error::SyncError;
#[cfg(feature = "http")]
#[doc(inline)]
pub use http::HttpApi;
#[cfg(feature = "http")]
#[doc(inline)]
pub use http::HttpConfig;
#[doc(inline)]
pub use mutation::Mutation;
#[doc(inline)]
pub use mutation::MutationOutcome;
#[doc(inline)]
pub use traits::RemoteApi;

pub mod prelude {
    pub use crate::cache::Subscription;
    pub use crate::engine::SpotSync;
    pub use crate::entry::CacheEntry;
    pub use crate::entry::EntryStatus;
    pub use crate::error::ApiError;
    pub use crate::error::FailureClass;
    pub use crate::error::SyncError;
    pub use crate::mutation::EntityKey;
    pub use crate::mutation::KindClass;
    pub use crate::mutation::Mutation;
    pub use crate::mutation::MutationKind;
    pub use crate::mutation::MutationOutcome;
    pub use crate::mutation::MutationResponse;
    pub use crate::traits::RemoteApi;
    pub use crate::types::*;
}
