#![cfg(any(test, feature = "test"))]
//! Test support: fixtures and a scripted in-memory remote.

mod mock;

pub use mock::MockApi;
