//! Resilient request and cache core for a social feed client.
//!
//! [`core::Core`] wires the pieces together: a [`transport::Transport`]
//! with retry, circuit breaking and token refresh; an
//! [`cache::EntityCache`] with optimistic patches; paginated list fetchers;
//! a push bridge that folds server events into the cache; and mutation
//! orchestrators.

pub mod api;
pub mod cache;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod mutations;
pub mod notice;
pub mod paging;
pub mod push;
pub mod session;
pub mod sync;
pub mod transport;

pub use crate::core::Core;
