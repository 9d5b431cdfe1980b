//! Backend API: canonical types, wire adapters and typed endpoints.

pub mod api_types;
mod cache;
mod client;
pub mod envelope;
pub mod types;

pub use client::{ApiClient, ListEndpoint};
pub use envelope::NormalizedPage;
pub use types::*;
