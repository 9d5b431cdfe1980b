//! Entity cache for list and detail data.
//!
//! - Entries keyed by hierarchical query keys; prefixes form families
//! - Time-based staleness plus explicit invalidation
//! - Optimistic updates through a per-key patch stack
//! - Cache-first reads that degrade to cached data when offline

pub mod keys;
mod layer;
mod patch;
mod store;
mod traits;

pub use keys::QueryKey;
pub use layer::CacheLayer;
pub use store::{merge_by_id, CacheEntry, EntityCache, EntryStatus, PatchSet};
pub use traits::{CacheResult, CacheSource, Entity};
