//! Layer storage and build cache.
//!
//! Provides two layers of persistence:
//! - `LayerStore`: Arena of immutable layer deltas indexed by layer id
//! - `LayerCache`: Map from cache key to the layer an instruction produced

pub mod layer_cache;
pub mod layer_store;

pub use layer_cache::{CacheEntry, CacheKey, KeyClaim, LayerCache};
pub use layer_store::LayerStore;
