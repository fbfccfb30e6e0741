//! Read-through cache for reference data.
//!
//! Successful reads are written through to the local store; when the remote
//! cannot be reached the last stored value is served instead. The cache never
//! expires anything on its own: callers judge staleness from `updated_at`, and
//! it is never the authority for financial state such as stock or balances.

mod layer;
mod types;

pub use layer::ReadThroughCache;
pub use types::{CacheEntry, CacheResult, CacheSource};
