//! Named response stores and the fetch strategy engine built on them.
//!
//! - `storage`: named, generation-scoped stores backed by SQLite
//! - `layer`: the per-request state machine (lookup, network, cache, synthesize)
//! - `traits`: entry and source types shared by both

mod layer;
mod storage;
mod traits;

pub use layer::{FetchEngine, Outcome};
pub use storage::{Caches, SqliteStorage};

#[cfg(test)]
pub use storage::CacheStorage;
#[cfg(test)]
pub use traits::{CacheSource, CachedEntry};
