//! kbqa-cache - Memoized retrieval results
//!
//! Entries are keyed by a digest of the normalized query and every
//! parameter that shapes the result. Each entry records the versions of the
//! documents it was built from; a version change makes it unservable.
//!
//! Eviction removes TTL-expired entries first, then least recently used
//! entries until the store is back under capacity.

mod key;
mod store;

pub use key::{normalize_query, KeyInput};
pub use store::{CacheLookup, CacheStore, MissReason, PutOutcome};
