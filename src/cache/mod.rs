pub mod store;

pub use store::{is_fresh_at, CacheError, CacheLookup, CacheStats, CacheStore, Freshness};
