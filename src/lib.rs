//! Compute-once caching for concurrent code.
//!
//! [`AtomicMap`] is a sharded hash map whose single-key operations (load,
//! store, load-or-store, swap, compare-and-swap, ...) are atomic and whose
//! whole-map reads work on consistent snapshots. [`MemoCache`] builds on it
//! to run a loader at most once per key no matter how many callers race for
//! that key.
//!
//! ```
//! use onceshard::MemoCache;
//!
//! let cache = MemoCache::<u32, String, std::io::Error>::new();
//! let greeting = cache.get_or_load(7, |k| Ok(format!("hello {k}"))).unwrap();
//! assert_eq!(greeting.value().map(String::as_str), Some("hello 7"));
//! ```

pub mod cache;
mod error;
pub mod map;
mod once;

pub use cache::{MemoCache, MemoCacheBuilder, Memoized};
pub use error::{Error, Result};
pub use map::{AtomicMap, AtomicMapBuilder, MAX_SHARDS};
