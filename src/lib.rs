//! A shared, persistent, block-granular read cache for slow
//! byte-addressable sources (remote object stores, HTTP servers, network
//! filesystems).
//!
//! The cache is backed by a memory-mapped data file on local disk and a
//! memory-mapped sidecar bitmap recording which fixed-size blocks have been
//! populated. Any number of processes can point at the same pair of paths
//! and cooperatively fill the cache: each contributes fetches under a
//! file-lock discipline that guarantees at-most-once population per
//! block-run, while readers consume already-valid blocks without taking any
//! lock at all.
//!
//! ```no_run
//! use smmap::Cache;
//!
//! # fn main() -> Result<(), smmap::CacheError> {
//! let cache = Cache::builder(4096, 1 << 20, "/tmp/obj.cache", "/tmp/obj.cache-index")
//!     .fetcher(|start, end| {
//!         // fetch `end - start` authoritative bytes for [start, end) from
//!         // wherever this object actually lives.
//!         Ok(vec![0u8; (end - start) as usize])
//!     })
//!     .build()?;
//!
//! let first_kb = cache.fetch(0, 1024)?;
//! # let _ = first_kb;
//! # Ok(())
//! # }
//! ```
//!
//! Cache eviction, coherence with a mutating upstream, and durability
//! beyond "a partially filled block looks unfilled" are explicitly out of
//! scope: the cache is a fixed-capacity backing for a single logical
//! object, assumed immutable for the cache's lifetime.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod block_index;
mod cache;
mod data_region;
mod error;
mod fetcher;
mod lock;
mod registry;
mod resolver;

pub use cache::{Cache, CacheBuilder};
#[cfg(feature = "serializable")]
pub use cache::CacheSnapshot;
pub use error::CacheError;
pub use fetcher::SyncFetch;
#[cfg(feature = "async")]
pub use fetcher::AsyncFetch;
pub use registry::{open, register, register_default, CacheStrategy, OpenRequest, STRATEGY_NAME};

/// Upper bound on blocks coalesced into a single upstream call.
/// Ordinary sequential reads coalesce well below this.
pub const MAX_FETCH_BLOCKS: u64 = resolver::MAX_FETCH_BLOCKS;
