//! Integration hook for an external filesystem abstraction's cache-class
//! registry.
//!
//! The filesystem abstraction itself is an external collaborator and is
//! not implemented here. What *is* implemented is the stable surface such
//! a collaborator would call into: a name ([`STRATEGY_NAME`]) under which
//! this cache registers itself, and a process-wide registry it can be
//! looked up from, so a collaborator never has to hard-code a concrete
//! cache type.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::cache::CacheBuilder;
use crate::error::{CacheError, Result};

/// The name this cache registers itself under.
pub const STRATEGY_NAME: &str = "smmap";

/// What an external filesystem abstraction supplies when it opens a file
/// under this cache strategy: the object's total size, its cache-options
/// paths, and a byte-range fetcher bound to that specific open file.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Total size of the remote object, as reported by the collaborator.
    pub size: u64,
    /// Block size to cache at; forwarded verbatim from cache options.
    pub blocksize: u64,
    /// Data file path; forwarded verbatim from cache options.
    pub location: std::path::PathBuf,
    /// Index file path; forwarded verbatim from cache options.
    pub index_location: std::path::PathBuf,
    /// Whether the collaborator can only drive this file through a
    /// cooperative-async fetcher (e.g. an async-native filesystem with no
    /// synchronous byte-range call to offer). `open` rejects such a
    /// request with [`CacheError::IncompatibleCache`] when this build has
    /// no `async` feature compiled in, since there would then be no
    /// [`CacheBuilder::afetcher`](crate::cache::CacheBuilder::afetcher) to
    /// attach one through.
    pub requires_async_fetcher: bool,
}

/// A named cache strategy, constructible from an [`OpenRequest`].
pub trait CacheStrategy: Send + Sync {
    /// Builds a [`CacheBuilder`] for this open request. The caller still
    /// needs to attach a fetcher and call
    /// [`CacheBuilder::build`](crate::cache::CacheBuilder::build).
    fn open(&self, request: &OpenRequest) -> CacheBuilder;
}

/// The default strategy backing [`STRATEGY_NAME`]: a plain `smmap` cache
/// with no fetcher attached yet (the collaborator attaches one once it
/// knows whether it can offer a sync or async fetcher for this request).
#[derive(Debug, Default)]
pub struct SharedMmapStrategy;

impl CacheStrategy for SharedMmapStrategy {
    fn open(&self, request: &OpenRequest) -> CacheBuilder {
        crate::cache::Cache::builder(
            request.blocksize,
            request.size,
            request.location.clone(),
            request.index_location.clone(),
        )
    }
}

fn registry() -> &'static Mutex<HashMap<String, Box<dyn CacheStrategy>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Box<dyn CacheStrategy>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a cache strategy under `name`. Idempotent: registering the
/// same name twice is a no-op (logged at `debug`).
pub fn register(name: impl Into<String>, strategy: impl CacheStrategy + 'static) {
    let name = name.into();
    let mut table = registry().lock();
    if table.contains_key(&name) {
        log::debug!("cache strategy {name:?} already registered, skipping");
        return;
    }
    table.insert(name, Box::new(strategy));
}

/// Registers [`SharedMmapStrategy`] under [`STRATEGY_NAME`]. Call once at
/// process startup (or rely on [`lookup`]/[`open`] to do it lazily); safe
/// to call more than once.
pub fn register_default() {
    register(STRATEGY_NAME, SharedMmapStrategy);
}

/// Looks up a strategy by name, running [`register_default`] first so that
/// [`STRATEGY_NAME`] is always available without explicit setup.
///
/// Rejects `request.requires_async_fetcher` with
/// [`CacheError::IncompatibleCache`] when this build has no `async`
/// feature: a collaborator that can only supply a cooperative-async
/// fetcher has nothing to attach one to on a `CacheBuilder` built without
/// that feature.
pub fn open(name: &str, request: &OpenRequest) -> Result<CacheBuilder> {
    register_default();
    if request.requires_async_fetcher && !cfg!(feature = "async") {
        return Err(CacheError::IncompatibleCache(format!(
            "{name:?} strategy requires a cooperative-async fetcher, but this build has no \"async\" feature"
        )));
    }
    let table = registry().lock();
    table
        .get(name)
        .map(|strategy| strategy.open(request))
        .ok_or_else(|| {
            CacheError::IncompatibleCache(format!("no cache strategy registered as {name:?}"))
        })
}
