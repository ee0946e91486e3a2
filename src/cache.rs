//! Public synchronous/cooperative-async entry points, construction, direct
//! fill, and handoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::block_index::BlockIndex;
use crate::data_region::DataRegion;
use crate::error::{CacheError, Result};
use crate::fetcher::SyncFetch;
use crate::lock::FetchCoordinator;
use crate::resolver;

#[cfg(feature = "async")]
use crate::fetcher::AsyncFetch;

/// Suffix appended to the index path to derive the lock file's path.
const LOCK_SUFFIX: &str = ".lock";

struct CacheInner {
    blocksize: u64,
    size: u64,
    location: PathBuf,
    index_location: PathBuf,
    block_index: BlockIndex,
    data: DataRegion,
    coordinator: FetchCoordinator,
    fetcher: Option<Box<dyn SyncFetch>>,
    #[cfg(feature = "async")]
    afetcher: Option<Arc<dyn AsyncFetch>>,
}

/// A shared, persistent, block-granular read cache over a single logical
/// object. Cheap to clone: internally reference-counted, so every clone
/// shares the same mappings and file locks within this process.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("blocksize", &self.inner.blocksize)
            .field("size", &self.inner.size)
            .field("location", &self.inner.location)
            .field("index_location", &self.inner.index_location)
            .finish_non_exhaustive()
    }
}

/// Builds a [`Cache`].
pub struct CacheBuilder {
    blocksize: u64,
    size: u64,
    location: PathBuf,
    index_location: PathBuf,
    fetcher: Option<Box<dyn SyncFetch>>,
    #[cfg(feature = "async")]
    afetcher: Option<Arc<dyn AsyncFetch>>,
}

impl std::fmt::Debug for CacheBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("blocksize", &self.blocksize)
            .field("size", &self.size)
            .field("location", &self.location)
            .field("index_location", &self.index_location)
            .field("has_fetcher", &self.fetcher.is_some())
            .finish_non_exhaustive()
    }
}

impl CacheBuilder {
    /// Sets the synchronous upstream fetcher.
    pub fn fetcher(mut self, fetcher: impl SyncFetch + 'static) -> Self {
        self.fetcher = Some(Box::new(fetcher));
        self
    }

    /// Sets the cooperative-async upstream fetcher.
    #[cfg(feature = "async")]
    pub fn afetcher(mut self, afetcher: impl AsyncFetch + 'static) -> Self {
        self.afetcher = Some(Arc::new(afetcher));
        self
    }

    /// Opens (or creates) the data and index files at their canonical
    /// lengths and establishes the shared mappings.
    pub fn build(self) -> Result<Cache> {
        if self.blocksize == 0 {
            return Err(CacheError::Configuration(
                "blocksize must be greater than zero".into(),
            ));
        }
        let nblocks = self.size.div_ceil(self.blocksize);
        let lock_path = lock_path_for(&self.index_location);

        let block_index = BlockIndex::open(&self.index_location, nblocks)?;
        let data = DataRegion::open(&self.location, self.size)?;
        let coordinator = FetchCoordinator::open(&lock_path, nblocks)?;

        log::debug!(
            "opened cache at {:?} / {:?} ({} blocks of {} bytes, {} bytes total)",
            self.location,
            self.index_location,
            nblocks,
            self.blocksize,
            self.size
        );

        Ok(Cache {
            inner: Arc::new(CacheInner {
                blocksize: self.blocksize,
                size: self.size,
                location: self.location,
                index_location: self.index_location,
                block_index,
                data,
                coordinator,
                fetcher: self.fetcher,
                #[cfg(feature = "async")]
                afetcher: self.afetcher,
            }),
        })
    }
}

fn lock_path_for(index_location: &Path) -> PathBuf {
    let mut s = index_location.as_os_str().to_owned();
    s.push(LOCK_SUFFIX);
    PathBuf::from(s)
}

impl Cache {
    /// Starts building a cache over an object of `size` bytes, cut into
    /// `blocksize`-byte blocks, backed by `location` (data) and
    /// `index_location` (validity bitmap).
    pub fn builder(
        blocksize: u64,
        size: u64,
        location: impl Into<PathBuf>,
        index_location: impl Into<PathBuf>,
    ) -> CacheBuilder {
        CacheBuilder {
            blocksize,
            size,
            location: location.into(),
            index_location: index_location.into(),
            fetcher: None,
            #[cfg(feature = "async")]
            afetcher: None,
        }
    }

    /// The configured block size, in bytes.
    pub fn blocksize(&self) -> u64 {
        self.inner.blocksize
    }

    /// The total size of the cached object, in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Reads `[start, end)`, fetching and committing whichever blocks are
    /// not yet valid.
    pub fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        resolver::fetch_sync(
            &self.inner.block_index,
            &self.inner.data,
            &self.inner.coordinator,
            self.inner.fetcher.as_deref(),
            self.inner.blocksize,
            self.inner.size,
            start,
            end,
        )
    }

    /// Cooperative-async counterpart to [`Cache::fetch`]. The only
    /// suspension point is awaiting the upstream async fetcher.
    ///
    /// Must be driven by a multi-threaded tokio runtime: acquiring a block's
    /// file lock runs through [`tokio::task::block_in_place`], which panics
    /// on a current-thread runtime. The `async` feature pulls in tokio's
    /// `rt-multi-thread`, so any runtime built from it already satisfies
    /// this.
    #[cfg(feature = "async")]
    pub async fn afetch(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        resolver::fetch_async(
            &self.inner.block_index,
            &self.inner.data,
            &self.inner.coordinator,
            self.inner.afetcher.as_deref(),
            self.inner.blocksize,
            self.inner.size,
            start,
            end,
        )
        .await
    }

    /// Directly seeds `[offset, offset + bytes.len())` without going through
    /// the upstream fetcher. `offset` and `offset + bytes.len()` must be
    /// block-aligned, except that the final block may end exactly at
    /// [`Cache::size`]. Intended for pre-seeding and tests.
    pub fn fill(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        resolver::fill(
            &self.inner.block_index,
            &self.inner.data,
            &self.inner.coordinator,
            self.inner.blocksize,
            self.inner.size,
            offset,
            bytes,
        )
    }

    /// Whether block `b` has already been committed. Exposed for tests and
    /// diagnostics; ordinary readers should just call [`Cache::fetch`].
    pub fn is_block_valid(&self, b: u64) -> bool {
        self.inner.block_index.is_valid(b)
    }

    /// Captures this cache's configuration for handoff to another instance
    /// in this or another process. See [`CacheSnapshot`].
    #[cfg(feature = "serializable")]
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            blocksize: self.inner.blocksize,
            size: self.inner.size,
            location: self.inner.location.clone(),
            index_location: self.inner.index_location.clone(),
            had_fetcher: self.inner.fetcher.is_some(),
            #[cfg(feature = "async")]
            had_afetcher: self.inner.afetcher.is_some(),
            #[cfg(not(feature = "async"))]
            had_afetcher: false,
        }
    }
}

/// A cache's configuration, reconstructible from its paths alone. A
/// closure cannot cross a serialization
/// boundary, so `had_fetcher`/`had_afetcher` only record *whether* a
/// fetcher was configured; [`CacheSnapshot::restore`] requires the caller to
/// supply fresh ones. No in-memory buffered writes exist at a snapshot
/// boundary: every completed fetch is flushed before its bit is set, so a
/// snapshot never needs to carry pending data.
#[cfg(feature = "serializable")]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheSnapshot {
    blocksize: u64,
    size: u64,
    location: PathBuf,
    index_location: PathBuf,
    had_fetcher: bool,
    had_afetcher: bool,
}

#[cfg(feature = "serializable")]
impl CacheSnapshot {
    /// Reopens the files this snapshot points at and re-establishes the
    /// mappings, handing back a builder so the caller can (re)attach
    /// fetchers before calling [`CacheBuilder::build`].
    pub fn restore(&self) -> CacheBuilder {
        Cache::builder(
            self.blocksize,
            self.size,
            self.location.clone(),
            self.index_location.clone(),
        )
    }

    /// Whether the original cache had a synchronous fetcher configured.
    pub fn had_fetcher(&self) -> bool {
        self.had_fetcher
    }

    /// Whether the original cache had an async fetcher configured.
    pub fn had_afetcher(&self) -> bool {
        self.had_afetcher
    }
}
