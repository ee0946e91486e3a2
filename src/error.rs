//! Error taxonomy for the shared-mmap cache.

use std::io;

/// Errors raised by [`crate::Cache`].
///
/// Configuration errors are raised synchronously at the call site before
/// any file is touched. Upstream fetch failures release the locks held for
/// the attempted run without setting any validity bit, so a later retry is
/// always possible. I/O errors mean the cache instance should be discarded
/// and reconstructed.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Invalid construction arguments, or a misaligned `fill`.
    #[error("invalid cache configuration: {0}")]
    Configuration(String),

    /// The upstream fetcher returned an error or a buffer of the wrong length.
    #[error("upstream fetch for range failed: {0}")]
    UpstreamFetch(String),

    /// Failure opening, growing, mapping, or locking one of the cache's files.
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),

    /// The integration hook was asked for a cache by a collaborator that
    /// cannot supply a compatible fetcher (e.g. no async runtime available).
    #[error("incompatible cache request: {0}")]
    IncompatibleCache(String),
}

pub(crate) type Result<T> = std::result::Result<T, CacheError>;
