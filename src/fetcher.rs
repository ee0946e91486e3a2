//! The upstream byte-range fetcher capability. An external collaborator,
//! not specified beyond its contract: given `(start, end)`, return exactly
//! `end - start` authoritative bytes, or fail.

use crate::error::{CacheError, Result};

/// Synchronous upstream fetcher.
pub trait SyncFetch: Send + Sync {
    /// Returns exactly `end - start` authoritative bytes for `[start, end)`.
    fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>>;
}

impl<F> SyncFetch for F
where
    F: Fn(u64, u64) -> Result<Vec<u8>> + Send + Sync,
{
    fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        self(start, end)
    }
}

/// Cooperative-async upstream fetcher. Blanket-implemented for any
/// `Fn(u64, u64) -> impl Future<Output = Result<Vec<u8>>>`, so a plain async
/// closure works as-is.
#[cfg(feature = "async")]
#[async_trait::async_trait]
pub trait AsyncFetch: Send + Sync {
    /// Returns exactly `end - start` authoritative bytes for `[start, end)`.
    async fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>>;
}

#[cfg(feature = "async")]
#[async_trait::async_trait]
impl<F, Fut> AsyncFetch for F
where
    F: Fn(u64, u64) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Vec<u8>>> + Send,
{
    async fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        self(start, end).await
    }
}

/// Validates that a fetcher's response has exactly the requested length,
/// the cache must never accept a short, partial, or corrupted response.
pub(crate) fn check_len(start: u64, end: u64, buf: &[u8]) -> Result<()> {
    let expected = (end - start) as usize;
    if buf.len() != expected {
        return Err(CacheError::UpstreamFetch(format!(
            "fetcher for [{start}, {end}) returned {} bytes, expected {expected}",
            buf.len()
        )));
    }
    Ok(())
}
