//! Integration tests covering coalescing, persistence, validity, and
//! handoff behavior.

use std::sync::{Arc, Mutex};

use smmap::{Cache, CacheError};
use tempfile::tempdir;

/// Byte at absolute offset `i` is `i % 256`.
fn upstream_bytes(start: u64, end: u64) -> Vec<u8> {
    (start..end).map(|i| (i % 256) as u8).collect()
}

/// A fetcher that records every `(start, end)` it was called with and
/// returns `upstream_bytes`.
#[derive(Clone, Default)]
struct LoggingFetcher {
    calls: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl LoggingFetcher {
    fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

impl smmap::SyncFetch for LoggingFetcher {
    fn fetch(&self, start: u64, end: u64) -> Result<Vec<u8>, CacheError> {
        self.calls.lock().unwrap().push((start, end));
        Ok(upstream_bytes(start, end))
    }
}

fn open_cache(dir: &std::path::Path, fetcher: LoggingFetcher) -> Cache {
    let _ = env_logger::try_init();
    Cache::builder(1024, 65536, dir.join("cache"), dir.join("cache-index"))
        .fetcher(fetcher)
        .build()
        .unwrap()
}

/// Coalescing across overlapping reads.
#[test]
fn scenario_coalesces_overlapping_reads() {
    let dir = tempdir().unwrap();
    let fetcher = LoggingFetcher::default();
    let cache = open_cache(dir.path(), fetcher.clone());

    assert_eq!(cache.fetch(0, 256).unwrap(), upstream_bytes(0, 256));
    assert_eq!(cache.fetch(45, 600).unwrap(), upstream_bytes(45, 600));
    assert_eq!(fetcher.calls(), vec![(0, 1024)]);

    assert_eq!(cache.fetch(2100, 4100).unwrap(), upstream_bytes(2100, 4100));
    assert_eq!(cache.fetch(2200, 4200).unwrap(), upstream_bytes(2200, 4200));
    assert_eq!(fetcher.calls(), vec![(0, 1024), (2048, 5120)]);
}

/// Every fetch returns exactly the upstream bytes for its range,
/// regardless of how many overlapping fetches preceded it.
#[test]
fn returned_bytes_always_match_upstream() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), LoggingFetcher::default());
    for (s, e) in [(0, 256), (45, 600), (2100, 4100), (2200, 4200), (0, 65536)] {
        assert_eq!(cache.fetch(s, e).unwrap(), upstream_bytes(s, e));
    }
}

/// Non-overlapping fetches covering the whole object exactly once each
/// produce exactly one upstream call per maximal invalid run.
#[test]
fn non_overlapping_full_coverage_calls_upstream_once_per_run() {
    let dir = tempdir().unwrap();
    let fetcher = LoggingFetcher::default();
    let cache = open_cache(dir.path(), fetcher.clone());

    let mut offset = 0u64;
    while offset < 65536 {
        let end = (offset + 1024).min(65536);
        cache.fetch(offset, end).unwrap();
        offset = end;
    }
    // Every block is requested in ascending order with no gaps, so the
    // whole object coalesces into a single run and a single upstream call.
    assert_eq!(fetcher.calls(), vec![(0, 65536)]);
}

/// Reopening a cache at the same paths with the same configuration
/// serves previously-fetched ranges without touching the upstream fetcher.
#[test]
fn reopen_persists_committed_blocks() {
    let dir = tempdir().unwrap();
    let data_path = dir.path().join("cache");
    let index_path = dir.path().join("cache-index");

    {
        let fetcher = LoggingFetcher::default();
        let cache = Cache::builder(1024, 65536, &data_path, &index_path)
            .fetcher(fetcher)
            .build()
            .unwrap();
        cache.fetch(0, 4100).unwrap();
    }

    let fetcher = LoggingFetcher::default();
    let cache = Cache::builder(1024, 65536, &data_path, &index_path)
        .fetcher(fetcher.clone())
        .build()
        .unwrap();
    assert_eq!(cache.fetch(0, 4100).unwrap(), upstream_bytes(0, 4100));
    assert!(fetcher.calls().is_empty());
}

/// Once a block is observed valid, it is never observed invalid again.
#[test]
fn validity_is_monotonic() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), LoggingFetcher::default());
    assert!(!cache.is_block_valid(0));
    cache.fetch(0, 256).unwrap();
    assert!(cache.is_block_valid(0));
    cache.fetch(0, 256).unwrap();
    assert!(cache.is_block_valid(0));
}

/// Direct `fill` seeds blocks without ever touching the upstream fetcher.
#[test]
fn scenario_fill_bypasses_fetcher() {
    let dir = tempdir().unwrap();
    let cache = Cache::builder(1024, 65536, dir.path().join("cache"), dir.path().join("cache-index"))
        .build()
        .unwrap();
    cache.fill(0, &vec![b'1'; 1024]).unwrap();
    cache.fill(1024, &vec![b'1'; 1024]).unwrap();
    assert_eq!(cache.fetch(0, 1023).unwrap(), vec![b'1'; 1023]);
    assert_eq!(cache.fetch(1024, 1080).unwrap(), vec![b'1'; 56]);
}

/// Upstream failures must not mark any block valid, so a retry can still
/// succeed.
#[test]
fn upstream_failure_leaves_blocks_invalid_for_retry() {
    let dir = tempdir().unwrap();
    let attempt = Arc::new(Mutex::new(0u32));
    let attempt_clone = attempt.clone();
    let cache = Cache::builder(1024, 65536, dir.path().join("cache"), dir.path().join("cache-index"))
        .fetcher(move |start, end| {
            let mut n = attempt_clone.lock().unwrap();
            *n += 1;
            if *n == 1 {
                Err(CacheError::UpstreamFetch("simulated failure".into()))
            } else {
                Ok(upstream_bytes(start, end))
            }
        })
        .build()
        .unwrap();

    assert!(cache.fetch(0, 256).is_err());
    assert!(!cache.is_block_valid(0));
    assert_eq!(cache.fetch(0, 256).unwrap(), upstream_bytes(0, 256));
    assert!(cache.is_block_valid(0));
}

/// A fetcher returning the wrong number of bytes is an upstream error, not
/// silently accepted.
#[test]
fn short_upstream_response_is_rejected() {
    let dir = tempdir().unwrap();
    let cache = Cache::builder(1024, 65536, dir.path().join("cache"), dir.path().join("cache-index"))
        .fetcher(|start, end| Ok(upstream_bytes(start, end - 1)))
        .build()
        .unwrap();
    let err = cache.fetch(0, 256).unwrap_err();
    assert!(matches!(err, CacheError::UpstreamFetch(_)));
    assert!(!cache.is_block_valid(0));
}

/// Degenerate `start == end` never touches locks or the fetcher.
#[test]
fn empty_range_is_a_noop() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), LoggingFetcher::default());
    assert_eq!(cache.fetch(12345, 12345).unwrap(), Vec::<u8>::new());
}

/// A request outside `[0, size]` is a configuration error, not a panic.
#[test]
fn out_of_range_request_is_a_configuration_error() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path(), LoggingFetcher::default());
    assert!(matches!(
        cache.fetch(0, 1_000_000),
        Err(CacheError::Configuration(_))
    ));
}

/// A zero-sized object never allocates a non-trivial index or data mapping
/// and is always satisfied by the empty range.
#[test]
fn zero_size_object() {
    let dir = tempdir().unwrap();
    let cache = Cache::builder(1024, 0, dir.path().join("cache"), dir.path().join("cache-index"))
        .build()
        .unwrap();
    assert_eq!(cache.fetch(0, 0).unwrap(), Vec::<u8>::new());
}

#[cfg(feature = "serializable")]
mod handoff {
    use super::*;

    /// A serialized-then-deserialized cache returns identical bytes
    /// without additional upstream calls.
    #[test]
    fn handoff_round_trips_without_extra_fetches() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("cache");
        let index_path = dir.path().join("cache-index");

        let fetcher = LoggingFetcher::default();
        let cache = Cache::builder(1024, 65536, &data_path, &index_path)
            .fetcher(fetcher)
            .build()
            .unwrap();
        cache.fetch(0, 256).unwrap();
        cache.fetch(45, 600).unwrap();
        cache.fetch(2100, 4100).unwrap();
        cache.fetch(2200, 4200).unwrap();

        let snapshot = cache.snapshot();
        let encoded = bincode::serialize(&snapshot).unwrap();
        let decoded: smmap::CacheSnapshot = bincode::deserialize(&encoded).unwrap();
        assert!(decoded.had_fetcher());
        assert!(!decoded.had_afetcher());

        let fetcher2 = LoggingFetcher::default();
        let cache2 = decoded.restore().fetcher(fetcher2.clone()).build().unwrap();
        assert_eq!(cache2.fetch(0, 256).unwrap(), upstream_bytes(0, 256));
        assert_eq!(cache2.fetch(45, 600).unwrap(), upstream_bytes(45, 600));
        assert_eq!(cache2.fetch(2100, 4100).unwrap(), upstream_bytes(2100, 4100));
        assert_eq!(cache2.fetch(2200, 4200).unwrap(), upstream_bytes(2200, 4200));
        assert!(fetcher2.calls().is_empty());
    }
}
