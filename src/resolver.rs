//! Computes which block runs a requested byte range needs, dispatches them
//! through the [`FetchCoordinator`], and assembles the final slice.

use crate::block_index::BlockIndex;
use crate::data_region::DataRegion;
use crate::error::{CacheError, Result};
use crate::fetcher::{check_len, SyncFetch};
use crate::lock::{Acquisition, FetchCoordinator};

/// Bounds the longest single upstream call a resolved run can produce.
/// Large enough that ordinary sequential reads coalesce into one fetch,
/// small enough to bound the worst case of a single huge random read.
pub(crate) const MAX_FETCH_BLOCKS: u64 = 1024;

pub(crate) fn validate_range(start: u64, end: u64, size: u64) -> Result<()> {
    if start > end || end > size {
        return Err(CacheError::Configuration(format!(
            "invalid range [{start}, {end}) for object of size {size}"
        )));
    }
    Ok(())
}

fn block_bounds(start: u64, end: u64, blocksize: u64) -> (u64, u64) {
    let b_lo = start / blocksize;
    let b_hi = end.div_ceil(blocksize);
    (b_lo, b_hi)
}

/// A run that must be populated before the caller's range can be read.
struct PendingRun {
    start: u64,
    end: u64,
}

/// Advances `idx` past already-valid blocks and returns the next run that
/// needs work, or `None` once `idx` reaches `b_hi`.
fn next_run(block_index: &BlockIndex, idx: &mut u64, b_hi: u64) -> Option<PendingRun> {
    while *idx < b_hi {
        if block_index.is_valid(*idx) {
            let (_, valid_end) = block_index.find_run(*idx, b_hi, true);
            *idx = valid_end;
            continue;
        }
        let (run_start, found_end) = block_index.find_run(*idx, b_hi, false);
        let run_end = found_end.min(run_start + MAX_FETCH_BLOCKS);
        return Some(PendingRun {
            start: run_start,
            end: run_end,
        });
    }
    None
}

/// Synchronous entry point.
pub(crate) fn fetch_sync(
    block_index: &BlockIndex,
    data: &DataRegion,
    coordinator: &FetchCoordinator,
    fetcher: Option<&dyn SyncFetch>,
    blocksize: u64,
    size: u64,
    start: u64,
    end: u64,
) -> Result<Vec<u8>> {
    validate_range(start, end, size)?;
    if start == end {
        return Ok(Vec::new());
    }
    let (b_lo, b_hi) = block_bounds(start, end, blocksize);
    let mut idx = b_lo;
    while let Some(run) = next_run(block_index, &mut idx, b_hi) {
        let outcome = coordinator.acquire(run.start, run.end, |b| block_index.is_valid(b))?;
        match outcome {
            Acquisition::AlreadyValid => idx = run.start + 1,
            Acquisition::Writer(guard) => {
                let fetcher = fetcher.ok_or_else(|| {
                    CacheError::Configuration(
                        "fetch required but no synchronous fetcher is configured".into(),
                    )
                })?;
                let byte_start = guard.start * blocksize;
                let byte_end = (guard.end * blocksize).min(size);
                let bytes = fetcher.fetch(byte_start, byte_end)?;
                check_len(byte_start, byte_end, &bytes)?;
                data.write(byte_start, &bytes);
                data.flush(byte_start, bytes.len())?;
                for b in guard.start..guard.end {
                    block_index.mark_valid(b);
                }
                idx = guard.end;
            }
        }
    }
    Ok(data.read(start, (end - start) as usize))
}

/// Cooperative-async entry point. Identical algorithm to [`fetch_sync`]; the
/// only suspension point is the `.await` on the upstream fetcher. Lock
/// acquisition is synchronous and run via `tokio::task::block_in_place` so it
/// never yields mid-protocol.
#[cfg(feature = "async")]
pub(crate) async fn fetch_async(
    block_index: &BlockIndex,
    data: &DataRegion,
    coordinator: &FetchCoordinator,
    fetcher: Option<&(dyn crate::fetcher::AsyncFetch)>,
    blocksize: u64,
    size: u64,
    start: u64,
    end: u64,
) -> Result<Vec<u8>> {
    validate_range(start, end, size)?;
    if start == end {
        return Ok(Vec::new());
    }
    let (b_lo, b_hi) = block_bounds(start, end, blocksize);
    let mut idx = b_lo;
    while let Some(run) = next_run(block_index, &mut idx, b_hi) {
        let outcome = tokio::task::block_in_place(|| {
            coordinator.acquire(run.start, run.end, |b| block_index.is_valid(b))
        })?;
        match outcome {
            Acquisition::AlreadyValid => idx = run.start + 1,
            Acquisition::Writer(guard) => {
                let fetcher = fetcher.ok_or_else(|| {
                    CacheError::Configuration(
                        "fetch required but no async fetcher is configured".into(),
                    )
                })?;
                let byte_start = guard.start * blocksize;
                let byte_end = (guard.end * blocksize).min(size);
                let bytes = fetcher.fetch(byte_start, byte_end).await?;
                check_len(byte_start, byte_end, &bytes)?;
                data.write(byte_start, &bytes);
                data.flush(byte_start, bytes.len())?;
                for b in guard.start..guard.end {
                    block_index.mark_valid(b);
                }
                idx = guard.end;
            }
        }
    }
    Ok(data.read(start, (end - start) as usize))
}

/// Direct pre-seed, bypassing the upstream fetcher entirely.
pub(crate) fn fill(
    block_index: &BlockIndex,
    data: &DataRegion,
    coordinator: &FetchCoordinator,
    blocksize: u64,
    size: u64,
    offset: u64,
    bytes: &[u8],
) -> Result<()> {
    let end = offset + bytes.len() as u64;
    let aligned_end = end == size || end % blocksize == 0;
    if offset % blocksize != 0 || !aligned_end || end > size {
        return Err(CacheError::Configuration(format!(
            "fill offset {offset} / length {} is not block-aligned for blocksize {blocksize}",
            bytes.len()
        )));
    }
    let b_lo = offset / blocksize;
    let b_hi = end.div_ceil(blocksize);
    for b in b_lo..b_hi {
        if block_index.is_valid(b) {
            continue;
        }
        let outcome = coordinator.acquire(b, b + 1, |x| block_index.is_valid(x))?;
        if let Acquisition::Writer(guard) = outcome {
            let block_start = guard.start * blocksize;
            let block_end = (guard.end * blocksize).min(size);
            let slice_start = (block_start - offset) as usize;
            let slice_end = (block_end - offset) as usize;
            data.write(block_start, &bytes[slice_start..slice_end]);
            data.flush(block_start, slice_end - slice_start)?;
            block_index.mark_valid(guard.start);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_bounds_aligns_to_block_boundaries() {
        assert_eq!(block_bounds(0, 256, 1024), (0, 1));
        assert_eq!(block_bounds(2100, 4100, 1024), (2, 5));
        assert_eq!(block_bounds(1024, 1024, 1024), (1, 1));
    }
}
