//! Per-block advisory file locks, plus the in-process layer that sits in
//! front of them.
//!
//! POSIX record locks (`fcntl(F_SETLK*)`) are associated with a
//! `(process, inode)` pair, not a file descriptor or thread: two threads (or
//! async tasks) of the *same* process asking for an exclusive lock on the
//! same byte range will both be granted it, trivially, by the kernel. The
//! in-process [`BlockGate`] layer exists purely to serialize same-process
//! contenders before either of them ever calls into `fcntl`, matching the
//! discipline this module implements. It has to stay held for the whole
//! writer critical section (through the, possibly awaited, upstream fetch),
//! so it is a plain acquire/release gate rather than a borrowed guard — that
//! sidesteps holding a `MutexGuard` across an `.await` point.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex as StdMutex};

use libc::{c_short, flock, off_t};
use parking_lot::Mutex;

use crate::error::Result;

/// One byte per block index, used only for its advisory byte-range locks.
#[derive(Debug)]
struct LockFile {
    file: File,
}

impl LockFile {
    fn open(path: &Path, nblocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < nblocks {
            file.set_len(nblocks)?;
        }
        Ok(Self { file })
    }

    /// Attempts an exclusive, non-blocking lock on `[start, end)`. `Ok(true)`
    /// means we now hold it; `Ok(false)` means another process holds some
    /// byte in that range.
    fn try_lock(&self, start: u64, end: u64) -> io::Result<bool> {
        fcntl_lock(&self.file, libc::F_SETLK, start, end, libc::F_WRLCK as c_short)
    }

    /// Blocks until an exclusive lock on `[start, end)` is available.
    fn lock_blocking(&self, start: u64, end: u64) -> io::Result<()> {
        fcntl_lock(&self.file, libc::F_SETLKW, start, end, libc::F_WRLCK as c_short).map(|_| ())
    }

    /// Releases a previously-held lock on `[start, end)`.
    fn unlock(&self, start: u64, end: u64) -> io::Result<()> {
        fcntl_lock(&self.file, libc::F_SETLK, start, end, libc::F_UNLCK as c_short).map(|_| ())
    }
}

fn fcntl_lock(
    file: &File,
    cmd: libc::c_int,
    start: u64,
    end: u64,
    lock_type: c_short,
) -> io::Result<bool> {
    let mut fl: flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type;
    fl.l_whence = libc::SEEK_SET as c_short;
    fl.l_start = start as off_t;
    fl.l_len = (end - start) as off_t;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &mut fl as *mut flock) };
    if rc == 0 {
        Ok(true)
    } else {
        let err = io::Error::last_os_error();
        if cmd == libc::F_SETLK
            && matches!(err.raw_os_error(), Some(libc::EACCES) | Some(libc::EAGAIN))
        {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

/// A single-holder gate for one block index, shared by every in-process
/// thread/task that contends for that block.
#[derive(Debug, Default)]
struct BlockGate {
    held: StdMutex<bool>,
    idle: Condvar,
}

impl BlockGate {
    fn acquire(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.idle.wait(held).unwrap();
        }
        *held = true;
    }

    fn release(&self) {
        *self.held.lock().unwrap() = false;
        self.idle.notify_one();
    }
}

/// Lazily-created in-process gates, one per contended block index.
#[derive(Debug, Default)]
struct BlockGates {
    table: Mutex<HashMap<u64, Arc<BlockGate>>>,
}

impl BlockGates {
    fn handle(&self, block: u64) -> Arc<BlockGate> {
        self.table.lock().entry(block).or_default().clone()
    }
}

/// Outcome of [`FetchCoordinator::acquire`].
pub(crate) enum Acquisition<'a> {
    /// Another process already committed the block by the time we looked;
    /// take the fast path instead.
    AlreadyValid,
    /// We hold the exclusive lock for `[start, end)` and must fetch, write,
    /// flush, mark valid, then drop this guard to release it.
    Writer(WriterGuard<'a>),
}

/// Releases the in-process gate and the file lock range on drop.
pub(crate) struct WriterGuard<'a> {
    coordinator: &'a FetchCoordinator,
    gate: Arc<BlockGate>,
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.coordinator.lock_file.unlock(self.start, self.end) {
            log::warn!(
                "failed to release block lock [{}, {}): {}",
                self.start,
                self.end,
                err
            );
        }
        self.gate.release();
    }
}

/// Coordinates writers of contiguous block runs.
#[derive(Debug)]
pub(crate) struct FetchCoordinator {
    lock_file: LockFile,
    gates: BlockGates,
}

impl FetchCoordinator {
    pub(crate) fn open(path: &Path, nblocks: u64) -> Result<Self> {
        Ok(Self {
            lock_file: LockFile::open(path, nblocks)?,
            gates: BlockGates::default(),
        })
    }

    /// Runs the acquisition protocol for the invalid run
    /// `[run_start, run_end)`. Validity is re-checked against `run_start`
    /// only.
    ///
    /// Blocks the calling thread; callers on an async executor must wrap
    /// this in `tokio::task::block_in_place` so as not to starve the
    /// executor. The only legitimate suspension point is around the
    /// upstream fetch itself, which happens after this call returns.
    pub(crate) fn acquire(
        &self,
        run_start: u64,
        run_end: u64,
        is_valid: impl Fn(u64) -> bool,
    ) -> io::Result<Acquisition<'_>> {
        // Fast path: already committed, no lock needed at all.
        if is_valid(run_start) {
            return Ok(Acquisition::AlreadyValid);
        }

        // Serialize same-process contenders on this block before ever
        // calling into fcntl, whose locks are process-wide, not
        // thread-wide.
        let gate = self.gates.handle(run_start);
        gate.acquire();

        // Try to take the whole coalesced run in one shot.
        if self.lock_file.try_lock(run_start, run_end)? {
            if is_valid(run_start) {
                self.lock_file.unlock(run_start, run_end)?;
                gate.release();
                return Ok(Acquisition::AlreadyValid);
            }
            return Ok(Acquisition::Writer(WriterGuard {
                coordinator: self,
                gate,
                start: run_start,
                end: run_end,
            }));
        }

        // Someone else holds a byte somewhere in the coalesced range; fall
        // back to contending for just the first block so we keep making
        // forward progress without growing the lock footprint.
        let single_end = run_start + 1;
        if self.lock_file.try_lock(run_start, single_end)? {
            if is_valid(run_start) {
                self.lock_file.unlock(run_start, single_end)?;
                gate.release();
                return Ok(Acquisition::AlreadyValid);
            }
            return Ok(Acquisition::Writer(WriterGuard {
                coordinator: self,
                gate,
                start: run_start,
                end: single_end,
            }));
        }

        // Refused: block for the current holder to finish.
        self.lock_file.lock_blocking(run_start, single_end)?;
        if is_valid(run_start) {
            self.lock_file.unlock(run_start, single_end)?;
            gate.release();
            Ok(Acquisition::AlreadyValid)
        } else {
            // The previous holder crashed after taking the lock but before
            // setting the bit: we become the new writer and refetch.
            log::debug!(
                "block {run_start} still invalid after waiting on its lock; becoming writer (likely a peer crash)"
            );
            Ok(Acquisition::Writer(WriterGuard {
                coordinator: self,
                gate,
                start: run_start,
                end: single_end,
            }))
        }
    }
}
