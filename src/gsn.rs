//! The Global Sequence Number allocator: a monotonic 64-bit counter
//! persisted in a dedicated lock file, independent of log rotation.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Hands out monotonically increasing 64-bit sequence numbers backed by
/// `count.lock`: 8 bytes, unsigned 64-bit little-endian, no header.
///
/// Safe across threads in this process (an in-process mutex is taken
/// before the advisory file lock) and across processes sharing the same
/// directory (the file lock).
pub struct GsnAllocator {
    path: PathBuf,
    mutex: Mutex<()>,
}

impl GsnAllocator {
    /// Open (or create) the counter file in `dir`.
    ///
    /// Initial value on first creation is 0, so the first call to
    /// [`next`](Self::next) returns 1.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join("count.lock");
        if !path.exists() {
            let mut file = File::create(&path)?;
            file.write_all(&0u64.to_le_bytes())?;
            file.sync_data()?;
        }
        Ok(GsnAllocator {
            path,
            mutex: Mutex::new(()),
        })
    }

    /// Allocate and return the next GSN.
    ///
    /// If the write fails after the read, the on-disk counter is
    /// unchanged and the caller receives an `Io` error — no GSN is
    /// considered allocated in that case.
    pub fn next(&self) -> Result<u64> {
        let _guard = self.mutex.lock().expect("gsn mutex poisoned");
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.lock_exclusive()?;
        let result = (|| -> Result<u64> {
            let current = read_counter(&mut file)?;
            let next = current + 1;
            write_counter(&mut file, next)?;
            Ok(next)
        })();
        let _ = FileExt::unlock(&file);
        result
    }

    /// Read the current counter value without advancing it.
    pub fn current(&self) -> Result<u64> {
        let mut file = File::open(&self.path)?;
        file.lock_shared()?;
        let result = read_counter(&mut file);
        let _ = FileExt::unlock(&file);
        result
    }

    /// Overwrite the counter value. Maintenance-only: callers must ensure
    /// no GSN at or above `value` has already been handed out and is still
    /// live, or monotonicity across restarts is violated.
    pub fn reset(&self, value: u64) -> Result<()> {
        let _guard = self.mutex.lock().expect("gsn mutex poisoned");
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.lock_exclusive()?;
        let result = write_counter(&mut file, value);
        let _ = FileExt::unlock(&file);
        result
    }
}

fn read_counter(file: &mut File) -> Result<u64> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_counter(file: &mut File, value: u64) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&value.to_le_bytes())?;
    file.sync_data()?;
    Ok(())
}
