//! The active log file: append, ranged reads, and crash-recovery repair.

use crate::archive::{self, RotationConfig, RotationOutcome};
use crate::error::Result;
use crate::record::Record;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

/// In-memory mapping from line index to the byte offset where that line
/// begins in `message.log`.
///
/// `offsets[i]` is the starting byte of line `i`. `last_len` is the byte
/// length of the final line (including its `\n`), kept so a subsequent
/// append can compute its start offset without a `stat` call.
struct OffsetCache {
    offsets: Vec<u64>,
    last_len: u64,
}

impl OffsetCache {
    fn empty() -> Self {
        OffsetCache {
            offsets: Vec::new(),
            last_len: 0,
        }
    }
}

/// Outcome of a successful [`LogFile::append`].
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// 0-based index of the newly written line.
    pub line_index: usize,
    /// Number of lines in the active log after this append (and any
    /// resulting rotation).
    pub count_after: usize,
    /// Set if this append triggered rotation.
    pub rotation: Option<RotationOutcome>,
}

/// Owns one active log file (`message.log`), its offset cache, and the
/// advisory lock that serialises mutations against it.
///
/// Read operations (`get_range`, `get_latest`, `count`) never take the
/// lock — they tolerate racing appends because committed line bytes never
/// change and the offset cache only grows.
pub struct LogFile {
    dir: PathBuf,
    log_path: PathBuf,
    lock_path: PathBuf,
    /// In-process thread lock, acquired before the OS file lock, so
    /// threads in this program don't contend for the file lock needlessly.
    write_mutex: Mutex<()>,
    cache: RwLock<OffsetCache>,
}

impl LogFile {
    /// Open (or create) the active log in `dir`.
    ///
    /// Creates `dir` if absent, creates an empty `message.log` and
    /// `message.log.lock` if absent, otherwise scans the existing log and
    /// repairs any corrupt or truncated trailing content.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let log_path = dir.join("message.log");
        let lock_path = dir.join("message.log.lock");

        if !log_path.exists() {
            File::create(&log_path)?;
        }
        if !lock_path.exists() {
            File::create(&lock_path)?;
        }

        let cache = repair_and_build_cache(&log_path)?;

        Ok(LogFile {
            dir,
            log_path,
            lock_path,
            write_mutex: Mutex::new(()),
            cache: RwLock::new(cache),
        })
    }

    /// The directory this log file lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path to the active log file.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Append `record` to the active log, stamping no fields itself (the
    /// caller is expected to have already stamped `metadata.gsn`).
    ///
    /// If `rotation` is configured and the post-append line count reaches
    /// `max_records`, the Archiver runs before the lock is released, and
    /// `AppendOutcome::rotation` is populated.
    pub fn append(
        &self,
        record: &Record,
        rotation: Option<&RotationConfig>,
    ) -> Result<AppendOutcome> {
        let _thread_guard = self.write_mutex.lock().expect("write_mutex poisoned");
        let lock_file = File::open(&self.lock_path)?;
        lock_file.lock_exclusive()?;

        let outcome = self.append_locked(record, rotation);

        let _ = FileExt::unlock(&lock_file);
        outcome
    }

    fn append_locked(
        &self,
        record: &Record,
        rotation: Option<&RotationConfig>,
    ) -> Result<AppendOutcome> {
        let line = record.to_line()?;

        let mut cache = self.cache.write().expect("cache lock poisoned");
        let start_offset = cache
            .offsets
            .last()
            .map(|&last| last + cache.last_len)
            .unwrap_or(0);

        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;
        writeln!(file, "{line}")?;
        file.sync_data()?;

        let written_len = line.len() as u64 + 1; // +1 for '\n'
        cache.offsets.push(start_offset);
        cache.last_len = written_len;

        let line_index = cache.offsets.len() - 1;
        let mut count_after = cache.offsets.len();

        let mut rotation_outcome = None;
        if let Some(cfg) = rotation {
            if count_after as u64 >= cfg.max_records {
                let outcome = archive::rotate(&self.log_path, &self.dir, cfg.archive_batch)?;
                if let Some(ref outcome) = outcome {
                    *cache = repair_and_build_cache(&self.log_path)?;
                    count_after = cache.offsets.len();
                    log::info!(
                        "rotated {} records into {}",
                        outcome.archived_count,
                        outcome.archive_path.display()
                    );
                }
                rotation_outcome = outcome;
            }
        }

        Ok(AppendOutcome {
            line_index,
            count_after,
            rotation: rotation_outcome,
        })
    }

    /// Read `count` records starting at line index `start`, oldest-first.
    ///
    /// Out-of-range `start` returns an empty vector. Empty and corrupt
    /// lines are skipped silently (corrupt lines are logged at `warn`).
    pub fn get_range(&self, start: usize, count: usize) -> Result<Vec<Record>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let start_offset = {
            let cache = self.cache.read().expect("cache lock poisoned");
            match cache.offsets.get(start) {
                Some(&offset) => offset,
                None => return Ok(Vec::new()),
            }
        };

        let file = File::open(&self.log_path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(start_offset))?;

        let mut results = Vec::with_capacity(count);
        let mut buf = String::new();
        while results.len() < count {
            buf.clear();
            let bytes_read = reader.read_line(&mut buf)?;
            if bytes_read == 0 {
                break;
            }
            if !buf.ends_with('\n') {
                // Partial line at EOF — a concurrent append mid-write. Stop.
                break;
            }
            let line = buf.trim_end_matches('\n');
            if line.is_empty() {
                continue;
            }
            match Record::from_line(line) {
                Some(record) => results.push(record),
                None => {
                    log::warn!(
                        "skipping corrupt line while reading {}",
                        self.log_path.display()
                    );
                }
            }
        }
        Ok(results)
    }

    /// Read the most recent `n` records, newest-first.
    pub fn get_latest(&self, n: usize) -> Result<Vec<Record>> {
        let total = self.count();
        let start = total.saturating_sub(n);
        let mut records = self.get_range(start, total - start)?;
        records.reverse();
        Ok(records)
    }

    /// Current number of lines in the active log.
    pub fn count(&self) -> usize {
        self.cache.read().expect("cache lock poisoned").offsets.len()
    }

    /// Force a rescan and rebuild of the offset cache from disk.
    ///
    /// Used by [`crate::HistoryFacade::invalidate_caches`] to recover from
    /// out-of-band modification (e.g. an external tool rewriting the file).
    pub fn invalidate_cache(&self) -> Result<()> {
        let new_cache = repair_and_build_cache(&self.log_path)?;
        *self.cache.write().expect("cache lock poisoned") = new_cache;
        Ok(())
    }
}

fn repair_and_build_cache(path: &Path) -> Result<OffsetCache> {
    let data = fs::read(path)?;

    let mut offsets = Vec::new();
    let mut lengths = Vec::new();
    let mut any_invalid = false;
    let mut pos = 0usize;

    while pos < data.len() {
        match data[pos..].iter().position(|&b| b == b'\n') {
            Some(rel) => {
                let line_end = pos + rel;
                let line_len = (rel + 1) as u64;
                if line_is_valid(&data[pos..line_end]) {
                    offsets.push(pos as u64);
                    lengths.push(line_len);
                } else {
                    any_invalid = true;
                    log::warn!("dropping corrupt line at byte offset {pos} in {}", path.display());
                }
                pos = line_end + 1;
            }
            None => {
                // Trailing bytes with no terminator: a torn write. Drop it.
                any_invalid = true;
                log::warn!(
                    "dropping truncated trailing line at byte offset {pos} in {}",
                    path.display()
                );
                break;
            }
        }
    }

    if any_invalid {
        rewrite_valid_lines(path, &data, &offsets, &lengths)?;
    }

    let last_len = lengths.last().copied().unwrap_or(0);
    let offsets = if any_invalid {
        let mut rebuilt = Vec::with_capacity(lengths.len());
        let mut cursor = 0u64;
        for &len in &lengths {
            rebuilt.push(cursor);
            cursor += len;
        }
        rebuilt
    } else {
        offsets
    };

    Ok(OffsetCache { offsets, last_len })
}

fn line_is_valid(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(s) => matches!(serde_json::from_str::<serde_json::Value>(s), Ok(v) if v.is_object()),
        Err(_) => false,
    }
}

fn rewrite_valid_lines(
    path: &Path,
    data: &[u8],
    offsets: &[u64],
    lengths: &[u64],
) -> Result<()> {
    let tmp_path = path.with_extension("log.tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        for (&offset, &len) in offsets.iter().zip(lengths.iter()) {
            let start = offset as usize;
            let end = start + len as usize;
            tmp.write_all(&data[start..end])?;
        }
        tmp.sync_data()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read every complete, valid line of `path` as a [`Record`], in file
/// order. Used by the Archiver (which needs the whole active log to split
/// into an archived prefix and a retained suffix) and by archive reads.
pub(crate) fn read_all_records(path: &Path) -> Result<Vec<Record>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut buf = String::new();
    loop {
        buf.clear();
        let n = reader.read_line(&mut buf)?;
        if n == 0 {
            break;
        }
        if !buf.ends_with('\n') {
            break; // partial trailing line, crash mid-write
        }
        let line = buf.trim_end_matches('\n');
        if line.is_empty() {
            continue;
        }
        if let Some(record) = Record::from_line(line) {
            records.push(record);
        } else {
            log::warn!("skipping corrupt line while reading {}", path.display());
        }
    }
    Ok(records)
}
