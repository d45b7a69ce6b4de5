//! Rotation of the active log into timestamped archive files.

use crate::error::Result;
use crate::log_file::read_all_records;
use crate::record::Record;
use chrono::Local;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Tunable thresholds for auto-rotation.
///
/// Defaults match spec: `MAX_RECORDS = 200`, `ARCHIVE_BATCH = 100`.
#[derive(Debug, Clone, Copy)]
pub struct RotationConfig {
    /// Active log is rotated once it holds at least this many records.
    pub max_records: u64,
    /// Number of oldest records moved into a new archive per rotation.
    pub archive_batch: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            max_records: 200,
            archive_batch: 100,
        }
    }
}

/// Result of a single rotation.
#[derive(Debug, Clone)]
pub struct RotationOutcome {
    /// Path of the newly created archive file.
    pub archive_path: PathBuf,
    /// Number of records moved into the archive.
    pub archived_count: usize,
    /// GSNs of the moved records, in their new (archive-file) order, for
    /// the caller to write corrective GSN-index entries with.
    pub archived_gsns: Vec<u64>,
}

/// Rotate the oldest `archive_batch` records of `log_path` into a new
/// archive file under `dir`, then rewrite `log_path` to hold only the
/// remaining records.
///
/// Runs under the caller's already-held file lock — rotation and append
/// must never interleave. No-op (`Ok(None)`) if the log is empty.
pub(crate) fn rotate(log_path: &Path, dir: &Path, archive_batch: u64) -> Result<Option<RotationOutcome>> {
    let records = read_all_records(log_path)?;
    if records.is_empty() {
        return Ok(None);
    }

    let batch = (archive_batch as usize).min(records.len());
    let (to_archive, remaining) = records.split_at(batch);

    let archive_path = dir.join(archive_filename());
    write_records(&archive_path, to_archive, /*create_new*/ true)?;

    let tmp_path = log_path.with_extension("log.tmp");
    write_records(&tmp_path, remaining, /*create_new*/ true)?;
    fs::rename(&tmp_path, log_path)?;

    Ok(Some(RotationOutcome {
        archive_path,
        archived_count: to_archive.len(),
        archived_gsns: to_archive.iter().map(|r| r.gsn().unwrap_or(0)).collect(),
    }))
}

fn write_records(path: &Path, records: &[Record], create_new: bool) -> Result<()> {
    let mut file = if create_new {
        File::create(path)?
    } else {
        std::fs::OpenOptions::new().append(true).open(path)?
    };
    for record in records {
        let line = record.to_line()?;
        writeln!(file, "{line}")?;
    }
    file.sync_data()?;
    Ok(())
}

/// `history_YYYY_MM_DD_HH_MM_SS_mmm.log`, local time, millisecond precision.
fn archive_filename() -> String {
    let now = Local::now();
    format!("history_{}.log", now.format("%Y_%m_%d_%H_%M_%S_%3f"))
}

/// List archive files in `dir`, sorted newest-first by modification time.
pub fn list_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut archives = Vec::new();
    if !dir.exists() {
        return Ok(archives);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("history_") && name.ends_with(".log") {
            archives.push(entry.path());
        }
    }
    archives.sort_by_key(|path| {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });
    archives.reverse(); // newest first
    Ok(archives)
}

/// Read every record out of a single archive file, in on-disk order
/// (oldest-first within that archive).
pub fn read_archive_records(path: &Path) -> Result<Vec<Record>> {
    read_all_records(path)
}

/// Number of records an archive file holds, without materialising them.
pub fn count_archive_records(path: &Path) -> Result<usize> {
    Ok(read_all_records(path)?.len())
}
