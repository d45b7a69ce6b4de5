//! The composed, per-project read/write/notification API.

use crate::archive::{self, RotationConfig};
use crate::error::{HistoryError, Result};
use crate::gsn::GsnAllocator;
use crate::gsn_index::{GsnIndex, GsnIndexEntry, StorageKind};
use crate::log_file::LogFile;
use crate::notify::{Notifier, RecordAppended, Subscription};
use crate::record::Record;
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Outcome of [`HistoryFacade::wait_for_gsn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The current GSN had already advanced past the one waited on.
    NewData(u64),
    /// No append happened before the timeout elapsed.
    Timeout,
}

/// Per `(workspace, project)` handle composing a [`LogFile`], the rotation
/// configuration, a [`GsnAllocator`], a [`GsnIndex`], and a
/// `record_appended` [`Notifier`].
///
/// Thread-safe: all operations take `&self`. Obtain one via
/// [`HistoryFacade::builder`] directly, or through a [`crate::Registry`]
/// for a process-wide cache of facades.
pub struct HistoryFacade {
    workspace: String,
    project: String,
    dir: PathBuf,
    log_file: LogFile,
    gsn: GsnAllocator,
    gsn_index: GsnIndex,
    rotation: RotationConfig,
    notifier: Arc<Notifier>,
}

/// Configures and opens a [`HistoryFacade`].
pub struct HistoryFacadeBuilder {
    workspace: String,
    project: String,
    dir: PathBuf,
    rotation: RotationConfig,
}

impl HistoryFacadeBuilder {
    /// Maximum active-log record count before auto-rotation triggers.
    /// Default 200.
    pub fn max_records(mut self, value: u64) -> Self {
        self.rotation.max_records = value;
        self
    }

    /// Number of oldest records moved per rotation. Default 100.
    pub fn archive_batch(mut self, value: u64) -> Self {
        self.rotation.archive_batch = value;
        self
    }

    /// Open (or create) the facade's directory structure.
    pub fn open(self) -> Result<HistoryFacade> {
        let log_file = LogFile::open(&self.dir)?;
        let gsn = GsnAllocator::open(&self.dir)?;
        let gsn_index = GsnIndex::open(&self.dir)?;
        Ok(HistoryFacade {
            workspace: self.workspace,
            project: self.project,
            dir: self.dir,
            log_file,
            gsn,
            gsn_index,
            rotation: self.rotation,
            notifier: Notifier::new(),
        })
    }
}

impl HistoryFacade {
    /// Start building a facade rooted at
    /// `<workspace>/projects/<project>/agent/history/`.
    pub fn builder(workspace: impl Into<String>, project: impl Into<String>) -> HistoryFacadeBuilder {
        let workspace = workspace.into();
        let project = project.into();
        let dir = Path::new(&workspace)
            .join("projects")
            .join(&project)
            .join("agent")
            .join("history");
        HistoryFacadeBuilder {
            workspace,
            project,
            dir,
            rotation: RotationConfig::default(),
        }
    }

    /// Open (or create) a facade with default rotation thresholds.
    pub fn open(workspace: impl Into<String>, project: impl Into<String>) -> Result<Self> {
        Self::builder(workspace, project).open()
    }

    /// Stamp `metadata.gsn`, append the record, index it, and publish
    /// `record_appended`. Returns `(gsn, current_gsn)`.
    pub fn append(&self, record: Record) -> Result<(u64, u64)> {
        let gsn = self.gsn.next()?;
        let stamped = record.stamped(gsn);
        let message_id = stamped.message_id().map(str::to_string);

        let outcome = self.log_file.append(&stamped, Some(&self.rotation))?;

        self.gsn_index.append(GsnIndexEntry {
            gsn,
            kind: StorageKind::Active,
            file_id: 0,
            offset: outcome.line_index as u64,
        })?;

        if let Some(rotation) = &outcome.rotation {
            // The just-rotated batch moved from the active log into a new
            // archive; write corrective entries so lookups of their GSNs
            // stop pointing at stale active-log offsets.
            let archives_count = archive::list_archives(&self.dir)?.len();
            let file_id = (archives_count - 1) as u8;
            for (archive_offset, archived_gsn) in rotation.archived_gsns.iter().enumerate() {
                self.gsn_index.append(GsnIndexEntry {
                    gsn: *archived_gsn,
                    kind: StorageKind::Archive,
                    file_id,
                    offset: archive_offset as u64,
                })?;
            }
        }

        let current_gsn = self.gsn.current()?;
        self.notifier.publish(&RecordAppended {
            workspace: self.workspace.clone(),
            project: self.project.clone(),
            message_id,
            gsn,
            current_gsn,
        });

        Ok((gsn, current_gsn))
    }

    /// Register a `record_appended` subscriber. Dropping the returned
    /// handle unsubscribes it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RecordAppended) + Send + Sync + 'static,
    {
        self.notifier.subscribe(callback)
    }

    /// The `n` most recent records, newest-first.
    pub fn latest(&self, n: usize) -> Result<Vec<Record>> {
        self.log_file.get_latest(n)
    }

    /// Up to `n` records at or after active-log line index `offset`,
    /// oldest-first.
    pub fn after_offset(&self, offset: usize, n: usize) -> Result<Vec<Record>> {
        self.log_file.get_range(offset, n)
    }

    /// Up to `n` records strictly before active-log line index `offset`,
    /// oldest-first. Falls back to archives (newest archive first) when
    /// the active log alone can't supply `n`.
    pub fn before_offset(&self, offset: usize, n: usize) -> Result<Vec<Record>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let active_available = offset.min(self.log_file.count());
        let mut from_active = self.log_file.get_range(0, active_available)?;
        if from_active.len() > n {
            let skip = from_active.len() - n;
            from_active = from_active.split_off(skip);
        }

        if from_active.len() >= n {
            return Ok(from_active);
        }

        let needed = n - from_active.len();
        let mut from_archives: Vec<Record> = Vec::new();
        for archive_path in archive::list_archives(&self.dir)? {
            if from_archives.len() >= needed {
                break;
            }
            let records = archive::read_archive_records(&archive_path)?;
            let take = needed - from_archives.len();
            let start = records.len().saturating_sub(take);
            let mut suffix = records[start..].to_vec();
            suffix.append(&mut from_archives);
            from_archives = suffix;
        }

        from_archives.append(&mut from_active);
        Ok(from_archives)
    }

    /// Records with `metadata.gsn > last_seen_gsn`, ascending by GSN,
    /// deduplicated by `message_id`. Empty if `last_seen_gsn` already
    /// equals [`current_gsn`](Self::current_gsn).
    pub fn after_gsn(&self, last_seen_gsn: u64, n: usize) -> Result<Vec<Record>> {
        let current = self.current_gsn()?;
        if n == 0 || current <= last_seen_gsn {
            return Ok(Vec::new());
        }

        let want = n.min((current - last_seen_gsn) as usize);
        let total = self.log_file.count();
        let tail_start = total.saturating_sub(n.max(want));
        let mut results: Vec<Record> = self
            .log_file
            .get_range(tail_start, total - tail_start)?
            .into_iter()
            .filter(|r| r.gsn().is_some_and(|g| g > last_seen_gsn))
            .collect();

        if results.len() < want {
            for archive_path in archive::list_archives(&self.dir)?.into_iter().take(3) {
                if results.len() >= want {
                    break;
                }
                let mut older: Vec<Record> = archive::read_archive_records(&archive_path)?
                    .into_iter()
                    .filter(|r| r.gsn().is_some_and(|g| g > last_seen_gsn))
                    .collect();
                older.extend(results);
                results = older;
            }
        }

        dedupe_and_sort_ascending(&mut results);
        results.truncate(n);
        Ok(results)
    }

    /// Records with `metadata.gsn < max_gsn`, ascending by GSN,
    /// deduplicated by `message_id`. Symmetric to
    /// [`after_gsn`](Self::after_gsn) for backward scroll.
    pub fn before_gsn(&self, max_gsn: u64, n: usize) -> Result<Vec<Record>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let total = self.log_file.count();
        let mut results: Vec<Record> = self
            .log_file
            .get_range(0, total)?
            .into_iter()
            .filter(|r| r.gsn().is_some_and(|g| g < max_gsn))
            .collect();

        if results.len() < n {
            for archive_path in archive::list_archives(&self.dir)? {
                if results.len() >= n {
                    break;
                }
                let mut older: Vec<Record> = archive::read_archive_records(&archive_path)?
                    .into_iter()
                    .filter(|r| r.gsn().is_some_and(|g| g < max_gsn))
                    .collect();
                older.append(&mut results);
                results = older;
            }
        }

        dedupe_and_sort_ascending(&mut results);
        if results.len() > n {
            let skip = results.len() - n;
            results = results.split_off(skip);
        }
        Ok(results)
    }

    /// Total record count across the active log and all archives.
    pub fn total_count(&self) -> Result<usize> {
        let mut total = self.log_file.count();
        for archive_path in archive::list_archives(&self.dir)? {
            total += archive::count_archive_records(&archive_path)?;
        }
        Ok(total)
    }

    /// The allocator's current GSN (0 before any append).
    pub fn current_gsn(&self) -> Result<u64> {
        self.gsn.current()
    }

    /// Whether an append has landed since `last_seen_gsn`, without
    /// rescanning the log — a cheap poll for a UI or another process
    /// sharing this facade's directory.
    pub fn has_new_records(&self, last_seen_gsn: u64) -> Result<bool> {
        Ok(self.current_gsn()? > last_seen_gsn)
    }

    /// Block the calling thread until an append lands after `last_seen_gsn`
    /// or `timeout` elapses, using OS-level file system notifications on
    /// this facade's directory rather than polling.
    ///
    /// Complements [`subscribe`](Self::subscribe): that contract only
    /// reaches in-process subscribers of the facade that performed the
    /// append; this one works across processes sharing the same directory.
    pub fn wait_for_gsn(&self, last_seen_gsn: u64, timeout: Duration) -> Result<WaitOutcome> {
        if self.has_new_records(last_seen_gsn)? {
            return Ok(WaitOutcome::NewData(self.current_gsn()?));
        }

        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        let _ = tx.send(());
                    }
                }
            },
        )
        .map_err(|e| HistoryError::Io(io::Error::other(e)))?;

        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|e| HistoryError::Io(io::Error::other(e)))?;

        // Re-check after the watcher is armed to close the race between
        // the first check above and `watch` taking effect.
        if self.has_new_records(last_seen_gsn)? {
            return Ok(WaitOutcome::NewData(self.current_gsn()?));
        }

        match rx.recv_timeout(timeout) {
            Ok(()) => Ok(WaitOutcome::NewData(self.current_gsn()?)),
            Err(_) => Ok(WaitOutcome::Timeout),
        }
    }

    /// Resolve a GSN to its record via the index, verifying the resolved
    /// line's own `metadata.gsn` before trusting a possibly-stale entry.
    /// Falls back to `None` if the index has no entry, or if the entry no
    /// longer resolves to a matching record.
    pub fn resolve_gsn(&self, gsn: u64) -> Result<Option<Record>> {
        let Some(entry) = self.gsn_index.lookup(gsn)? else {
            return Ok(None);
        };

        let candidate = match entry.kind {
            StorageKind::Active => self
                .log_file
                .get_range(entry.offset as usize, 1)?
                .into_iter()
                .next(),
            StorageKind::Archive => {
                let archives = archive::list_archives(&self.dir)?;
                // file_id counts archives oldest-first by creation, but
                // archives are listed newest-first; index from the end.
                let idx = archives.len().checked_sub(1 + entry.file_id as usize);
                match idx.and_then(|i| archives.get(i)) {
                    Some(path) => archive::read_archive_records(path)?
                        .into_iter()
                        .nth(entry.offset as usize),
                    None => None,
                }
            }
        };

        Ok(candidate.filter(|record| record.gsn() == Some(gsn)))
    }

    /// Rescan the archive directory and rebuild the active-log offset
    /// cache. Used after an external tool modifies files out of band.
    pub fn invalidate_caches(&self) -> Result<()> {
        self.log_file.invalidate_cache()
    }

    /// Path to this facade's data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The workspace this facade was opened for.
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// The project this facade was opened for.
    pub fn project(&self) -> &str {
        &self.project
    }
}

fn dedupe_and_sort_ascending(records: &mut Vec<Record>) {
    records.sort_by_key(|r| r.gsn().unwrap_or(0));
    let mut seen_ids = HashSet::new();
    records.retain(|r| match r.message_id() {
        Some(id) => seen_ids.insert(id.to_string()),
        None => true,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn facade(dir: &Path) -> HistoryFacade {
        HistoryFacade::builder(
            dir.join("ws").to_string_lossy().to_string(),
            "proj".to_string(),
        )
        .open()
        .unwrap()
    }

    fn facade_with_thresholds(dir: &Path, max_records: u64, archive_batch: u64) -> HistoryFacade {
        HistoryFacade::builder(
            dir.join("ws").to_string_lossy().to_string(),
            "proj".to_string(),
        )
        .max_records(max_records)
        .archive_batch(archive_batch)
        .open()
        .unwrap()
    }

    // S1 — empty open.
    #[test]
    fn s1_empty_open() {
        let dir = tempdir().unwrap();
        let f = facade(dir.path());
        assert_eq!(f.total_count().unwrap(), 0);
        assert_eq!(f.current_gsn().unwrap(), 0);
        assert!(f.latest(10).unwrap().is_empty());
        assert!(f.after_gsn(0, 10).unwrap().is_empty());
    }

    // S2 — three appends.
    #[test]
    fn s2_three_appends() {
        let dir = tempdir().unwrap();
        let f = facade(dir.path());

        let (g1, _) = f.append(Record::new(json!({"msg": "a"})).unwrap()).unwrap();
        let (g2, _) = f.append(Record::new(json!({"msg": "b"})).unwrap()).unwrap();
        let (g3, c3) = f.append(Record::new(json!({"msg": "c"})).unwrap()).unwrap();

        assert_eq!((g1, g2, g3), (1, 2, 3));
        assert_eq!(c3, 3);
        assert_eq!(f.current_gsn().unwrap(), 3);

        let latest = f.latest(2).unwrap();
        assert_eq!(latest[0].as_value()["msg"], "c");
        assert_eq!(latest[1].as_value()["msg"], "b");

        let after = f.after_gsn(1, 10).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].as_value()["msg"], "b");
        assert_eq!(after[0].gsn(), Some(2));
        assert_eq!(after[1].as_value()["msg"], "c");
        assert_eq!(after[1].gsn(), Some(3));
    }

    // S3 — rotation at threshold.
    #[test]
    fn s3_rotation_at_threshold() {
        let dir = tempdir().unwrap();
        let f = facade_with_thresholds(dir.path(), 10, 5);

        for i in 0..10 {
            f.append(Record::new(json!({"i": i})).unwrap()).unwrap();
        }
        f.append(Record::new(json!({"i": 10})).unwrap()).unwrap();

        let archives = archive::list_archives(&f.dir).unwrap();
        assert_eq!(archives.len(), 1);
        let archived = archive::read_archive_records(&archives[0]).unwrap();
        assert_eq!(archived.len(), 5);
        assert_eq!(archived[0].gsn(), Some(1));
        assert_eq!(archived[4].gsn(), Some(5));

        assert_eq!(f.log_file.count(), 6);
        assert_eq!(f.total_count().unwrap(), 11);

        let latest = f.latest(3).unwrap();
        let gsns: Vec<_> = latest.iter().map(|r| r.gsn().unwrap()).collect();
        assert_eq!(gsns, vec![11, 10, 9]);
    }

    // S4 — crash recovery.
    #[test]
    fn s4_crash_recovery() {
        use std::fs::OpenOptions;
        use std::io::Write;

        let dir = tempdir().unwrap();
        {
            let f = facade(dir.path());
            f.append(Record::new(json!({"msg": "ok"})).unwrap()).unwrap();
        }

        let log_path = dir.path().join("ws/projects/proj/agent/history/message.log");
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        write!(file, "{{\"msg\":\"bad\"").unwrap();
        drop(file);

        let f = facade(dir.path());
        assert_eq!(f.total_count().unwrap(), 1);
        assert_eq!(f.current_gsn().unwrap(), 1);

        let (gsn, _) = f.append(Record::new(json!({"msg": "next"})).unwrap()).unwrap();
        assert_eq!(gsn, 2);
    }

    // S6 — archive-aware backscroll.
    #[test]
    fn s6_archive_aware_backscroll() {
        let dir = tempdir().unwrap();
        let f = facade_with_thresholds(dir.path(), 10, 5);

        for i in 1..=23 {
            f.append(Record::new(json!({"i": i})).unwrap()).unwrap();
        }

        let archives = archive::list_archives(&f.dir).unwrap();
        assert_eq!(archives.len(), 3);
        assert_eq!(f.log_file.count(), 8);

        let records = f.before_gsn(15, 6).unwrap();
        let gsns: Vec<_> = records.iter().map(|r| r.gsn().unwrap()).collect();
        assert_eq!(gsns, vec![9, 10, 11, 12, 13, 14]);
    }

    #[test]
    fn resolve_gsn_tolerates_rotation() {
        let dir = tempdir().unwrap();
        let f = facade_with_thresholds(dir.path(), 10, 5);
        for i in 1..=11 {
            f.append(Record::new(json!({"i": i})).unwrap()).unwrap();
        }
        // gsn 1 was archived by the rotation triggered at the 10th append.
        let record = f.resolve_gsn(1).unwrap().unwrap();
        assert_eq!(record.as_value()["i"], 1);
    }

    #[test]
    fn append_rejects_non_object_record() {
        assert!(Record::new(json!([1, 2])).is_err());
    }

    #[test]
    fn notifier_fires_after_durable_append() {
        let dir = tempdir().unwrap();
        let f = facade(dir.path());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = f.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event.gsn);
        });

        f.append(Record::new(json!({"msg": "a"})).unwrap()).unwrap();
        f.append(Record::new(json!({"msg": "b"})).unwrap()).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn wait_for_gsn_times_out_with_no_append() {
        let dir = tempdir().unwrap();
        let f = facade(dir.path());
        let outcome = f.wait_for_gsn(0, Duration::from_millis(100)).unwrap();
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[test]
    fn wait_for_gsn_wakes_on_append_from_another_thread() {
        use std::thread;

        let dir = tempdir().unwrap();
        let f = Arc::new(facade(dir.path()));
        let writer = Arc::clone(&f);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer
                .append(Record::new(json!({"msg": "a"})).unwrap())
                .unwrap();
        });

        let outcome = f.wait_for_gsn(0, Duration::from_secs(5)).unwrap();
        assert_eq!(outcome, WaitOutcome::NewData(1));
    }

    #[test]
    fn has_new_records_reflects_current_gsn() {
        let dir = tempdir().unwrap();
        let f = facade(dir.path());
        assert!(!f.has_new_records(0).unwrap());
        f.append(Record::new(json!({"msg": "a"})).unwrap()).unwrap();
        assert!(f.has_new_records(0).unwrap());
        assert!(!f.has_new_records(1).unwrap());
    }
}
