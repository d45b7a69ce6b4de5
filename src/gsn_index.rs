//! The GSN → location index: a fixed-width, append-only binary file
//! mapping each allocated GSN to where its record landed.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const ENTRY_LEN: usize = 18; // u64 gsn + u8 kind + u8 file_id + u64 offset

/// Where a GSN's bytes live: the active log, or a numbered archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// `message.log`.
    Active,
    /// An archive file, identified by `file_id`.
    Archive,
}

impl StorageKind {
    fn to_byte(self) -> u8 {
        match self {
            StorageKind::Active => 0,
            StorageKind::Archive => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(StorageKind::Active),
            1 => Some(StorageKind::Archive),
            _ => None,
        }
    }
}

/// One 18-byte entry: `<u64 gsn><u8 kind><u8 file_id><u64 offset>`.
///
/// `offset` is a line index within the named file, not a byte offset —
/// line index is stable to re-derive from a rewritten file, while a byte
/// offset would need recomputing whenever a preceding line changes length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GsnIndexEntry {
    /// The allocated GSN this entry locates.
    pub gsn: u64,
    /// Active log or archive.
    pub kind: StorageKind,
    /// Archive ordinal; 0 for the active log.
    pub file_id: u8,
    /// Line index within that file.
    pub offset: u64,
}

impl GsnIndexEntry {
    fn to_bytes(self) -> [u8; ENTRY_LEN] {
        let mut buf = [0u8; ENTRY_LEN];
        buf[0..8].copy_from_slice(&self.gsn.to_le_bytes());
        buf[8] = self.kind.to_byte();
        buf[9] = self.file_id;
        buf[10..18].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; ENTRY_LEN]) -> Option<Self> {
        let gsn = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let kind = StorageKind::from_byte(buf[8])?;
        let file_id = buf[9];
        let offset = u64::from_le_bytes(buf[10..18].try_into().unwrap());
        Some(GsnIndexEntry {
            gsn,
            kind,
            file_id,
            offset,
        })
    }
}

/// Append-only binary index of GSN → location (`gsn_index.idx`).
///
/// Entries may go stale after rotation (an entry recorded as
/// `(Active, 0, i)` no longer points at the right line once that record
/// is archived). The index never rewrites stale entries in place — the
/// facade's read path tolerates staleness by verifying the resolved
/// record's own `metadata.gsn` before trusting it.
pub struct GsnIndex {
    path: PathBuf,
    mutex: Mutex<()>,
}

impl GsnIndex {
    /// Open (or create) the index file in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join("gsn_index.idx");
        if !path.exists() {
            File::create(&path)?;
        }
        Ok(GsnIndex {
            path,
            mutex: Mutex::new(()),
        })
    }

    /// Append one entry, fsyncing before returning.
    pub fn append(&self, entry: GsnIndexEntry) -> Result<()> {
        let _guard = self.mutex.lock().expect("gsn_index mutex poisoned");
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.lock_exclusive()?;
        let result = (|| -> Result<()> {
            file.write_all(&entry.to_bytes())?;
            file.sync_data()?;
            Ok(())
        })();
        let _ = FileExt::unlock(&file);
        result
    }

    /// Find the location of `gsn`, if it has been recorded.
    ///
    /// Entries are not guaranteed sorted under concurrent writers, so this
    /// is a linear scan; if corrective entries were appended after
    /// rotation, the most recently appended matching entry wins.
    pub fn lookup(&self, gsn: u64) -> Result<Option<GsnIndexEntry>> {
        let data = fs::read(&self.path)?;
        let mut found = None;
        for chunk in data.chunks_exact(ENTRY_LEN) {
            let bytes: [u8; ENTRY_LEN] = chunk.try_into().unwrap();
            if let Some(entry) = GsnIndexEntry::from_bytes(&bytes) {
                if entry.gsn == gsn {
                    found = Some(entry);
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_lookup_roundtrips() {
        let dir = tempdir().unwrap();
        let index = GsnIndex::open(dir.path()).unwrap();
        index
            .append(GsnIndexEntry {
                gsn: 1,
                kind: StorageKind::Active,
                file_id: 0,
                offset: 0,
            })
            .unwrap();
        index
            .append(GsnIndexEntry {
                gsn: 2,
                kind: StorageKind::Active,
                file_id: 0,
                offset: 1,
            })
            .unwrap();

        let found = index.lookup(2).unwrap().unwrap();
        assert_eq!(found.offset, 1);
        assert_eq!(found.kind, StorageKind::Active);
    }

    #[test]
    fn lookup_missing_gsn_returns_none() {
        let dir = tempdir().unwrap();
        let index = GsnIndex::open(dir.path()).unwrap();
        assert!(index.lookup(99).unwrap().is_none());
    }

    #[test]
    fn later_corrective_entry_wins_on_lookup() {
        let dir = tempdir().unwrap();
        let index = GsnIndex::open(dir.path()).unwrap();
        index
            .append(GsnIndexEntry {
                gsn: 5,
                kind: StorageKind::Active,
                file_id: 0,
                offset: 5,
            })
            .unwrap();
        // Rotation moved gsn 5 into the first archive, at line 0.
        index
            .append(GsnIndexEntry {
                gsn: 5,
                kind: StorageKind::Archive,
                file_id: 0,
                offset: 0,
            })
            .unwrap();

        let found = index.lookup(5).unwrap().unwrap();
        assert_eq!(found.kind, StorageKind::Archive);
        assert_eq!(found.offset, 0);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let index = GsnIndex::open(dir.path()).unwrap();
            index
                .append(GsnIndexEntry {
                    gsn: 1,
                    kind: StorageKind::Active,
                    file_id: 0,
                    offset: 0,
                })
                .unwrap();
        }
        let index = GsnIndex::open(dir.path()).unwrap();
        assert!(index.lookup(1).unwrap().is_some());
    }
}
