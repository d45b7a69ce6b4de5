#![warn(missing_docs)]

//! # message-history-store
//!
//! A durable, append-only message-log store for chat/agent conversation
//! history: one active log per `(workspace, project)`, byte-offset indexed
//! for O(1) seeks, with threshold-triggered archive rotation and a
//! Global Sequence Number allocator for order-stable reads across rotation
//! boundaries.
//!
//! ## Quick Start
//!
//! ```
//! # use tempfile::tempdir;
//! use history_store::{HistoryFacade, Record};
//! use serde_json::json;
//!
//! # let dir = tempdir().unwrap();
//! let workspace = dir.path().to_string_lossy().to_string();
//! let history = HistoryFacade::open(workspace, "demo-project").unwrap();
//!
//! let (gsn, _current) = history
//!     .append(Record::new(json!({"role": "user", "content": "hi"})).unwrap())
//!     .unwrap();
//! assert_eq!(gsn, 1);
//!
//! let latest = history.latest(10).unwrap();
//! assert_eq!(latest.len(), 1);
//! ```
//!
//! ## Core Concepts
//!
//! - **Records** are opaque JSON objects appended to the active log
//!   (`message.log`), one per line, stamped with a GSN on write.
//! - **Rotation** moves the oldest records into a timestamped archive file
//!   once the active log crosses a configurable size threshold, under the
//!   same lock that guards appends.
//! - **The GSN allocator** hands out a monotonic counter independent of
//!   rotation, so callers can page through history by sequence number
//!   without caring which file a record physically lives in.
//! - **`record_appended`** notifies subscribers synchronously, after each
//!   append is durable on disk.

mod archive;
mod error;
mod facade;
mod gsn;
mod gsn_index;
mod log_file;
mod notify;
mod record;
mod registry;

pub use archive::{list_archives, read_archive_records, RotationConfig, RotationOutcome};
pub use error::{HistoryError, Result};
pub use facade::{HistoryFacade, HistoryFacadeBuilder, WaitOutcome};
pub use gsn::GsnAllocator;
pub use gsn_index::{GsnIndex, GsnIndexEntry, StorageKind};
pub use log_file::{AppendOutcome, LogFile};
pub use notify::{Notifier, RecordAppended, Subscription};
pub use record::Record;
pub use registry::Registry;
