//! # mailstash-core
//!
//! Offline folder storage and synchronization engine for the mailstash
//! email client.
//!
//! This crate provides:
//! - Block-structured header and body storage with a persisted directory
//! - Accuracy-range bookkeeping of which time spans are synchronized
//! - Date-range synchronization with bisection of dense windows
//! - Live slice views over folder contents with change notifications
//! - A do/undo mutation queue that applies locally first, then remotely
//! - Storage purging bounded by staleness and a hard block cap
//!
//! Storage is protocol-agnostic: the engine drives an abstract
//! [`RemoteFolder`] capability and persists through an abstract
//! [`BlockPersist`] substrate.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod accuracy;
pub mod block;
pub mod config;
pub mod date;
mod error;
pub mod folder;
pub mod ops;
pub mod persist;
pub mod records;
pub mod remote;
pub mod slice;
pub mod sync;

pub use accuracy::{AccuracyRange, AccuracyTracker, FullSync, RefreshSpan};
pub use block::{BlockInfo, FolderBlockStore, PurgeReport};
pub use config::SyncConfig;
pub use date::TimestampMs;
pub use error::{Error, Result};
pub use folder::{Folder, FolderGuard, FolderState};
pub use ops::{
    Lifecycle, LocalStatus, LongtermId, OpKind, OpOutcome, OpTarget, Operation, OperationQueue,
    ServerStatus,
};
pub use persist::{BlockPersist, CommitBatch, FolderStateSnapshot, MemoryPersist};
pub use records::{
    BlockId, BlockedRecord, BodyRecord, BodyRep, FolderId, HeaderRecord, MessageId, MessageKey,
    PartInfo, Suid,
};
pub use remote::{RemoteBody, RemoteFolder, RemoteHeader};
pub use slice::{NotificationSink, SliceEvent, SliceId, SliceRegistry, SliceStatus};
pub use sync::{GrowDirection, SyncEngine, SyncStats};
