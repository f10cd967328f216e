//! The pluggable persistence substrate for block storage.
//!
//! The engine never talks to a database directly; it loads block payloads
//! on demand and hands the substrate one atomic [`CommitBatch`] per mutex
//! release. The substrate is free to represent blocks however it likes as
//! long as a persist/reload cycle gives back what was committed.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::accuracy::AccuracyRange;
use crate::block::BlockInfo;
use crate::date::TimestampMs;
use crate::error::{Error, Result};
use crate::records::{BlockId, BodyRecord, FolderId, HeaderRecord};

/// Durable per-folder metadata: directory entries, accuracy ranges, and
/// counters. Block payloads are stored separately and loaded lazily.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderStateSnapshot {
    /// Header block directory entries, newest-first.
    pub header_infos: Vec<BlockInfo>,
    /// Body block directory entries, newest-first.
    pub body_infos: Vec<BlockInfo>,
    /// Accuracy ranges, newest-first.
    pub accuracy: Vec<AccuracyRange>,
    /// Next folder-local message id to issue.
    pub next_header_id: u64,
    /// Next header block id to issue.
    pub next_header_block_id: u64,
    /// Next body block id to issue.
    pub next_body_block_id: u64,
    /// When the folder last completed a sync, client clock.
    pub last_synced_at: Option<TimestampMs>,
}

/// Everything that changed since the last commit, applied atomically.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    /// Folder the batch belongs to.
    pub folder: FolderId,
    /// Header blocks to write (full payloads).
    pub dirty_header_blocks: Vec<(BlockId, Vec<HeaderRecord>)>,
    /// Body blocks to write (full payloads).
    pub dirty_body_blocks: Vec<(BlockId, Vec<BodyRecord>)>,
    /// Header blocks to delete.
    pub deleted_header_blocks: Vec<BlockId>,
    /// Body blocks to delete.
    pub deleted_body_blocks: Vec<BlockId>,
    /// The folder metadata as of this batch.
    pub snapshot: FolderStateSnapshot,
}

impl CommitBatch {
    /// True when the batch carries no block changes (the snapshot alone is
    /// not worth a write).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirty_header_blocks.is_empty()
            && self.dirty_body_blocks.is_empty()
            && self.deleted_header_blocks.is_empty()
            && self.deleted_body_blocks.is_empty()
    }
}

/// Asynchronous block persistence.
#[allow(async_fn_in_trait)]
pub trait BlockPersist: Send + Sync {
    /// Load a header block's records, newest-first.
    ///
    /// # Errors
    ///
    /// [`Error::MissingBlock`] when the block does not exist; substrate
    /// errors as [`Error::Persist`].
    async fn load_header_block(&self, folder: FolderId, block: BlockId)
    -> Result<Vec<HeaderRecord>>;

    /// Load a body block's records, newest-first.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`Self::load_header_block`].
    async fn load_body_block(&self, folder: FolderId, block: BlockId) -> Result<Vec<BodyRecord>>;

    /// Apply a commit batch as a single atomic write.
    ///
    /// # Errors
    ///
    /// Substrate failures as [`Error::Persist`]; a failed commit must leave
    /// the previously committed state intact.
    async fn commit(&self, batch: CommitBatch) -> Result<()>;

    /// Load the folder metadata snapshot, or `None` for a never-seen
    /// folder.
    ///
    /// # Errors
    ///
    /// Substrate failures as [`Error::Persist`].
    async fn load_folder_state(&self, folder: FolderId) -> Result<Option<FolderStateSnapshot>>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    header_blocks: HashMap<(FolderId, BlockId), Vec<HeaderRecord>>,
    body_blocks: HashMap<(FolderId, BlockId), Vec<BodyRecord>>,
    snapshots: HashMap<FolderId, FolderStateSnapshot>,
    commits: u64,
    loads: u64,
}

/// In-memory substrate for tests and ephemeral profiles.
#[derive(Debug, Default)]
pub struct MemoryPersist {
    inner: Mutex<MemoryInner>,
}

impl MemoryPersist {
    /// Create an empty in-memory substrate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commit batches applied so far.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.lock().commits
    }

    /// Number of block loads served so far.
    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.lock().loads
    }

    /// Number of stored header blocks for a folder.
    #[must_use]
    pub fn header_block_count(&self, folder: FolderId) -> usize {
        self.lock()
            .header_blocks
            .keys()
            .filter(|(f, _)| *f == folder)
            .count()
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // Poisoning only happens if a test already panicked.
        self.inner.lock().unwrap()
    }
}

impl BlockPersist for MemoryPersist {
    async fn load_header_block(
        &self,
        folder: FolderId,
        block: BlockId,
    ) -> Result<Vec<HeaderRecord>> {
        let mut inner = self.lock();
        inner.loads += 1;
        inner
            .header_blocks
            .get(&(folder, block))
            .cloned()
            .ok_or(Error::MissingBlock { folder, block })
    }

    async fn load_body_block(&self, folder: FolderId, block: BlockId) -> Result<Vec<BodyRecord>> {
        let mut inner = self.lock();
        inner.loads += 1;
        inner
            .body_blocks
            .get(&(folder, block))
            .cloned()
            .ok_or(Error::MissingBlock { folder, block })
    }

    async fn commit(&self, batch: CommitBatch) -> Result<()> {
        let mut inner = self.lock();
        inner.commits += 1;
        for (block, records) in batch.dirty_header_blocks {
            inner.header_blocks.insert((batch.folder, block), records);
        }
        for (block, records) in batch.dirty_body_blocks {
            inner.body_blocks.insert((batch.folder, block), records);
        }
        for block in batch.deleted_header_blocks {
            inner.header_blocks.remove(&(batch.folder, block));
        }
        for block in batch.deleted_body_blocks {
            inner.body_blocks.remove(&(batch.folder, block));
        }
        inner.snapshots.insert(batch.folder, batch.snapshot);
        Ok(())
    }

    async fn load_folder_state(&self, folder: FolderId) -> Result<Option<FolderStateSnapshot>> {
        Ok(self.lock().snapshots.get(&folder).cloned())
    }
}
