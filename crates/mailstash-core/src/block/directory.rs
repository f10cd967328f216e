//! Generic block directory: the sorted list of block descriptors plus the
//! in-memory cache of loaded block payloads.
//!
//! Header and body records share identical insertion-with-split and
//! deletion machinery, so the directory is generic over any
//! [`BlockedRecord`]. Directory entries are kept newest-block-first and are
//! contiguous and non-overlapping in `(date, id)` space; records within a
//! cached block are kept newest-first as well.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::records::{BlockId, BlockedRecord, MessageKey};

/// Descriptor of one block: its id, key bounds, and size accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Identifier used by the persistence substrate.
    pub block_id: BlockId,
    /// Key of the chronologically oldest record in the block.
    pub start: MessageKey,
    /// Key of the chronologically newest record in the block.
    pub end: MessageKey,
    /// Number of records.
    pub count: u32,
    /// Estimated serialized byte size.
    pub est_size: u32,
}

impl BlockInfo {
    /// Whether `key` falls inside this block's bounds (inclusive).
    #[must_use]
    pub fn contains(&self, key: MessageKey) -> bool {
        self.start <= key && key <= self.end
    }

    /// Whether this block's key range intersects `[start, end]` (both
    /// inclusive, tuple-range semantics).
    #[must_use]
    pub fn intersects(&self, start: MessageKey, end: MessageKey) -> bool {
        !(self.end < start || self.start > end)
    }
}

/// Split tuning shared by header and body directories.
#[derive(Debug, Clone, Copy)]
pub struct BlockBudget {
    /// Maximum estimated block size before a split.
    pub max_block_size: u32,
    /// Newer-half byte share when splitting the newest block.
    pub split_small_part: f64,
    /// Newer-half byte share when splitting the oldest block.
    pub split_large_part: f64,
    /// Newer-half byte share when splitting an interior block.
    pub split_equal_part: f64,
}

impl BlockBudget {
    /// Budget from the folder sync configuration.
    #[must_use]
    pub const fn from_config(config: &crate::config::SyncConfig) -> Self {
        Self {
            max_block_size: config.max_block_size,
            split_small_part: config.block_split_small_part,
            split_large_part: config.block_split_large_part,
            split_equal_part: config.block_split_equal_part,
        }
    }
}

/// Where an insertion will land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertSlot {
    /// Index into the directory's info list.
    pub index: usize,
    /// The block at that index.
    pub block_id: BlockId,
    /// True when a fresh singleton block was created for this insertion
    /// (it is already cached empty; no load is required).
    pub created: bool,
}

/// Result of applying an insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Block that finally holds the record (may be the split-off half).
    pub block_id: BlockId,
    /// Newly created older half, when the insertion forced a split.
    pub split_off: Option<BlockId>,
}

/// Result of applying a deletion.
#[derive(Debug)]
pub struct DeleteOutcome<T> {
    /// Block the record was removed from.
    pub block_id: BlockId,
    /// True when the block became empty and its directory entry was
    /// dropped.
    pub emptied: bool,
    /// The removed record, for undo bookkeeping.
    pub removed: T,
}

/// The sorted block descriptor list plus payload cache for one record kind.
#[derive(Debug)]
pub struct BlockDirectory<T> {
    budget: BlockBudget,
    infos: Vec<BlockInfo>,
    cache: HashMap<BlockId, Vec<T>>,
    dirty: HashSet<BlockId>,
    deleted: Vec<BlockId>,
    next_block_id: u64,
}

impl<T: BlockedRecord> BlockDirectory<T> {
    /// Create an empty directory.
    #[must_use]
    pub fn new(budget: BlockBudget) -> Self {
        Self {
            budget,
            infos: Vec::new(),
            cache: HashMap::new(),
            dirty: HashSet::new(),
            deleted: Vec::new(),
            next_block_id: 1,
        }
    }

    /// Rebuild from persisted directory state. Payloads load lazily.
    #[must_use]
    pub fn from_snapshot(budget: BlockBudget, infos: Vec<BlockInfo>, next_block_id: u64) -> Self {
        Self {
            budget,
            infos,
            cache: HashMap::new(),
            dirty: HashSet::new(),
            deleted: Vec::new(),
            next_block_id,
        }
    }

    /// Directory entries, newest-first.
    #[must_use]
    pub fn infos(&self) -> &[BlockInfo] {
        &self.infos
    }

    /// Counter for persistence snapshots.
    #[must_use]
    pub const fn next_block_id(&self) -> u64 {
        self.next_block_id
    }

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.infos.len()
    }

    /// Total record count across all blocks.
    #[must_use]
    pub fn total_count(&self) -> u32 {
        self.infos.iter().map(|info| info.count).sum()
    }

    /// Key of the newest known record, if any.
    #[must_use]
    pub fn newest_key(&self) -> Option<MessageKey> {
        self.infos.first().map(|info| info.end)
    }

    /// Key of the oldest known record, if any.
    #[must_use]
    pub fn oldest_key(&self) -> Option<MessageKey> {
        self.infos.last().map(|info| info.start)
    }

    /// Whether the block's payload is in the cache.
    #[must_use]
    pub fn is_cached(&self, block_id: BlockId) -> bool {
        self.cache.contains_key(&block_id)
    }

    /// Cached records of a block, newest-first.
    #[must_use]
    pub fn cached_records(&self, block_id: BlockId) -> Option<&[T]> {
        self.cache.get(&block_id).map(Vec::as_slice)
    }

    /// Install a payload fetched from the persistence substrate.
    pub fn install_loaded(&mut self, block_id: BlockId, records: Vec<T>) {
        self.cache.insert(block_id, records);
    }

    /// Index of the block containing `key`, or the index where a block for
    /// it would be inserted. Newest-first scan; block info lists are short.
    fn find_slot(&self, key: MessageKey) -> (usize, bool) {
        for (i, info) in self.infos.iter().enumerate() {
            // Newer than this block's newest: nothing older can hold it.
            if key > info.end {
                return (i, false);
            }
            if key >= info.start {
                return (i, true);
            }
        }
        (self.infos.len(), false)
    }

    /// Index of the block containing `key`, if any.
    #[must_use]
    pub fn locate(&self, key: MessageKey) -> Option<(usize, BlockId)> {
        match self.find_slot(key) {
            (i, true) => Some((i, self.infos[i].block_id)),
            _ => None,
        }
    }

    fn allocate_block(&mut self, key: MessageKey) -> BlockInfo {
        let block_id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        self.cache.insert(block_id, Vec::new());
        self.dirty.insert(block_id);
        BlockInfo {
            block_id,
            start: key,
            end: key,
            count: 0,
            est_size: 0,
        }
    }

    /// Choose the block an insertion of `key` with byte cost `size_cost`
    /// should land in, creating a new singleton block when no existing
    /// neighbor can absorb it without overflowing the budget.
    pub fn prepare_insert(&mut self, key: MessageKey, size_cost: u32) -> InsertSlot {
        let (index, contained) = self.find_slot(key);
        if contained {
            return InsertSlot {
                index,
                block_id: self.infos[index].block_id,
                created: false,
            };
        }

        let fits = |info: &BlockInfo| info.est_size + size_cost < self.budget.max_block_size;

        // Prefer the adjacent older block, then the adjacent younger one;
        // when both would overflow, start a fresh singleton block.
        if index < self.infos.len() && fits(&self.infos[index]) {
            return InsertSlot {
                index,
                block_id: self.infos[index].block_id,
                created: false,
            };
        }
        if index > 0 && fits(&self.infos[index - 1]) {
            return InsertSlot {
                index: index - 1,
                block_id: self.infos[index - 1].block_id,
                created: false,
            };
        }
        let info = self.allocate_block(key);
        let block_id = info.block_id;
        self.infos.insert(index, info);
        InsertSlot {
            index,
            block_id,
            created: true,
        }
    }

    /// Insert `record` into the block chosen by [`Self::prepare_insert`].
    /// The block's payload must be cached. Splits the block when it
    /// overflows the byte budget.
    ///
    /// # Panics
    ///
    /// Panics if the slot's payload is not cached; callers load it first.
    #[allow(clippy::expect_used)]
    pub fn apply_insert(&mut self, slot: InsertSlot, record: T) -> InsertOutcome {
        let key = record.key();
        let cost = record.size_estimate();
        let index = slot.index;

        {
            let info = &mut self.infos[index];
            if key > info.end {
                info.end = key;
            }
            if key < info.start {
                info.start = key;
            }
            info.est_size += cost;
            info.count += 1;

            let records = self
                .cache
                .get_mut(&info.block_id)
                .expect("insertion target block must be cached");
            let pos = records.partition_point(|r| r.key() > key);
            records.insert(pos, record);
            self.dirty.insert(info.block_id);
        }

        let info = self.infos[index].clone();
        if info.count > 1 && info.est_size >= self.budget.max_block_size {
            let newer_share = if index == 0 {
                // Small share toward the outer (future) edge so that the
                // usual one-directional growth does not immediately force
                // another split.
                self.budget.split_small_part
            } else if index == self.infos.len() - 1 {
                self.budget.split_large_part
            } else {
                self.budget.split_equal_part
            };
            let split_off = self.split_block(index, newer_share);

            // Figure out which half the inserted record landed in.
            let older = &self.infos[index + 1];
            let block_id = if key <= older.end {
                older.block_id
            } else {
                self.infos[index].block_id
            };
            return InsertOutcome {
                block_id,
                split_off: Some(split_off),
            };
        }

        InsertOutcome {
            block_id: info.block_id,
            split_off: None,
        }
    }

    /// Split the block at `index`, keeping roughly `newer_share` of the
    /// bytes in the newer half. Returns the id of the new older block,
    /// inserted at `index + 1`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::expect_used
    )]
    fn split_block(&mut self, index: usize, newer_share: f64) -> BlockId {
        let info = self.infos[index].clone();
        let records = self
            .cache
            .get_mut(&info.block_id)
            .expect("split target block must be cached");

        // Walk newest-to-oldest accumulating estimated bytes until the
        // newer half has its share, keeping at least one record per half.
        let target = (f64::from(info.est_size) * newer_share) as u32;
        let mut newer_bytes = 0u32;
        let mut keep = 0usize;
        for record in records.iter() {
            if keep + 1 >= records.len() {
                break;
            }
            newer_bytes += record.size_estimate();
            keep += 1;
            if newer_bytes >= target {
                break;
            }
        }
        let keep = keep.max(1);

        let older_records = records.split_off(keep);
        let newer_bytes: u32 = records.iter().map(BlockedRecord::size_estimate).sum();
        let older_bytes: u32 = older_records.iter().map(BlockedRecord::size_estimate).sum();

        let newer_start = records
            .last()
            .map(BlockedRecord::key)
            .expect("newer half keeps at least one record");
        let older_end = older_records
            .first()
            .map(BlockedRecord::key)
            .expect("older half keeps at least one record");

        let older_block_id = BlockId(self.next_block_id);
        self.next_block_id += 1;

        let older_info = BlockInfo {
            block_id: older_block_id,
            // The start bound may have been extended past the oldest record
            // by the in-flight insertion; carry it over.
            start: info.start,
            end: older_end,
            count: older_records.len() as u32,
            est_size: older_bytes,
        };

        {
            let newer_info = &mut self.infos[index];
            newer_info.start = newer_start;
            newer_info.count = (newer_info.count as usize - older_records.len()) as u32;
            newer_info.est_size = newer_bytes;
        }

        self.cache.insert(older_block_id, older_records);
        self.dirty.insert(info.block_id);
        self.dirty.insert(older_block_id);
        self.infos.insert(index + 1, older_info);

        older_block_id
    }

    /// Remove the record with `key` from the block at `index`. The payload
    /// must be cached.
    ///
    /// Returns `None` when the record is not actually present where the
    /// directory claims; the caller owns folder context and does the defect
    /// logging for that invariant violation.
    pub fn apply_delete(&mut self, index: usize, key: MessageKey) -> Option<DeleteOutcome<T>> {
        let info = &mut self.infos[index];
        let block_id = info.block_id;
        let records = self.cache.get_mut(&block_id)?;
        let pos = records.iter().position(|r| r.key() == key)?;
        let removed = records.remove(pos);

        info.count -= 1;
        info.est_size = info.est_size.saturating_sub(removed.size_estimate());

        if records.is_empty() {
            self.infos.remove(index);
            self.cache.remove(&block_id);
            self.dirty.remove(&block_id);
            self.deleted.push(block_id);
            return Some(DeleteOutcome {
                block_id,
                emptied: true,
                removed,
            });
        }

        // Removing an edge record shrinks the block's advertised bounds to
        // the surviving records.
        if let (Some(newest), Some(oldest)) = (records.first(), records.last()) {
            info.end = newest.key();
            info.start = oldest.key();
        }
        self.dirty.insert(block_id);
        Some(DeleteOutcome {
            block_id,
            emptied: false,
            removed,
        })
    }

    /// Replace a record in place (same key). Used for flag updates. The
    /// payload must be cached. Returns false if the record is absent.
    pub fn apply_update(&mut self, index: usize, record: T) -> bool {
        let info = &self.infos[index];
        let block_id = info.block_id;
        let Some(records) = self.cache.get_mut(&block_id) else {
            return false;
        };
        let key = record.key();
        let Some(pos) = records.iter().position(|r| r.key() == key) else {
            return false;
        };
        records[pos] = record;
        self.dirty.insert(block_id);
        true
    }

    /// Evict cached blocks that are clean and intersect none of the live
    /// key windows. Returns the number evicted.
    pub fn flush_excess(&mut self, live_windows: &[(MessageKey, MessageKey)]) -> usize {
        let dirty = &self.dirty;
        let infos = &self.infos;
        let mut evicted = 0;
        self.cache.retain(|block_id, _| {
            if dirty.contains(block_id) {
                return true;
            }
            let Some(info) = infos.iter().find(|info| info.block_id == *block_id) else {
                // No directory entry claims it; nothing can reach it.
                evicted += 1;
                return false;
            };
            let live = live_windows
                .iter()
                .any(|&(start, end)| info.intersects(start, end));
            if !live {
                evicted += 1;
            }
            live
        });
        evicted
    }

    /// Drain dirty payload copies and deleted block ids for an atomic
    /// commit batch.
    pub fn take_dirty(&mut self) -> (Vec<(BlockId, Vec<T>)>, Vec<BlockId>) {
        let mut dirty_blocks = Vec::with_capacity(self.dirty.len());
        for block_id in self.dirty.drain() {
            if let Some(records) = self.cache.get(&block_id) {
                dirty_blocks.push((block_id, records.clone()));
            }
        }
        // Stable order keeps substrate write patterns deterministic.
        dirty_blocks.sort_by_key(|(block_id, _)| *block_id);
        let deleted = std::mem::take(&mut self.deleted);
        (dirty_blocks, deleted)
    }

    /// Whether any dirty or deleted state is waiting for a commit.
    #[must_use]
    pub fn has_pending_commit(&self) -> bool {
        !self.dirty.is_empty() || !self.deleted.is_empty()
    }

    /// Debug check of the directory invariants: newest-first, internally
    /// ordered bounds, and strictly non-overlapping adjacent blocks.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        self.infos.iter().all(|info| info.start <= info.end)
            && self.infos.windows(2).all(|w| w[1].end < w[0].start)
    }
}
