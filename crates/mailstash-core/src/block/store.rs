//! Per-folder block storage: the header and body directories, the
//! server-id index, and the folder-local counters.
//!
//! All mutation goes through a [`FolderBlockStore`] while the folder mutex
//! is held; the store tracks dirty blocks and hands back one atomic commit
//! batch per release. Block payload loads are the only suspension points.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::accuracy::AccuracyTracker;
use crate::block::directory::{BlockBudget, BlockDirectory, BlockInfo};
use crate::config::SyncConfig;
use crate::date::{DAY_MS, TimestampMs, in_date_range, quantize_date_up};
use crate::error::Result;
use crate::persist::{BlockPersist, CommitBatch, FolderStateSnapshot};
use crate::records::{BlockId, BlockedRecord, BodyRecord, FolderId, HeaderRecord, MessageId, MessageKey};

/// Outcome of a purge pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    /// Number of messages (header + body pairs) deleted.
    pub deleted: u32,
    /// The cut timestamp everything older than which was dropped; 0 when
    /// the purge was a no-op.
    pub cut_ts: TimestampMs,
}

/// Block storage for one folder.
#[derive(Debug)]
pub struct FolderBlockStore {
    folder: FolderId,
    headers: BlockDirectory<HeaderRecord>,
    bodies: BlockDirectory<BodyRecord>,
    /// Server id to header block mapping; only headers carry server ids.
    srvid_index: HashMap<String, BlockId>,
    next_header_id: u64,
    /// Body blocks allocated since the last purge check.
    body_blocks_allocated: u32,
}

impl FolderBlockStore {
    /// Create empty storage for a folder.
    #[must_use]
    pub fn new(folder: FolderId, config: &SyncConfig) -> Self {
        let budget = BlockBudget::from_config(config);
        Self {
            folder,
            headers: BlockDirectory::new(budget),
            bodies: BlockDirectory::new(budget),
            srvid_index: HashMap::new(),
            next_header_id: 1,
            body_blocks_allocated: 0,
        }
    }

    /// Rebuild storage from a persisted snapshot. The server-id index is
    /// rebuilt lazily as blocks load; lookups consult it only for blocks
    /// that have been seen, so a cold index is correct, just slower.
    #[must_use]
    pub fn from_snapshot(folder: FolderId, config: &SyncConfig, snapshot: &FolderStateSnapshot) -> Self {
        let budget = BlockBudget::from_config(config);
        Self {
            folder,
            headers: BlockDirectory::from_snapshot(
                budget,
                snapshot.header_infos.clone(),
                snapshot.next_header_block_id,
            ),
            bodies: BlockDirectory::from_snapshot(
                budget,
                snapshot.body_infos.clone(),
                snapshot.next_body_block_id,
            ),
            srvid_index: HashMap::new(),
            next_header_id: snapshot.next_header_id,
            body_blocks_allocated: 0,
        }
    }

    /// The folder this storage belongs to.
    #[must_use]
    pub const fn folder(&self) -> FolderId {
        self.folder
    }

    /// Issue the next folder-local message id.
    pub const fn issue_header_id(&mut self) -> MessageId {
        let id = MessageId(self.next_header_id);
        self.next_header_id += 1;
        id
    }

    /// Number of messages we know about.
    #[must_use]
    pub fn known_count(&self) -> u32 {
        self.headers.total_count()
    }

    /// Key of the newest known header.
    #[must_use]
    pub fn newest_key(&self) -> Option<MessageKey> {
        self.headers.newest_key()
    }

    /// Key of the oldest known header.
    #[must_use]
    pub fn oldest_key(&self) -> Option<MessageKey> {
        self.headers.oldest_key()
    }

    /// Header block directory entries, newest-first.
    #[must_use]
    pub fn header_infos(&self) -> &[BlockInfo] {
        self.headers.infos()
    }

    async fn ensure_header_cached<P: BlockPersist>(
        &mut self,
        persist: &P,
        block_id: BlockId,
    ) -> Result<()> {
        if !self.headers.is_cached(block_id) {
            let records = persist.load_header_block(self.folder, block_id).await?;
            // Opportunistically warm the server-id index.
            for record in &records {
                if let Some(srvid) = record.server_id() {
                    self.srvid_index.insert(srvid.to_owned(), block_id);
                }
            }
            self.headers.install_loaded(block_id, records);
        }
        Ok(())
    }

    async fn ensure_body_cached<P: BlockPersist>(
        &mut self,
        persist: &P,
        block_id: BlockId,
    ) -> Result<()> {
        if !self.bodies.is_cached(block_id) {
            let records = persist.load_body_block(self.folder, block_id).await?;
            self.bodies.install_loaded(block_id, records);
        }
        Ok(())
    }

    /// Insert a header record.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn add_header<P: BlockPersist>(
        &mut self,
        persist: &P,
        header: HeaderRecord,
    ) -> Result<()> {
        let srvid = header.srvid.clone();
        let slot = self
            .headers
            .prepare_insert(header.key(), header.size_estimate());
        if !slot.created {
            self.ensure_header_cached(persist, slot.block_id).await?;
        }
        let outcome = self.headers.apply_insert(slot, header);
        if let Some(srvid) = srvid {
            self.srvid_index.insert(srvid, outcome.block_id);
        }
        if let Some(split_off) = outcome.split_off {
            self.reindex_server_ids(split_off);
        }
        Ok(())
    }

    /// Insert a body record.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn add_body<P: BlockPersist>(&mut self, persist: &P, body: BodyRecord) -> Result<()> {
        let slot = self.bodies.prepare_insert(body.key(), body.size_estimate());
        if slot.created {
            self.body_blocks_allocated += 1;
        }
        if !slot.created {
            self.ensure_body_cached(persist, slot.block_id).await?;
        }
        let outcome = self.bodies.apply_insert(slot, body);
        if outcome.split_off.is_some() {
            self.body_blocks_allocated += 1;
        }
        Ok(())
    }

    /// Point the server-id index at the given block for every record it
    /// holds; used after a split relocates records.
    fn reindex_server_ids(&mut self, block_id: BlockId) {
        let mut relocated = Vec::new();
        if let Some(records) = self.headers.cached_records(block_id) {
            for record in records {
                if let Some(srvid) = record.server_id() {
                    relocated.push(srvid.to_owned());
                }
            }
        }
        for srvid in relocated {
            self.srvid_index.insert(srvid, block_id);
        }
    }

    /// Fetch a header by key.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn header<P: BlockPersist>(
        &mut self,
        persist: &P,
        key: MessageKey,
    ) -> Result<Option<HeaderRecord>> {
        let Some((_, block_id)) = self.headers.locate(key) else {
            return Ok(None);
        };
        self.ensure_header_cached(persist, block_id).await?;
        Ok(self
            .headers
            .cached_records(block_id)
            .and_then(|records| records.iter().find(|r| r.key() == key).cloned()))
    }

    /// Fetch a body by key.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn body<P: BlockPersist>(
        &mut self,
        persist: &P,
        key: MessageKey,
    ) -> Result<Option<BodyRecord>> {
        let Some((_, block_id)) = self.bodies.locate(key) else {
            return Ok(None);
        };
        self.ensure_body_cached(persist, block_id).await?;
        Ok(self
            .bodies
            .cached_records(block_id)
            .and_then(|records| records.iter().find(|r| r.key() == key).cloned()))
    }

    /// Look up a header by its server-assigned id. Falls back to a block
    /// scan when the lazily-built index has not seen the block yet.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn header_by_srvid<P: BlockPersist>(
        &mut self,
        persist: &P,
        srvid: &str,
    ) -> Result<Option<HeaderRecord>> {
        if let Some(block_id) = self.srvid_index.get(srvid).copied() {
            self.ensure_header_cached(persist, block_id).await?;
            if let Some(found) = self
                .headers
                .cached_records(block_id)
                .and_then(|records| records.iter().find(|r| r.server_id() == Some(srvid)))
            {
                return Ok(Some(found.clone()));
            }
        }
        // Cold index: scan blocks until found.
        let block_ids: Vec<BlockId> = self.headers.infos().iter().map(|i| i.block_id).collect();
        for block_id in block_ids {
            self.ensure_header_cached(persist, block_id).await?;
            if let Some(found) = self
                .headers
                .cached_records(block_id)
                .and_then(|records| records.iter().find(|r| r.server_id() == Some(srvid)))
            {
                return Ok(Some(found.clone()));
            }
        }
        Ok(None)
    }

    /// Mutate a header in place (flags and other mutable fields; identity
    /// fields must not change). Returns the updated record, or `None` with
    /// a defect log when the directory has no such record.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn modify_header<P: BlockPersist, F>(
        &mut self,
        persist: &P,
        key: MessageKey,
        mutate: F,
    ) -> Result<Option<HeaderRecord>>
    where
        F: FnOnce(&mut HeaderRecord),
    {
        let Some((index, block_id)) = self.headers.locate(key) else {
            warn!(folder = %self.folder, ?key, "modify of unknown header");
            return Ok(None);
        };
        self.ensure_header_cached(persist, block_id).await?;
        let Some(mut record) = self
            .headers
            .cached_records(block_id)
            .and_then(|records| records.iter().find(|r| r.key() == key).cloned())
        else {
            warn!(folder = %self.folder, ?key, "header missing from its block");
            return Ok(None);
        };
        mutate(&mut record);
        debug_assert_eq!(record.key(), key, "identity fields are immutable");
        self.headers.apply_update(index, record.clone());
        Ok(Some(record))
    }

    /// Mutate a body record in place.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn modify_body<P: BlockPersist, F>(
        &mut self,
        persist: &P,
        key: MessageKey,
        mutate: F,
    ) -> Result<Option<BodyRecord>>
    where
        F: FnOnce(&mut BodyRecord),
    {
        let Some((index, block_id)) = self.bodies.locate(key) else {
            warn!(folder = %self.folder, ?key, "modify of unknown body");
            return Ok(None);
        };
        self.ensure_body_cached(persist, block_id).await?;
        let Some(mut record) = self
            .bodies
            .cached_records(block_id)
            .and_then(|records| records.iter().find(|r| r.key() == key).cloned())
        else {
            warn!(folder = %self.folder, ?key, "body missing from its block");
            return Ok(None);
        };
        mutate(&mut record);
        self.bodies.apply_update(index, record.clone());
        Ok(Some(record))
    }

    /// Delete a message's header and body. Returns the removed records, or
    /// `None` with a defect log when the header is not where the directory
    /// claims (adjacent state is left untouched).
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn delete_message<P: BlockPersist>(
        &mut self,
        persist: &P,
        key: MessageKey,
    ) -> Result<Option<(HeaderRecord, Option<BodyRecord>)>> {
        let Some((index, block_id)) = self.headers.locate(key) else {
            warn!(folder = %self.folder, ?key, "deletion of unknown message");
            return Ok(None);
        };
        self.ensure_header_cached(persist, block_id).await?;
        let Some(header_outcome) = self.headers.apply_delete(index, key) else {
            warn!(folder = %self.folder, ?key, "header missing from its block");
            return Ok(None);
        };
        if let Some(srvid) = header_outcome.removed.server_id() {
            self.srvid_index.remove(srvid);
        }

        let body = if let Some((body_index, body_block)) = self.bodies.locate(key) {
            self.ensure_body_cached(persist, body_block).await?;
            match self.bodies.apply_delete(body_index, key) {
                Some(outcome) => Some(outcome.removed),
                None => {
                    warn!(folder = %self.folder, ?key, "body missing from its block");
                    None
                }
            }
        } else {
            None
        };
        Ok(Some((header_outcome.removed, body)))
    }

    /// Delete a message named by its server id. Returns the removed
    /// records, `None` when we do not know the message (already gone).
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn delete_by_srvid<P: BlockPersist>(
        &mut self,
        persist: &P,
        srvid: &str,
    ) -> Result<Option<(HeaderRecord, Option<BodyRecord>)>> {
        let Some(header) = self.header_by_srvid(persist, srvid).await? else {
            return Ok(None);
        };
        self.delete_message(persist, header.key()).await
    }

    /// Ordered headers (newest-first) within the IMAP-style date range
    /// `[start, end)`, up to `limit`.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn headers_in_range<P: BlockPersist>(
        &mut self,
        persist: &P,
        start: Option<TimestampMs>,
        end: Option<TimestampMs>,
        limit: usize,
    ) -> Result<Vec<HeaderRecord>> {
        let candidates: Vec<BlockId> = self
            .headers
            .infos()
            .iter()
            .filter(|info| {
                crate::date::since(info.end.date, start) && crate::date::before(info.start.date, end)
            })
            .map(|info| info.block_id)
            .collect();

        let mut out = Vec::new();
        for block_id in candidates {
            self.ensure_header_cached(persist, block_id).await?;
            if let Some(records) = self.headers.cached_records(block_id) {
                for record in records {
                    if in_date_range(record.date, start, end) {
                        out.push(record.clone());
                        if out.len() >= limit {
                            return Ok(out);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Up to `limit` headers strictly older than `key` (all from the
    /// newest when `key` is `None`), newest-first.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn headers_before<P: BlockPersist>(
        &mut self,
        persist: &P,
        key: Option<MessageKey>,
        limit: usize,
    ) -> Result<Vec<HeaderRecord>> {
        let candidates: Vec<BlockId> = self
            .headers
            .infos()
            .iter()
            .filter(|info| key.is_none_or(|key| info.start < key))
            .map(|info| info.block_id)
            .collect();

        let mut out = Vec::new();
        for block_id in candidates {
            self.ensure_header_cached(persist, block_id).await?;
            if let Some(records) = self.headers.cached_records(block_id) {
                for record in records {
                    if key.is_none_or(|key| record.key() < key) {
                        out.push(record.clone());
                        if out.len() >= limit {
                            return Ok(out);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Up to `limit` headers strictly newer than `key`, newest-first; the
    /// returned records are the ones nearest above `key`.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn headers_after<P: BlockPersist>(
        &mut self,
        persist: &P,
        key: MessageKey,
        limit: usize,
    ) -> Result<Vec<HeaderRecord>> {
        let candidates: Vec<BlockId> = self
            .headers
            .infos()
            .iter()
            .rev()
            .filter(|info| info.end > key)
            .map(|info| info.block_id)
            .collect();

        let mut out = Vec::new();
        'blocks: for block_id in candidates {
            self.ensure_header_cached(persist, block_id).await?;
            if let Some(records) = self.headers.cached_records(block_id) {
                for record in records.iter().rev() {
                    if record.key() > key {
                        out.push(record.clone());
                        if out.len() >= limit {
                            break 'blocks;
                        }
                    }
                }
            }
        }
        out.reverse();
        Ok(out)
    }

    /// Whether `key` is the newest known header.
    #[must_use]
    pub fn is_newest_known(&self, key: MessageKey) -> bool {
        self.headers.newest_key() == Some(key)
    }

    /// Whether `key` is the oldest known header.
    #[must_use]
    pub fn is_oldest_known(&self, key: MessageKey) -> bool {
        self.headers.oldest_key() == Some(key)
    }

    /// Whether enough body blocks have been allocated to warrant a purge
    /// pass; resets the counter when it fires.
    pub const fn take_purge_due(&mut self, config: &SyncConfig) -> bool {
        if self.body_blocks_allocated >= config.block_purge_every_n_new_body_blocks {
            self.body_blocks_allocated = 0;
            true
        } else {
            false
        }
    }

    fn purge_last_access_cut(
        accuracy: &AccuracyTracker,
        config: &SyncConfig,
        now: TimestampMs,
    ) -> TimestampMs {
        let cutoff = now - config.block_purge_only_after_unsynced_ms;
        let ranges = accuracy.ranges();
        // Walk oldest-to-newest past stale full-sync ranges; stop at the
        // first fresh one.
        let mut cut_idx = ranges.len();
        while cut_idx >= 1 {
            let range = &ranges[cut_idx - 1];
            match &range.full_sync {
                // Never-fully-synced spans are fair game; keep walking.
                None => {
                    cut_idx -= 1;
                }
                Some(fs) if fs.updated <= cutoff => {
                    cut_idx -= 1;
                }
                Some(_) => break,
            }
        }
        if cut_idx == ranges.len() {
            return 0;
        }
        let cut_ts = ranges[cut_idx].end_ts;
        // Clamp to the retention horizon, minus a day so quantization does
        // not bite into the configured range.
        let horizon = now - config.sync_range_ms - DAY_MS;
        cut_ts.min(horizon)
    }

    fn purge_hard_block_cut(infos: &[BlockInfo], config: &SyncConfig) -> TimestampMs {
        if infos.len() <= config.block_purge_hard_max_block_limit {
            return 0;
        }
        infos[config.block_purge_hard_max_block_limit].start.date
    }

    /// Delete old messages to bound storage size. The cut point is the
    /// most aggressive of the staleness-based cut and the hard block-count
    /// cut, but data refreshed within the staleness budget is never
    /// deleted, whichever cut proposed it.
    ///
    /// # Errors
    ///
    /// Fails only when a block payload load fails.
    pub async fn purge_excess<P: BlockPersist>(
        &mut self,
        persist: &P,
        accuracy: &mut AccuracyTracker,
        config: &SyncConfig,
        now: TimestampMs,
    ) -> Result<PurgeReport> {
        let mut cut_ts = Self::purge_last_access_cut(accuracy, config, now)
            .max(Self::purge_hard_block_cut(self.headers.infos(), config))
            .max(Self::purge_hard_block_cut(self.bodies.infos(), config));
        // Recency protection: the hard cap forces additional purging of
        // already-stale data only, never of fresh data.
        cut_ts = cut_ts.min(now - config.block_purge_only_after_unsynced_ms);

        if cut_ts <= 0 {
            return Ok(PurgeReport {
                deleted: 0,
                cut_ts: 0,
            });
        }

        // Quantize up to the following midnight, mirroring what the
        // remote date-range lookups do about timezone skew.
        let cut_ts = quantize_date_up(cut_ts);
        accuracy.truncate_before(cut_ts);

        let mut deleted = 0u32;
        loop {
            let Some(info) = self.headers.infos().last().cloned() else {
                break;
            };
            self.ensure_header_cached(persist, info.block_id).await?;
            let Some(oldest) = self
                .headers
                .cached_records(info.block_id)
                .and_then(|records| records.last())
                .map(BlockedRecord::key)
            else {
                break;
            };
            if oldest.date >= cut_ts {
                break;
            }
            if self.delete_message(persist, oldest).await?.is_none() {
                // Defect already logged; stop rather than spin.
                break;
            }
            deleted += 1;
        }
        debug!(folder = %self.folder, deleted, cut_ts, "purge pass complete");
        Ok(PurgeReport { deleted, cut_ts })
    }

    /// Evict clean cached blocks intersecting none of the live slice
    /// windows.
    pub fn flush_excess(&mut self, live_windows: &[(MessageKey, MessageKey)]) -> usize {
        self.headers.flush_excess(live_windows) + self.bodies.flush_excess(live_windows)
    }

    /// Whether any dirty or deleted block state awaits a commit.
    #[must_use]
    pub fn has_pending_commit(&self) -> bool {
        self.headers.has_pending_commit() || self.bodies.has_pending_commit()
    }

    /// Drain all dirty state into an atomic commit batch.
    pub fn take_commit_batch(
        &mut self,
        accuracy: &AccuracyTracker,
        last_synced_at: Option<TimestampMs>,
    ) -> CommitBatch {
        let (dirty_header_blocks, deleted_header_blocks) = self.headers.take_dirty();
        let (dirty_body_blocks, deleted_body_blocks) = self.bodies.take_dirty();
        CommitBatch {
            folder: self.folder,
            dirty_header_blocks,
            dirty_body_blocks,
            deleted_header_blocks,
            deleted_body_blocks,
            snapshot: FolderStateSnapshot {
                header_infos: self.headers.infos().to_vec(),
                body_infos: self.bodies.infos().to_vec(),
                accuracy: accuracy.ranges().to_vec(),
                next_header_id: self.next_header_id,
                next_header_block_id: self.headers.next_block_id(),
                next_body_block_id: self.bodies.next_block_id(),
                last_synced_at,
            },
        }
    }

    /// Debug check of both directories' invariants.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        self.headers.invariants_hold() && self.bodies.invariants_hold()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accuracy::FullSync;
    use crate::persist::MemoryPersist;
    use crate::records::BodyRep;

    fn config() -> SyncConfig {
        SyncConfig::default()
    }

    fn header(id: u64, date: i64) -> HeaderRecord {
        HeaderRecord {
            id: MessageId(id),
            srvid: Some(format!("srv-{id}")),
            date,
            author: "someone@example.com".into(),
            subject: format!("message {id}"),
            flags: vec![],
            snippet: "snippet".into(),
            has_attachments: false,
            body_size_estimate: 1024,
        }
    }

    fn body(id: u64, date: i64) -> BodyRecord {
        BodyRecord {
            id: MessageId(id),
            date,
            to: vec!["us@example.com".into()],
            cc: vec![],
            bcc: vec![],
            attachments: vec![],
            related_parts: vec![],
            references: vec![],
            size_estimate: 1024,
            body_reps: vec![BodyRep::PlainChunks(vec!["hi".into()])],
        }
    }

    async fn store_with_messages(
        persist: &MemoryPersist,
        n: u64,
    ) -> (FolderBlockStore, SyncConfig) {
        let config = config();
        let mut store = FolderBlockStore::new(FolderId(1), &config);
        for id in 1..=n {
            let date = i64::try_from(id).unwrap() * DAY_MS;
            store.add_header(persist, header(id, date)).await.unwrap();
            store.add_body(persist, body(id, date)).await.unwrap();
        }
        (store, config)
    }

    #[tokio::test]
    async fn add_and_fetch_round_trip() {
        let persist = MemoryPersist::new();
        let (mut store, _) = store_with_messages(&persist, 5).await;
        assert_eq!(store.known_count(), 5);
        let key = MessageKey::new(3 * DAY_MS, MessageId(3));
        let fetched = store.header(&persist, key).await.unwrap().unwrap();
        assert_eq!(fetched.subject, "message 3");
        let fetched_body = store.body(&persist, key).await.unwrap().unwrap();
        assert_eq!(fetched_body.id, MessageId(3));
    }

    #[tokio::test]
    async fn srvid_lookup_and_delete() {
        let persist = MemoryPersist::new();
        let (mut store, _) = store_with_messages(&persist, 5).await;
        let found = store.header_by_srvid(&persist, "srv-4").await.unwrap();
        assert_eq!(found.unwrap().id, MessageId(4));

        let removed = store.delete_by_srvid(&persist, "srv-4").await.unwrap();
        assert!(removed.is_some());
        assert_eq!(store.known_count(), 4);
        assert!(
            store
                .header_by_srvid(&persist, "srv-4")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn delete_unknown_message_is_noop() {
        let persist = MemoryPersist::new();
        let (mut store, _) = store_with_messages(&persist, 2).await;
        let key = MessageKey::new(99 * DAY_MS, MessageId(99));
        assert!(store.delete_message(&persist, key).await.unwrap().is_none());
        assert_eq!(store.known_count(), 2);
        assert!(store.invariants_hold());
    }

    #[tokio::test]
    async fn headers_in_range_respects_imap_bounds() {
        let persist = MemoryPersist::new();
        let (mut store, _) = store_with_messages(&persist, 10).await;
        // [3d, 7d): inclusive since, exclusive before.
        let headers = store
            .headers_in_range(&persist, Some(3 * DAY_MS), Some(7 * DAY_MS), 100)
            .await
            .unwrap();
        let ids: Vec<u64> = headers.iter().map(|h| h.id.0).collect();
        assert_eq!(ids, vec![6, 5, 4, 3]);
    }

    #[tokio::test]
    async fn headers_before_and_after_walk_neighbors() {
        let persist = MemoryPersist::new();
        let (mut store, _) = store_with_messages(&persist, 10).await;
        let anchor = MessageKey::new(5 * DAY_MS, MessageId(5));

        let older = store.headers_before(&persist, Some(anchor), 3).await.unwrap();
        let ids: Vec<u64> = older.iter().map(|h| h.id.0).collect();
        assert_eq!(ids, vec![4, 3, 2]);

        let newer = store.headers_after(&persist, anchor, 3).await.unwrap();
        let ids: Vec<u64> = newer.iter().map(|h| h.id.0).collect();
        assert_eq!(ids, vec![8, 7, 6]);
    }

    #[tokio::test]
    async fn commit_and_reload_preserves_state() {
        let persist = MemoryPersist::new();
        let (mut store, config) = store_with_messages(&persist, 8).await;
        let mut accuracy = AccuracyTracker::new();
        accuracy.mark_synced(
            0,
            9 * DAY_MS,
            &FullSync {
                highest_modseq: "7".into(),
                updated: 100,
            },
        );
        let batch = store.take_commit_batch(&accuracy, Some(123));
        persist.commit(batch).await.unwrap();

        let snapshot = persist
            .load_folder_state(FolderId(1))
            .await
            .unwrap()
            .unwrap();
        let mut reloaded = FolderBlockStore::from_snapshot(FolderId(1), &config, &snapshot);
        assert_eq!(reloaded.known_count(), 8);
        assert!(reloaded.invariants_hold());
        let key = MessageKey::new(2 * DAY_MS, MessageId(2));
        let fetched = reloaded.header(&persist, key).await.unwrap().unwrap();
        assert_eq!(fetched.subject, "message 2");
        assert_eq!(snapshot.accuracy.len(), 1);
        assert_eq!(snapshot.last_synced_at, Some(123));
    }

    #[tokio::test]
    async fn fresh_data_under_cap_purges_nothing() {
        let persist = MemoryPersist::new();
        let now = 100 * DAY_MS;
        let (mut store, config) = store_with_messages(&persist, 10).await;
        let mut accuracy = AccuracyTracker::new();
        accuracy.mark_synced(
            0,
            now,
            &FullSync {
                highest_modseq: "9".into(),
                updated: now - 1000,
            },
        );
        let report = store
            .purge_excess(&persist, &mut accuracy, &config, now)
            .await
            .unwrap();
        assert_eq!(report, PurgeReport { deleted: 0, cut_ts: 0 });
        assert_eq!(store.known_count(), 10);
    }

    #[tokio::test]
    async fn stale_old_data_is_purged_and_accuracy_truncated() {
        let persist = MemoryPersist::new();
        let config = config();
        let now = 400 * DAY_MS;
        let mut store = FolderBlockStore::new(FolderId(1), &config);
        // Ancient messages plus recent ones.
        for id in 1..=5u64 {
            let date = i64::try_from(id).unwrap() * DAY_MS;
            store.add_header(&persist, header(id, date)).await.unwrap();
            store.add_body(&persist, body(id, date)).await.unwrap();
        }
        for id in 6..=10u64 {
            let date = now - 2 * DAY_MS;
            store.add_header(&persist, header(id, date)).await.unwrap();
            store.add_body(&persist, body(id, date)).await.unwrap();
        }
        let mut accuracy = AccuracyTracker::new();
        let stale = FullSync {
            highest_modseq: "1".into(),
            updated: now - 100 * DAY_MS,
        };
        let fresh = FullSync {
            highest_modseq: "2".into(),
            updated: now - 1000,
        };
        accuracy.mark_synced(0, 10 * DAY_MS, &stale);
        accuracy.mark_synced(now - 5 * DAY_MS, now, &fresh);

        let report = store
            .purge_excess(&persist, &mut accuracy, &config, now)
            .await
            .unwrap();
        assert_eq!(report.deleted, 5);
        assert_eq!(store.known_count(), 5);
        assert!(accuracy.invariants_hold());
        // Only the fresh range survives.
        assert!(
            accuracy
                .ranges()
                .iter()
                .all(|r| r.end_ts > report.cut_ts)
        );
        assert!(store.invariants_hold());
    }
}
