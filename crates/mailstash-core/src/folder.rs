//! Per-folder mutation serialization.
//!
//! Every mutation of a folder's storage (sync passes, operation applies,
//! purge) runs while holding the folder mutex, acquired with a label for
//! traceability. The tokio mutex queues waiters fairly, so operations
//! arriving while a block load is suspended drain in arrival order.
//!
//! Release is explicit: [`FolderGuard::commit`] drains dirty block state
//! into one atomic batch, evicts cached blocks no live slice needs, and
//! reports when the folder has no active consumers left.
//! [`FolderGuard::abandon`] drops the guard without committing; since the
//! accuracy tracker is only persisted on commit, an abandoned sync step is
//! indistinguishable from one that never ran once the process restarts.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::accuracy::AccuracyTracker;
use crate::block::FolderBlockStore;
use crate::config::SyncConfig;
use crate::date::TimestampMs;
use crate::error::Result;
use crate::persist::BlockPersist;
use crate::records::FolderId;
use crate::slice::{NotificationSink, SliceRegistry};

/// Everything mutable about one folder, owned behind the folder mutex.
#[derive(Debug)]
pub struct FolderState {
    /// Block-structured header and body storage.
    pub store: FolderBlockStore,
    /// Which time spans are known-synchronized.
    pub accuracy: AccuracyTracker,
    /// Live consumer views.
    pub slices: SliceRegistry,
    /// Tuning constants.
    pub config: SyncConfig,
    /// Client-clock time of the last completed sync pass.
    pub last_synced_at: Option<TimestampMs>,
}

/// One folder's storage plus its mutation mutex.
#[derive(Debug)]
pub struct Folder<P> {
    id: FolderId,
    persist: Arc<P>,
    state: Mutex<FolderState>,
}

impl<P: BlockPersist> Folder<P> {
    /// Open a folder, restoring persisted state when present.
    ///
    /// # Errors
    ///
    /// Substrate failures loading the folder snapshot.
    pub async fn open(
        id: FolderId,
        persist: Arc<P>,
        sink: Arc<dyn NotificationSink>,
        config: SyncConfig,
    ) -> Result<Self> {
        let (store, accuracy, last_synced_at) = match persist.load_folder_state(id).await? {
            Some(snapshot) => {
                debug!(folder = %id, blocks = snapshot.header_infos.len(), "folder state restored");
                let store = FolderBlockStore::from_snapshot(id, &config, &snapshot);
                let accuracy = AccuracyTracker::from_ranges(snapshot.accuracy.clone());
                (store, accuracy, snapshot.last_synced_at)
            }
            None => {
                debug!(folder = %id, "fresh folder");
                (
                    FolderBlockStore::new(id, &config),
                    AccuracyTracker::new(),
                    None,
                )
            }
        };
        Ok(Self {
            id,
            persist,
            state: Mutex::new(FolderState {
                store,
                accuracy,
                slices: SliceRegistry::new(sink),
                config,
                last_synced_at,
            }),
        })
    }

    /// The folder's identifier.
    #[must_use]
    pub const fn id(&self) -> FolderId {
        self.id
    }

    /// The persistence substrate block loads go through.
    #[must_use]
    pub fn persist(&self) -> &P {
        &self.persist
    }

    /// Acquire the folder mutex. Waiters are served in arrival order.
    pub async fn begin(&self, label: &'static str) -> FolderGuard<'_, P> {
        trace!(folder = %self.id, label, "mutex requested");
        let state = self.state.lock().await;
        debug!(folder = %self.id, label, "mutex acquired");
        FolderGuard {
            folder: self.id,
            label,
            persist: &self.persist,
            state,
            finished: false,
        }
    }
}

/// Exclusive access to a folder's state, released by [`commit`] or
/// [`abandon`].
///
/// [`commit`]: Self::commit
/// [`abandon`]: Self::abandon
#[derive(Debug)]
pub struct FolderGuard<'a, P: BlockPersist> {
    folder: FolderId,
    label: &'static str,
    persist: &'a P,
    state: MutexGuard<'a, FolderState>,
    finished: bool,
}

impl<P: BlockPersist> Deref for FolderGuard<'_, P> {
    type Target = FolderState;

    fn deref(&self) -> &FolderState {
        &self.state
    }
}

impl<P: BlockPersist> DerefMut for FolderGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut FolderState {
        &mut self.state
    }
}

impl<'a, P: BlockPersist> FolderGuard<'a, P> {
    /// The substrate to load blocks through while holding the guard. The
    /// returned reference outlives the guard borrow, so it can be held
    /// across mutable use of the state.
    #[must_use]
    pub const fn persist(&self) -> &'a P {
        self.persist
    }

    /// Commit everything this exclusive section changed as one atomic
    /// batch, then evict cached blocks no live slice window touches.
    ///
    /// # Errors
    ///
    /// Substrate failures; the previously committed state stays intact and
    /// the dirty in-memory state is retained for a later commit.
    pub async fn commit(mut self) -> Result<()> {
        self.finished = true;
        let state = &mut *self.state;
        let batch = state
            .store
            .take_commit_batch(&state.accuracy, state.last_synced_at);
        let dirty = batch.dirty_header_blocks.len() + batch.dirty_body_blocks.len();
        let deleted = batch.deleted_header_blocks.len() + batch.deleted_body_blocks.len();
        self.persist.commit(batch).await?;

        let evicted = state.store.flush_excess(&state.slices.live_windows());
        debug!(
            folder = %self.folder,
            label = self.label,
            dirty,
            deleted,
            evicted,
            "mutex released with commit"
        );
        if state.slices.is_empty() {
            debug!(folder = %self.folder, "no active consumers; remote connection releasable");
        }
        Ok(())
    }

    /// Release without committing. The accuracy tracker and directory
    /// state keep their in-memory changes, but nothing becomes durable; a
    /// failed step looks like it never happened after a reload.
    pub fn abandon(mut self) {
        self.finished = true;
        debug!(folder = %self.folder, label = self.label, "mutex released without commit");
    }
}

impl<P: BlockPersist> Drop for FolderGuard<'_, P> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                folder = %self.folder,
                label = self.label,
                "guard dropped without commit or abandon"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::DAY_MS;
    use crate::persist::MemoryPersist;
    use crate::records::{HeaderRecord, MessageId};
    use crate::slice::RecordingSink;

    fn header(id: u64, date: i64) -> HeaderRecord {
        HeaderRecord {
            id: MessageId(id),
            srvid: None,
            date,
            author: "a@example.com".into(),
            subject: "s".into(),
            flags: vec![],
            snippet: String::new(),
            has_attachments: false,
            body_size_estimate: 0,
        }
    }

    async fn folder(persist: Arc<MemoryPersist>) -> Folder<MemoryPersist> {
        Folder::open(
            FolderId(1),
            persist,
            Arc::new(RecordingSink::new()),
            SyncConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn commit_makes_changes_durable() {
        let persist = Arc::new(MemoryPersist::new());
        let folder = folder(persist.clone()).await;

        let mut guard = folder.begin("test-insert").await;
        let persist_ref = guard.persist();
        guard
            .store
            .add_header(persist_ref, header(1, DAY_MS))
            .await
            .unwrap();
        guard.commit().await.unwrap();

        assert_eq!(persist.commit_count(), 1);
        let reopened = Folder::open(
            FolderId(1),
            persist,
            Arc::new(RecordingSink::new()),
            SyncConfig::default(),
        )
        .await
        .unwrap();
        let guard = reopened.begin("test-check").await;
        assert_eq!(guard.store.known_count(), 1);
        guard.abandon();
    }

    #[tokio::test]
    async fn abandon_commits_nothing() {
        let persist = Arc::new(MemoryPersist::new());
        let folder = folder(persist.clone()).await;

        let mut guard = folder.begin("test-abandon").await;
        let persist_ref = guard.persist();
        guard
            .store
            .add_header(persist_ref, header(1, DAY_MS))
            .await
            .unwrap();
        guard.abandon();
        assert_eq!(persist.commit_count(), 0);
        assert!(
            persist
                .load_folder_state(FolderId(1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn waiters_drain_in_arrival_order() {
        let persist = Arc::new(MemoryPersist::new());
        let folder = Arc::new(folder(persist).await);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = folder.begin("holder").await;
        let mut handles = Vec::new();
        for i in 0..4u64 {
            let folder = folder.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let guard = folder.begin("waiter").await;
                order.lock().unwrap().push(i);
                guard.abandon();
            }));
            // Let the waiter reach the lock queue before spawning the next.
            tokio::task::yield_now().await;
        }
        first.abandon();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
