//! Integration tests for the SQLite substrate under the full engine.
//!
//! These tests drive the storage and sync engine against the in-memory
//! remote double while persisting through a real `SQLite` database, then
//! reopen the database to verify what survived.

use std::sync::Arc;

use mailstash_core::{
    BlockedRecord, Folder, FolderId, OpKind, OpOutcome, OpTarget, OperationQueue, SliceEvent,
    RemoteFolder, SyncConfig, SyncEngine,
};
use mailstash_core::date::{DAY_MS, now_ms};
use mailstash_core::remote::MemoryRemoteFolder;
use mailstash_core::slice::RecordingSink;
use mailstash_store::SqliteStore;

const INBOX: FolderId = FolderId(1);

async fn open_folder(
    store: Arc<SqliteStore>,
    sink: Arc<RecordingSink>,
) -> Arc<Folder<SqliteStore>> {
    Arc::new(
        Folder::open(INBOX, store, sink, SyncConfig::default())
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn sync_persists_across_reopen() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let remote = Arc::new(MemoryRemoteFolder::new(0));
    let now = now_ms();
    for i in 0..8i64 {
        remote.deliver(now - DAY_MS + i * 1000, "sender@example.com", &format!("m{i}"));
    }

    // First open syncs from the remote and commits to SQLite.
    {
        let sink = Arc::new(RecordingSink::new());
        let folder = open_folder(store.clone(), sink.clone()).await;
        let engine = SyncEngine::new(folder, remote.clone());
        let slice = engine.open_slice(20).await.unwrap();
        assert!(sink.events_for(slice).len() >= 2);
    }
    let searches = remote.search_count();
    assert!(store.block_count(INBOX).await.unwrap() > 0);

    // Reopening serves the slice from local storage; fresh coverage means
    // no further network calls.
    let sink = Arc::new(RecordingSink::new());
    let folder = open_folder(store.clone(), sink.clone()).await;
    let engine = SyncEngine::new(folder.clone(), remote.clone());
    let slice = engine.open_slice(20).await.unwrap();
    assert_eq!(remote.search_count(), searches);

    let events = sink.events_for(slice);
    let held: usize = events
        .iter()
        .filter_map(|e| match e {
            SliceEvent::Splice { added, .. } => Some(added.len()),
            _ => None,
        })
        .sum();
    assert_eq!(held, 8);
    assert!(matches!(
        events.last(),
        Some(SliceEvent::Status { .. })
    ));

    let guard = folder.begin("inspect").await;
    assert_eq!(guard.store.known_count(), 8);
    assert!(
        guard
            .accuracy
            .synced_to_dawn_of_time(guard.config.oldest_sync_date, now)
    );
    guard.abandon();
}

#[tokio::test]
async fn tag_operation_round_trips_through_sqlite() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let remote = Arc::new(MemoryRemoteFolder::new(0));
    let now = now_ms();
    let srvid = remote.deliver(now - DAY_MS, "sender@example.com", "flag me");

    let sink = Arc::new(RecordingSink::new());
    let folder = open_folder(store.clone(), sink.clone()).await;
    let engine = SyncEngine::new(folder.clone(), remote.clone());
    engine.open_slice(10).await.unwrap();

    let target = {
        let mut guard = folder.begin("find-target").await;
        let persist = guard.persist();
        let header = guard
            .store
            .header_by_srvid(persist, &srvid)
            .await
            .unwrap()
            .unwrap();
        guard.abandon();
        OpTarget {
            folder: INBOX,
            key: header.key(),
        }
    };

    let mut queue = OperationQueue::new(SyncConfig::default());
    queue.register(folder.clone(), remote.clone());
    let id = queue
        .enqueue(OpKind::ModifyTags {
            targets: vec![target],
            add: vec!["\\Seen".to_string()],
            remove: vec![],
        })
        .await
        .unwrap();
    let completion = queue.completion(id);
    queue.wait_for_drain().await.unwrap();
    assert_eq!(completion.await.unwrap(), OpOutcome::Done);

    // The flag reached the remote.
    let flags = remote.fetch_flags(&[srvid.clone()]).await.unwrap();
    assert_eq!(flags[0].1, vec!["\\Seen".to_string()]);

    // And the local change survived a reopen from SQLite.
    let folder = open_folder(store, Arc::new(RecordingSink::new())).await;
    let mut guard = folder.begin("verify").await;
    let persist = guard.persist();
    let header = guard
        .store
        .header_by_srvid(persist, &srvid)
        .await
        .unwrap()
        .unwrap();
    guard.abandon();
    assert_eq!(header.flags, vec!["\\Seen".to_string()]);
}

#[tokio::test]
async fn refresh_after_reopen_picks_up_remote_changes() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let remote = Arc::new(MemoryRemoteFolder::new(0));
    let now = now_ms();
    let victim = remote.deliver(now - DAY_MS, "sender@example.com", "doomed");
    let keeper = remote.deliver(now - DAY_MS + 1000, "sender@example.com", "kept");

    {
        let sink = Arc::new(RecordingSink::new());
        let folder = open_folder(store.clone(), sink).await;
        let engine = SyncEngine::new(folder, remote.clone());
        engine.open_slice(10).await.unwrap();
    }

    // Another client deletes a message while we are offline.
    remote.expunge(&victim);

    let sink = Arc::new(RecordingSink::new());
    let folder = open_folder(store, sink.clone()).await;
    // Age the coverage so the refresh actually goes to the network.
    {
        let mut guard = folder.begin("age-coverage").await;
        let stale = guard
            .accuracy
            .ranges()
            .iter()
            .map(|r| {
                let mut r = r.clone();
                if let Some(fs) = &mut r.full_sync {
                    fs.updated -= 2 * 60 * 60 * 1000;
                }
                r
            })
            .collect();
        guard.accuracy = mailstash_core::AccuracyTracker::from_ranges(stale);
        guard.commit().await.unwrap();
    }

    let engine = SyncEngine::new(folder.clone(), remote.clone());
    let slice = engine.open_slice(10).await.unwrap();

    let events = sink.events_for(slice);
    assert!(matches!(
        events.last(),
        Some(SliceEvent::Status { .. })
    ));
    let mut guard = folder.begin("inspect").await;
    let persist = guard.persist();
    assert_eq!(guard.store.known_count(), 1);
    assert!(
        guard
            .store
            .header_by_srvid(persist, &keeper)
            .await
            .unwrap()
            .is_some()
    );
    guard.abandon();
}
