//! # mailstash-store
//!
//! SQLite persistence substrate for the mailstash storage engine.
//!
//! Implements [`BlockPersist`] over a `SQLite` database: block payloads
//! are stored as JSON rows keyed by folder and block id, folder metadata
//! snapshots as one JSON row per folder. Every commit batch is applied
//! inside a single transaction, so a failed commit leaves the previously
//! committed state intact.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::debug;

use mailstash_core::{
    BlockId, BlockPersist, BodyRecord, CommitBatch, Error, FolderId, FolderStateSnapshot,
    HeaderRecord, Result,
};

const KIND_HEADER: &str = "header";
const KIND_BODY: &str = "body";

fn db_err(e: sqlx::Error) -> Error {
    Error::Persist(e.to_string())
}

/// SQLite-backed block persistence.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a store at the given database path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection or schema creation
    /// fails.
    pub async fn open(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Create an in-memory store for testing and ephemeral profiles.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection or schema creation
    /// fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db_err)?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS blocks (
                folder_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                block_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (folder_id, kind, block_id)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS folder_state (
                folder_id INTEGER PRIMARY KEY,
                snapshot TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn load_payload(&self, folder: FolderId, kind: &str, block: BlockId) -> Result<String> {
        let row = sqlx::query(
            r"SELECT payload FROM blocks WHERE folder_id = ? AND kind = ? AND block_id = ?",
        )
        .bind(i64::try_from(folder.0).unwrap_or(i64::MAX))
        .bind(kind)
        .bind(i64::try_from(block.0).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| row.get("payload"))
            .ok_or(Error::MissingBlock { folder, block })
    }

    /// Number of stored blocks of either kind for a folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn block_count(&self, folder: FolderId) -> Result<u64> {
        let row = sqlx::query(r"SELECT COUNT(*) as count FROM blocks WHERE folder_id = ?")
            .bind(i64::try_from(folder.0).unwrap_or(i64::MAX))
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let count: i64 = row.get("count");
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

impl BlockPersist for SqliteStore {
    async fn load_header_block(
        &self,
        folder: FolderId,
        block: BlockId,
    ) -> Result<Vec<HeaderRecord>> {
        let payload = self.load_payload(folder, KIND_HEADER, block).await?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn load_body_block(&self, folder: FolderId, block: BlockId) -> Result<Vec<BodyRecord>> {
        let payload = self.load_payload(folder, KIND_BODY, block).await?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn commit(&self, batch: CommitBatch) -> Result<()> {
        let folder_id = i64::try_from(batch.folder.0).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for (block, records) in &batch.dirty_header_blocks {
            sqlx::query(
                r"
                INSERT INTO blocks (folder_id, kind, block_id, payload)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(folder_id, kind, block_id) DO UPDATE SET
                    payload = excluded.payload
                ",
            )
            .bind(folder_id)
            .bind(KIND_HEADER)
            .bind(i64::try_from(block.0).unwrap_or(i64::MAX))
            .bind(serde_json::to_string(records)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        for (block, records) in &batch.dirty_body_blocks {
            sqlx::query(
                r"
                INSERT INTO blocks (folder_id, kind, block_id, payload)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(folder_id, kind, block_id) DO UPDATE SET
                    payload = excluded.payload
                ",
            )
            .bind(folder_id)
            .bind(KIND_BODY)
            .bind(i64::try_from(block.0).unwrap_or(i64::MAX))
            .bind(serde_json::to_string(records)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        for block in &batch.deleted_header_blocks {
            sqlx::query(r"DELETE FROM blocks WHERE folder_id = ? AND kind = ? AND block_id = ?")
                .bind(folder_id)
                .bind(KIND_HEADER)
                .bind(i64::try_from(block.0).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        for block in &batch.deleted_body_blocks {
            sqlx::query(r"DELETE FROM blocks WHERE folder_id = ? AND kind = ? AND block_id = ?")
                .bind(folder_id)
                .bind(KIND_BODY)
                .bind(i64::try_from(block.0).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        sqlx::query(
            r"
            INSERT INTO folder_state (folder_id, snapshot)
            VALUES (?, ?)
            ON CONFLICT(folder_id) DO UPDATE SET
                snapshot = excluded.snapshot
            ",
        )
        .bind(folder_id)
        .bind(serde_json::to_string(&batch.snapshot)?)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(
            folder = %batch.folder,
            dirty = batch.dirty_header_blocks.len() + batch.dirty_body_blocks.len(),
            deleted = batch.deleted_header_blocks.len() + batch.deleted_body_blocks.len(),
            "commit batch applied"
        );
        Ok(())
    }

    async fn load_folder_state(&self, folder: FolderId) -> Result<Option<FolderStateSnapshot>> {
        let row = sqlx::query(r"SELECT snapshot FROM folder_state WHERE folder_id = ?")
            .bind(i64::try_from(folder.0).unwrap_or(i64::MAX))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => {
                let payload: String = row.get("snapshot");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mailstash_core::{BlockedRecord, MessageId, MessageKey};

    fn header(id: u64, date: i64) -> HeaderRecord {
        HeaderRecord {
            id: MessageId(id),
            srvid: Some(format!("srv-{id}")),
            date,
            author: "someone@example.com".to_string(),
            subject: format!("message {id}"),
            flags: vec!["\\Seen".to_string()],
            snippet: "snippet".to_string(),
            has_attachments: false,
            body_size_estimate: 1024,
        }
    }

    fn batch_with_block(folder: FolderId, block: BlockId, records: Vec<HeaderRecord>) -> CommitBatch {
        CommitBatch {
            folder,
            dirty_header_blocks: vec![(block, records)],
            dirty_body_blocks: vec![],
            deleted_header_blocks: vec![],
            deleted_body_blocks: vec![],
            snapshot: FolderStateSnapshot {
                next_header_id: 3,
                ..FolderStateSnapshot::default()
            },
        }
    }

    #[tokio::test]
    async fn commit_and_load_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let folder = FolderId(1);
        let block = BlockId(1);
        let records = vec![header(2, 2000), header(1, 1000)];

        store
            .commit(batch_with_block(folder, block, records.clone()))
            .await
            .unwrap();

        let loaded = store.load_header_block(folder, block).await.unwrap();
        assert_eq!(loaded, records);
        assert_eq!(loaded[0].key(), MessageKey::new(2000, MessageId(2)));

        let snapshot = store.load_folder_state(folder).await.unwrap().unwrap();
        assert_eq!(snapshot.next_header_id, 3);
    }

    #[tokio::test]
    async fn missing_block_is_reported() {
        let store = SqliteStore::in_memory().await.unwrap();
        let result = store.load_header_block(FolderId(1), BlockId(9)).await;
        assert!(matches!(result, Err(Error::MissingBlock { .. })));
    }

    #[tokio::test]
    async fn never_seen_folder_has_no_state() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.load_folder_state(FolderId(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rewrite_replaces_and_delete_removes() {
        let store = SqliteStore::in_memory().await.unwrap();
        let folder = FolderId(1);
        let block = BlockId(1);

        store
            .commit(batch_with_block(folder, block, vec![header(1, 1000)]))
            .await
            .unwrap();
        store
            .commit(batch_with_block(
                folder,
                block,
                vec![header(2, 2000), header(1, 1000)],
            ))
            .await
            .unwrap();
        assert_eq!(
            store.load_header_block(folder, block).await.unwrap().len(),
            2
        );
        assert_eq!(store.block_count(folder).await.unwrap(), 1);

        let delete = CommitBatch {
            folder,
            dirty_header_blocks: vec![],
            dirty_body_blocks: vec![],
            deleted_header_blocks: vec![block],
            deleted_body_blocks: vec![],
            snapshot: FolderStateSnapshot::default(),
        };
        store.commit(delete).await.unwrap();
        assert_eq!(store.block_count(folder).await.unwrap(), 0);
        assert!(matches!(
            store.load_header_block(folder, block).await,
            Err(Error::MissingBlock { .. })
        ));
    }

    #[tokio::test]
    async fn folders_do_not_interfere() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .commit(batch_with_block(FolderId(1), BlockId(1), vec![header(1, 1000)]))
            .await
            .unwrap();
        store
            .commit(batch_with_block(FolderId(2), BlockId(1), vec![header(9, 9000)]))
            .await
            .unwrap();

        let one = store.load_header_block(FolderId(1), BlockId(1)).await.unwrap();
        let two = store.load_header_block(FolderId(2), BlockId(1)).await.unwrap();
        assert_eq!(one[0].id, MessageId(1));
        assert_eq!(two[0].id, MessageId(9));
    }
}
