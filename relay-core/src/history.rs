//! History store — append-only transcript snapshots per chat.
//!
//! Every completed turn inserts a new `chat_sessions` row; nothing is updated
//! in place except the `deleted_at` marker written by [`HistoryStore::reset`].
//! The active row with the highest id is the chat's current transcript.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Mutex;
use thiserror::Error;

use crate::models::history::HistoryRecord;
use crate::models::turn::Transcript;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Malformed history payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The authoritative active row for the chat, if any.
    async fn latest_record(&self, chat_id: i64) -> Result<Option<HistoryRecord>, StoreError>;

    /// Insert a new snapshot. Never touches earlier rows.
    async fn save(&self, chat_id: i64, transcript: &Transcript) -> Result<(), StoreError>;

    /// Soft-delete every active row for the chat. No-op when there are none.
    async fn reset(&self, chat_id: i64) -> Result<(), StoreError>;

    /// Decoded current transcript. `Ok(None)` means a fresh conversation; a
    /// stored payload that fails to decode is an error, not an empty history.
    async fn latest(&self, chat_id: i64) -> Result<Option<Transcript>, StoreError> {
        match self.latest_record(chat_id).await? {
            Some(record) => Ok(Some(Transcript::from_json(&record.history)?)),
            None => Ok(None),
        }
    }
}

// ============================================================================
// PgHistoryStore
// ============================================================================

#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn latest_record(&self, chat_id: i64) -> Result<Option<HistoryRecord>, StoreError> {
        let record = sqlx::query_as::<_, HistoryRecord>(
            "SELECT id, chat_id, history, created_at, updated_at, deleted_at
             FROM chat_sessions
             WHERE deleted_at IS NULL AND chat_id = $1
             ORDER BY id DESC
             LIMIT 1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn save(&self, chat_id: i64, transcript: &Transcript) -> Result<(), StoreError> {
        let history = transcript.to_json()?;

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO chat_sessions (chat_id, history, created_at, updated_at)
             VALUES ($1, $2, NOW(), NOW())
             RETURNING id",
        )
        .bind(chat_id)
        .bind(&history)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(chat_id, id = row.0, turns = transcript.len(), "Saved chat history");
        Ok(())
    }

    async fn reset(&self, chat_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE chat_sessions
             SET deleted_at = NOW(), updated_at = NOW()
             WHERE chat_id = $1 AND deleted_at IS NULL",
        )
        .bind(chat_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(chat_id, rows = result.rows_affected(), "Reset chat history");
        Ok(())
    }
}

// ============================================================================
// MemoryHistoryStore
// ============================================================================

/// Process-local store with the same row semantics as `chat_sessions`.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    rows: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row with an arbitrary payload, bypassing serialization.
    pub fn insert_raw(&self, chat_id: i64, history: impl Into<String>) -> i64 {
        let mut rows = self.lock();
        let id = rows.last().map_or(1, |r| r.id + 1);
        let now = Utc::now();
        rows.push(HistoryRecord {
            id,
            chat_id,
            history: history.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        });
        id
    }

    /// Every row for the chat, soft-deleted ones included, in id order.
    pub fn records(&self, chat_id: i64) -> Vec<HistoryRecord> {
        self.lock()
            .iter()
            .filter(|r| r.chat_id == chat_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HistoryRecord>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn latest_record(&self, chat_id: i64) -> Result<Option<HistoryRecord>, StoreError> {
        Ok(self
            .lock()
            .iter()
            .filter(|r| r.chat_id == chat_id && r.is_active())
            .max_by_key(|r| r.id)
            .cloned())
    }

    async fn save(&self, chat_id: i64, transcript: &Transcript) -> Result<(), StoreError> {
        let history = transcript.to_json()?;
        self.insert_raw(chat_id, history);
        Ok(())
    }

    async fn reset(&self, chat_id: i64) -> Result<(), StoreError> {
        let now = Utc::now();
        for row in self
            .lock()
            .iter_mut()
            .filter(|r| r.chat_id == chat_id && r.is_active())
        {
            row.deleted_at = Some(now);
            row.updated_at = now;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::turn::{Part, Turn};

    fn transcript(user: &str, model: &str) -> Transcript {
        Transcript::from(vec![Turn::user(user), Turn::model(vec![Part::text(model)])])
    }

    #[tokio::test]
    async fn test_latest_is_none_for_unknown_chat() {
        let store = MemoryHistoryStore::new();
        assert!(store.latest(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_returns_highest_id_save() {
        let store = MemoryHistoryStore::new();
        store.save(1, &transcript("one", "first")).await.unwrap();
        store.save(1, &transcript("two", "second")).await.unwrap();

        let latest = store.latest(1).await.unwrap().expect("history present");
        assert_eq!(latest, transcript("two", "second"));

        // Both snapshots remain as separate rows.
        assert_eq!(store.records(1).len(), 2);
    }

    #[tokio::test]
    async fn test_chats_are_isolated() {
        let store = MemoryHistoryStore::new();
        store.save(1, &transcript("a", "b")).await.unwrap();
        store.save(2, &transcript("c", "d")).await.unwrap();

        assert_eq!(store.latest(1).await.unwrap(), Some(transcript("a", "b")));
        assert_eq!(store.latest(2).await.unwrap(), Some(transcript("c", "d")));
    }

    #[tokio::test]
    async fn test_reset_soft_deletes_and_is_idempotent() {
        let store = MemoryHistoryStore::new();
        store.save(7, &transcript("a", "b")).await.unwrap();
        store.save(7, &transcript("c", "d")).await.unwrap();
        store.save(8, &transcript("e", "f")).await.unwrap();

        store.reset(7).await.unwrap();

        assert!(store.latest(7).await.unwrap().is_none());
        let rows = store.records(7);
        assert_eq!(rows.len(), 2, "rows are kept after reset");
        assert!(rows.iter().all(|r| r.deleted_at.is_some()));

        // Other chats unaffected, second reset is a no-op.
        assert!(store.latest(8).await.unwrap().is_some());
        store.reset(7).await.unwrap();
        store.reset(999).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_after_reset_starts_new_history() {
        let store = MemoryHistoryStore::new();
        store.save(3, &transcript("old", "old")).await.unwrap();
        store.reset(3).await.unwrap();
        store.save(3, &transcript("new", "new")).await.unwrap();

        assert_eq!(store.latest(3).await.unwrap(), Some(transcript("new", "new")));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_an_error() {
        let store = MemoryHistoryStore::new();
        store.insert_raw(5, "not json at all");

        let result = store.latest(5).await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }
}
