use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted transcript snapshot. Rows are append-only; a reset only sets
/// `deleted_at`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoryRecord {
    pub id: i64,
    pub chat_id: i64,
    pub history: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl HistoryRecord {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}
