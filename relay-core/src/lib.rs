pub mod config;
pub mod db;
pub mod gemini;
pub mod history;
pub mod models;

pub use config::RelayConfig;
pub use gemini::{
    is_supported, GeminiChat, ModelError, ModelReply, ModelSettings, GEMINI_PRO,
    SUPPORTED_MODELS,
};
pub use history::{HistoryStore, MemoryHistoryStore, PgHistoryStore, StoreError};
pub use models::history::HistoryRecord;
pub use models::turn::{Part, Role, Transcript, Turn};
