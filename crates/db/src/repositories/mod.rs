use clerky_core::repo::RepoError;

pub mod chat;
pub mod memory;
pub mod record;
pub mod table;

pub use chat::SqlChatRepository;
pub use memory::{InMemoryChatRepository, InMemoryRecordRepository, InMemoryTableRepository};
pub use record::SqlRecordRepository;
pub use table::SqlTableRepository;

pub(crate) fn storage_error(error: sqlx::Error) -> RepoError {
    RepoError::Storage(error.to_string())
}

pub(crate) fn decode_error(error: serde_json::Error) -> RepoError {
    RepoError::Decode(error.to_string())
}
