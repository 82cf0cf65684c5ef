//! Persistence ports.
//!
//! The engine talks to storage through these traits only; `clerky-db`
//! provides the SQLite implementations and in-memory twins for tests. The
//! record repository is an at-most-once-per-call black box; the engine never
//! implements its own transactions on top of it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::ChatDocument;
use crate::schema::{TableConfig, TableId};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub workspace_id: String,
    pub table_id: TableId,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Equality filters over the record's JSON data; string comparison is
/// case-insensitive.
pub type RecordFilters = Map<String, Value>;

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn find_by_id(
        &self,
        workspace_id: &str,
        chat_id: &str,
    ) -> Result<Option<ChatDocument>, RepoError>;
    async fn save(&self, workspace_id: &str, document: ChatDocument) -> Result<(), RepoError>;
}

#[async_trait]
pub trait TableRepository: Send + Sync {
    async fn get(
        &self,
        workspace_id: &str,
        table_id: &TableId,
    ) -> Result<Option<TableConfig>, RepoError>;
    async fn list(&self, workspace_id: &str) -> Result<Vec<TableConfig>, RepoError>;
    async fn save(&self, table: TableConfig) -> Result<(), RepoError>;
}

#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn create(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        data: Map<String, Value>,
    ) -> Result<StoredRecord, RepoError>;

    async fn update(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        record_id: &str,
        data: Map<String, Value>,
    ) -> Result<Option<StoredRecord>, RepoError>;

    async fn delete(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        record_id: &str,
    ) -> Result<bool, RepoError>;

    async fn get(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        record_id: &str,
    ) -> Result<Option<StoredRecord>, RepoError>;

    async fn query(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        filters: &RecordFilters,
    ) -> Result<Vec<StoredRecord>, RepoError>;
}

/// In-data filter check shared by repository implementations.
pub fn record_matches_filters(data: &Map<String, Value>, filters: &RecordFilters) -> bool {
    filters.iter().all(|(key, expected)| {
        let Some(actual) = data.get(key) else { return false };
        match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => actual == expected,
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::record_matches_filters;

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn filters_match_case_insensitively_on_strings() {
        let data = map(&[("cliente", json!("Juan Pérez")), ("estado", json!("Pendiente"))]);

        assert!(record_matches_filters(&data, &map(&[("estado", json!("pendiente"))])));
        assert!(!record_matches_filters(&data, &map(&[("estado", json!("Confirmada"))])));
        assert!(!record_matches_filters(&data, &map(&[("inexistente", json!("x"))])));
        assert!(record_matches_filters(&data, &Map::new()));
    }

    #[test]
    fn non_string_filters_compare_exactly() {
        let data = map(&[("cantidad", json!(3))]);
        assert!(record_matches_filters(&data, &map(&[("cantidad", json!(3))])));
        assert!(!record_matches_filters(&data, &map(&[("cantidad", json!(4))])));
    }
}
