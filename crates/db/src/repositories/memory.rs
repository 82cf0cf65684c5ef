use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use clerky_core::context::ChatDocument;
use clerky_core::repo::{
    record_matches_filters, ChatRepository, RecordFilters, RecordRepository, RepoError,
    StoredRecord, TableRepository,
};
use clerky_core::schema::{TableConfig, TableId};

#[derive(Default)]
pub struct InMemoryChatRepository {
    chats: RwLock<HashMap<(String, String), ChatDocument>>,
}

#[async_trait::async_trait]
impl ChatRepository for InMemoryChatRepository {
    async fn find_by_id(
        &self,
        workspace_id: &str,
        chat_id: &str,
    ) -> Result<Option<ChatDocument>, RepoError> {
        let chats = self.chats.read().await;
        Ok(chats.get(&(workspace_id.to_string(), chat_id.to_string())).cloned())
    }

    async fn save(&self, workspace_id: &str, document: ChatDocument) -> Result<(), RepoError> {
        let mut chats = self.chats.write().await;
        chats.insert((workspace_id.to_string(), document.id.clone()), document);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryTableRepository {
    tables: RwLock<HashMap<(String, String), TableConfig>>,
}

#[async_trait::async_trait]
impl TableRepository for InMemoryTableRepository {
    async fn get(
        &self,
        workspace_id: &str,
        table_id: &TableId,
    ) -> Result<Option<TableConfig>, RepoError> {
        let tables = self.tables.read().await;
        Ok(tables.get(&(workspace_id.to_string(), table_id.0.clone())).cloned())
    }

    async fn list(&self, workspace_id: &str) -> Result<Vec<TableConfig>, RepoError> {
        let tables = self.tables.read().await;
        let mut result: Vec<TableConfig> = tables
            .iter()
            .filter(|((workspace, _), _)| workspace == workspace_id)
            .map(|(_, table)| table.clone())
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn save(&self, table: TableConfig) -> Result<(), RepoError> {
        let mut tables = self.tables.write().await;
        tables.insert((table.workspace_id.clone(), table.id.0.clone()), table);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryRecordRepository {
    records: RwLock<HashMap<String, StoredRecord>>,
}

#[async_trait::async_trait]
impl RecordRepository for InMemoryRecordRepository {
    async fn create(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        data: Map<String, Value>,
    ) -> Result<StoredRecord, RepoError> {
        let now = Utc::now();
        let record = StoredRecord {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            table_id: table_id.clone(),
            data,
            created_at: now,
            updated_at: now,
        };
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        record_id: &str,
        data: Map<String, Value>,
    ) -> Result<Option<StoredRecord>, RepoError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(record_id) else { return Ok(None) };
        if record.workspace_id != workspace_id || &record.table_id != table_id {
            return Ok(None);
        }
        for (key, value) in data {
            record.data.insert(key, value);
        }
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn delete(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        record_id: &str,
    ) -> Result<bool, RepoError> {
        let mut records = self.records.write().await;
        let matches = records
            .get(record_id)
            .map(|r| r.workspace_id == workspace_id && &r.table_id == table_id)
            .unwrap_or(false);
        if matches {
            records.remove(record_id);
        }
        Ok(matches)
    }

    async fn get(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        record_id: &str,
    ) -> Result<Option<StoredRecord>, RepoError> {
        let records = self.records.read().await;
        Ok(records
            .get(record_id)
            .filter(|r| r.workspace_id == workspace_id && &r.table_id == table_id)
            .cloned())
    }

    async fn query(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        filters: &RecordFilters,
    ) -> Result<Vec<StoredRecord>, RepoError> {
        let records = self.records.read().await;
        let mut result: Vec<StoredRecord> = records
            .values()
            .filter(|r| {
                r.workspace_id == workspace_id
                    && &r.table_id == table_id
                    && record_matches_filters(&r.data, filters)
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(result)
    }
}
