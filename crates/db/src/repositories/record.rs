use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::Row;
use uuid::Uuid;

use clerky_core::repo::{
    record_matches_filters, RecordFilters, RecordRepository, RepoError, StoredRecord,
};
use clerky_core::schema::TableId;

use super::{decode_error, storage_error};
use crate::DbPool;

pub struct SqlRecordRepository {
    pool: DbPool,
}

impl SqlRecordRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredRecord, RepoError> {
    let data: Map<String, Value> =
        serde_json::from_str(&row.get::<String, _>("data_json")).map_err(decode_error)?;
    let created_at = parse_timestamp(&row.get::<String, _>("created_at"))?;
    let updated_at = parse_timestamp(&row.get::<String, _>("updated_at"))?;
    Ok(StoredRecord {
        id: row.get::<String, _>("id"),
        workspace_id: row.get::<String, _>("workspace_id"),
        table_id: TableId(row.get::<String, _>("table_id")),
        data,
        created_at,
        updated_at,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepoError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| RepoError::Decode(format!("bad timestamp `{raw}`: {err}")))
}

#[async_trait]
impl RecordRepository for SqlRecordRepository {
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
        let payload = serde_json::to_string(&record.data).map_err(decode_error)?;

        sqlx::query(
            "INSERT INTO record (id, workspace_id, table_id, data_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(workspace_id)
        .bind(&table_id.0)
        .bind(payload)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(record)
    }

    async fn update(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        record_id: &str,
        data: Map<String, Value>,
    ) -> Result<Option<StoredRecord>, RepoError> {
        let Some(mut existing) = self.get(workspace_id, table_id, record_id).await? else {
            return Ok(None);
        };

        // Patch semantics: incoming keys overlay the stored data.
        for (key, value) in data {
            existing.data.insert(key, value);
        }
        existing.updated_at = Utc::now();
        let payload = serde_json::to_string(&existing.data).map_err(decode_error)?;

        sqlx::query(
            "UPDATE record SET data_json = ?, updated_at = ?
             WHERE id = ? AND workspace_id = ? AND table_id = ?",
        )
        .bind(payload)
        .bind(existing.updated_at.to_rfc3339())
        .bind(record_id)
        .bind(workspace_id)
        .bind(&table_id.0)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(Some(existing))
    }

    async fn delete(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        record_id: &str,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "DELETE FROM record WHERE id = ? AND workspace_id = ? AND table_id = ?",
        )
        .bind(record_id)
        .bind(workspace_id)
        .bind(&table_id.0)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        record_id: &str,
    ) -> Result<Option<StoredRecord>, RepoError> {
        let row = sqlx::query(
            "SELECT id, workspace_id, table_id, data_json, created_at, updated_at
             FROM record
             WHERE id = ? AND workspace_id = ? AND table_id = ?",
        )
        .bind(record_id)
        .bind(workspace_id)
        .bind(&table_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(record_from_row).transpose()
    }

    async fn query(
        &self,
        workspace_id: &str,
        table_id: &TableId,
        filters: &RecordFilters,
    ) -> Result<Vec<StoredRecord>, RepoError> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, table_id, data_json, created_at, updated_at
             FROM record
             WHERE workspace_id = ? AND table_id = ?
             ORDER BY created_at ASC",
        )
        .bind(workspace_id)
        .bind(&table_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        let records: Result<Vec<StoredRecord>, RepoError> =
            rows.into_iter().map(record_from_row).collect();
        Ok(records?
            .into_iter()
            .filter(|record| record_matches_filters(&record.data, filters))
            .collect())
    }
}
