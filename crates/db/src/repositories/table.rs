use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use clerky_core::repo::{RepoError, TableRepository};
use clerky_core::schema::{FieldSpec, TableConfig, TableId};

use super::{decode_error, storage_error};
use crate::DbPool;

pub struct SqlTableRepository {
    pool: DbPool,
}

impl SqlTableRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn config_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TableConfig, RepoError> {
    let fields: Vec<FieldSpec> =
        serde_json::from_str(&row.get::<String, _>("fields_json")).map_err(decode_error)?;
    let rules =
        serde_json::from_str(&row.get::<String, _>("rules_json")).map_err(decode_error)?;
    Ok(TableConfig {
        id: TableId(row.get::<String, _>("id")),
        workspace_id: row.get::<String, _>("workspace_id"),
        name: row.get::<String, _>("name"),
        fields,
        rules,
    })
}

#[async_trait]
impl TableRepository for SqlTableRepository {
    async fn get(
        &self,
        workspace_id: &str,
        table_id: &TableId,
    ) -> Result<Option<TableConfig>, RepoError> {
        let row = sqlx::query(
            "SELECT workspace_id, id, name, fields_json, rules_json
             FROM table_definition
             WHERE workspace_id = ? AND id = ?",
        )
        .bind(workspace_id)
        .bind(&table_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(config_from_row).transpose()
    }

    async fn list(&self, workspace_id: &str) -> Result<Vec<TableConfig>, RepoError> {
        let rows = sqlx::query(
            "SELECT workspace_id, id, name, fields_json, rules_json
             FROM table_definition
             WHERE workspace_id = ?
             ORDER BY name ASC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter().map(config_from_row).collect()
    }

    async fn save(&self, table: TableConfig) -> Result<(), RepoError> {
        let fields = serde_json::to_string(&table.fields).map_err(decode_error)?;
        let rules = serde_json::to_string(&table.rules).map_err(decode_error)?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO table_definition (workspace_id, id, name, fields_json, rules_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(workspace_id, id) DO UPDATE SET
                name = excluded.name,
                fields_json = excluded.fields_json,
                rules_json = excluded.rules_json,
                updated_at = excluded.updated_at",
        )
        .bind(&table.workspace_id)
        .bind(&table.id.0)
        .bind(&table.name)
        .bind(fields)
        .bind(rules)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }
}
