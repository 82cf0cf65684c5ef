use async_trait::async_trait;
use sqlx::Row;

use clerky_core::context::ChatDocument;
use clerky_core::repo::{ChatRepository, RepoError};

use super::{decode_error, storage_error};
use crate::DbPool;

/// Chat documents persist as one JSON blob per conversation; the whole
/// durable dialogue state lives inside `document_json`.
pub struct SqlChatRepository {
    pool: DbPool,
}

impl SqlChatRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatRepository for SqlChatRepository {
    async fn find_by_id(
        &self,
        workspace_id: &str,
        chat_id: &str,
    ) -> Result<Option<ChatDocument>, RepoError> {
        let row = sqlx::query(
            "SELECT document_json FROM chat_document WHERE workspace_id = ? AND id = ?",
        )
        .bind(workspace_id)
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(|row| {
            serde_json::from_str::<ChatDocument>(&row.get::<String, _>("document_json"))
                .map_err(decode_error)
        })
        .transpose()
    }

    async fn save(&self, workspace_id: &str, document: ChatDocument) -> Result<(), RepoError> {
        let payload = serde_json::to_string(&document).map_err(decode_error)?;
        sqlx::query(
            "INSERT INTO chat_document (workspace_id, id, agent_id, document_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(workspace_id, id) DO UPDATE SET
                agent_id = excluded.agent_id,
                document_json = excluded.document_json,
                updated_at = excluded.updated_at",
        )
        .bind(workspace_id)
        .bind(&document.id)
        .bind(&document.agent_id)
        .bind(payload)
        .bind(document.created_at.to_rfc3339())
        .bind(document.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clerky_core::context::{ChatContext, ChatDocument, Role};
    use clerky_core::repo::ChatRepository;
    use clerky_core::schema::{FieldSpec, FieldType, TableId};

    use crate::{connect_with_settings, migrations};

    use super::SqlChatRepository;

    #[tokio::test]
    async fn pending_state_survives_the_database_round_trip() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let repo = SqlChatRepository::new(pool);

        let mut ctx = ChatContext::new("ws-1", "agent-1", "chat-1");
        ctx.init_pending_record(
            TableId("tbl-citas".to_string()),
            "Citas",
            vec!["cliente".to_string(), "fecha".to_string()],
            vec![
                FieldSpec::new("cliente", "Cliente", FieldType::Text).required(),
                FieldSpec::new("fecha", "Fecha", FieldType::Date).required(),
            ],
        );
        ctx.merge_fields(
            [("cliente".to_string(), serde_json::json!("Juan Pérez"))].into_iter().collect(),
        );
        ctx.push_history(Role::User, "quiero agendar una cita");

        let mut document = ChatDocument::new("chat-1", "ws-1", "agent-1");
        ctx.save_pending_state(&mut document);
        repo.save("ws-1", document).await.expect("save");

        let loaded = repo
            .find_by_id("ws-1", "chat-1")
            .await
            .expect("find")
            .expect("document present");

        let mut restored = ChatContext::new("ws-1", "agent-1", "chat-1");
        restored.load_pending_state(&loaded);
        assert_eq!(restored.missing_fields, vec!["fecha"]);
        assert_eq!(restored.pending_record, ctx.pending_record);
        assert_eq!(restored.history.len(), 1);
    }

    #[tokio::test]
    async fn missing_chat_returns_none_and_save_upserts() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        let repo = SqlChatRepository::new(pool);

        assert!(repo.find_by_id("ws-1", "nope").await.expect("find").is_none());

        let mut document = ChatDocument::new("chat-1", "ws-1", "agent-1");
        repo.save("ws-1", document.clone()).await.expect("first save");
        document.agent_id = "agent-2".to_string();
        repo.save("ws-1", document).await.expect("second save");

        let loaded = repo.find_by_id("ws-1", "chat-1").await.expect("find").expect("present");
        assert_eq!(loaded.agent_id, "agent-2");
    }
}
