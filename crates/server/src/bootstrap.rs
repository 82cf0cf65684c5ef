use std::sync::Arc;

use anyhow::{Context, Result};

use clerky_agent::{ChatEngine, EngineOptions};
use clerky_core::config::AppConfig;
use clerky_db::repositories::{SqlChatRepository, SqlRecordRepository, SqlTableRepository};
use clerky_db::{connect_with_settings, migrations, DbPool};

use crate::oracle::HttpOracle;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: DbPool,
    pub engine: Arc<ChatEngine>,
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<AppState> {
    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .context("connecting to database")?;

    migrations::run_pending(&db_pool).await.context("running migrations")?;

    let oracle = Arc::new(HttpOracle::from_config(&config.llm).context("configuring oracle")?);
    let chats = Arc::new(SqlChatRepository::new(db_pool.clone()));
    let tables = Arc::new(SqlTableRepository::new(db_pool.clone()));
    let records = Arc::new(SqlRecordRepository::new(db_pool.clone()));

    let engine = Arc::new(ChatEngine::new(
        oracle,
        chats,
        tables,
        records,
        EngineOptions::from(&config),
    ));

    tracing::info!(
        event_name = "system.bootstrap.completed",
        provider = ?config.llm.provider,
        model = %config.llm.model,
        "engine wired"
    );

    Ok(AppState { config: Arc::new(config), db_pool, engine })
}
