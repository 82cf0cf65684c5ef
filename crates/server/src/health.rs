use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::bootstrap::AppState;

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match sqlx_ping(&state).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(error) => {
            tracing::warn!(
                event_name = "system.health.degraded",
                error = %error,
                "database ping failed"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "unreachable" })),
            )
        }
    }
}

async fn sqlx_ping(state: &AppState) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(&state.db_pool).await.map(|_| ())
}
