use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use clerky_agent::{DateContext, TenantProfile, TurnRequest};

use crate::bootstrap::AppState;
use crate::health;

#[derive(Debug, Deserialize)]
pub struct ChatMessageBody {
    pub message: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub profile: Option<ProfileBody>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileBody {
    pub assistant_name: Option<String>,
    pub business_name: Option<String>,
    pub vertical: Option<String>,
    pub personality: Option<String>,
    pub tone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatMessageReply {
    pub reply: String,
    pub handled: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/api/workspaces/{workspace_id}/chats/{chat_id}/messages",
            post(post_message),
        )
        .with_state(state)
}

async fn post_message(
    State(state): State<AppState>,
    Path((workspace_id, chat_id)): Path<(String, String)>,
    Json(body): Json<ChatMessageBody>,
) -> Json<ChatMessageReply> {
    let mut profile = TenantProfile { workspace_id: workspace_id.clone(), ..TenantProfile::default() };
    if let Some(overrides) = body.profile {
        if let Some(assistant_name) = overrides.assistant_name {
            profile.assistant_name = assistant_name;
        }
        if let Some(business_name) = overrides.business_name {
            profile.business_name = business_name;
        }
        if let Some(vertical) = overrides.vertical {
            profile.vertical = vertical;
        }
        if let Some(personality) = overrides.personality {
            profile.personality = personality;
        }
        if let Some(tone) = overrides.tone {
            profile.tone = tone;
        }
    }

    let request = TurnRequest {
        workspace_id,
        agent_id: body.agent_id.unwrap_or_else(|| "default".to_string()),
        chat_id,
        message: body.message,
        profile,
        date_context: DateContext::new(Utc::now().date_naive()),
    };

    let response = state.engine.handle_turn(request).await;
    Json(ChatMessageReply { reply: response.reply, handled: response.handled })
}
