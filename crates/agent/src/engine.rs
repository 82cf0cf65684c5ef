//! Top-level dialogue orchestration.
//!
//! One call to [`ChatEngine::handle_turn`] processes one user message end to
//! end: load the chat document, route through confirmation/undo fast paths,
//! classify, let the oracle pick a tool, dispatch to the matching handler,
//! and persist the updated conversation state exactly once. Nothing in the
//! pipeline is allowed to crash a turn; failures degrade to a safe reply.
//!
//! Caller obligation: turns on the same `chat_id` must be processed
//! sequentially. The engine does not serialize concurrent messages for one
//! chat; cross-chat concurrency is fine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;

use clerky_core::config::AppConfig;
use clerky_core::confirm::ConfirmationManager;
use clerky_core::context::{ChatContext, ChatDocument, Role};
use clerky_core::flows::FlowStack;
use clerky_core::history::{is_undo_request, rollback_instructions, ActionLog, RollbackOperation};
use clerky_core::kv::TtlCache;
use clerky_core::repo::{ChatRepository, RecordRepository, TableRepository};
use clerky_core::schema::{normalize_name, TableConfig};

use crate::collector::{DateContext, FieldCollector};
use crate::llm::{Classification, MessageCategory, OracleClient, OracleMessage, OracleReply};
use crate::prompt::{build_pending_context, build_system_prompt, TenantProfile};
use crate::quick::{classify_quick_pattern, QuickIntent};
use crate::tools::{build_tools, ToolKind};

pub const REPLY_MISUNDERSTOOD: &str =
    "No estoy seguro de qué necesitas. ¿Puedes decirlo de otra forma?";
pub const REPLY_DEGRADED: &str =
    "No pude procesar tu mensaje en este momento. Inténtalo de nuevo más tarde.";

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub model: String,
    pub history_limit: usize,
    pub confirmation_timeout_secs: i64,
    pub extraction_temperature: f32,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub max_query_rows: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            model: "llama3.1".to_string(),
            history_limit: 20,
            confirmation_timeout_secs: 300,
            extraction_temperature: 0.1,
            cache_capacity: 256,
            cache_ttl: Duration::from_secs(600),
            max_query_rows: 10,
        }
    }
}

impl From<&AppConfig> for EngineOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            model: config.llm.model.clone(),
            history_limit: config.engine.history_limit,
            confirmation_timeout_secs: config.engine.confirmation_timeout_secs,
            extraction_temperature: config.llm.extraction_temperature,
            cache_capacity: config.engine.cache_capacity,
            cache_ttl: Duration::from_secs(config.engine.cache_ttl_secs),
            max_query_rows: 10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub workspace_id: String,
    pub agent_id: String,
    pub chat_id: String,
    pub message: String,
    pub profile: TenantProfile,
    pub date_context: DateContext,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TurnResponse {
    pub reply: String,
    pub handled: bool,
}

impl TurnResponse {
    pub(crate) fn handled(reply: impl Into<String>) -> Self {
        Self { reply: reply.into(), handled: true }
    }

    pub(crate) fn unhandled(reply: impl Into<String>) -> Self {
        Self { reply: reply.into(), handled: false }
    }
}

pub(crate) struct TurnState {
    pub tables: Vec<TableConfig>,
}

pub struct ChatEngine {
    pub(crate) oracle: Arc<dyn OracleClient>,
    pub(crate) chats: Arc<dyn ChatRepository>,
    pub(crate) tables: Arc<dyn TableRepository>,
    pub(crate) records: Arc<dyn RecordRepository>,
    pub(crate) collector: FieldCollector,
    pub(crate) confirmations: ConfirmationManager,
    pub(crate) flows: FlowStack,
    pub(crate) actions: ActionLog,
    classification_cache: TtlCache<Classification>,
    pub(crate) options: EngineOptions,
}

impl ChatEngine {
    pub fn new(
        oracle: Arc<dyn OracleClient>,
        chats: Arc<dyn ChatRepository>,
        tables: Arc<dyn TableRepository>,
        records: Arc<dyn RecordRepository>,
        options: EngineOptions,
    ) -> Self {
        let collector = FieldCollector::new(
            oracle.clone(),
            tables.clone(),
            records.clone(),
            options.model.clone(),
            options.extraction_temperature,
            options.cache_capacity,
            options.cache_ttl,
        );
        Self {
            oracle,
            chats,
            tables,
            records,
            collector,
            confirmations: ConfirmationManager::with_timeout(options.confirmation_timeout_secs),
            flows: FlowStack::new(),
            actions: ActionLog::new(),
            classification_cache: TtlCache::new(options.cache_capacity, options.cache_ttl),
            options,
        }
    }

    pub fn action_log(&self) -> &ActionLog {
        &self.actions
    }

    pub fn flow_stack(&self) -> &FlowStack {
        &self.flows
    }

    /// Process one user turn. Never panics and never returns an error: any
    /// internal failure degrades to a generic reply.
    pub async fn handle_turn(&self, request: TurnRequest) -> TurnResponse {
        match self.run_turn(&request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    event_name = "engine.turn_failed",
                    workspace_id = %request.workspace_id,
                    chat_id = %request.chat_id,
                    error = %error,
                    "turn degraded to generic reply"
                );
                TurnResponse::handled(REPLY_DEGRADED)
            }
        }
    }

    async fn run_turn(&self, request: &TurnRequest) -> Result<TurnResponse> {
        let mut document = self
            .chats
            .find_by_id(&request.workspace_id, &request.chat_id)
            .await?
            .unwrap_or_else(|| {
                ChatDocument::new(
                    request.chat_id.clone(),
                    request.workspace_id.clone(),
                    request.agent_id.clone(),
                )
            });

        let mut ctx = ChatContext::new(
            request.workspace_id.clone(),
            request.agent_id.clone(),
            request.chat_id.clone(),
        )
        .with_history_limit(self.options.history_limit);
        ctx.load_pending_state(&document);
        ctx.message = request.message.clone();

        // A restart mid-confirmation recovers from the chat document.
        if let Some(state) = &ctx.pending_confirmation {
            if self.confirmations.get(&request.chat_id).is_none() {
                self.confirmations.restore(&request.chat_id, state.clone());
            }
        }

        let turn = TurnState { tables: self.tables.list(&request.workspace_id).await? };

        let response = self.dispatch_message(request, &turn, &mut ctx).await;

        ctx.push_history(Role::User, &request.message);
        ctx.push_history(Role::Assistant, &response.reply);
        ctx.pending_confirmation = self.confirmations.get(&request.chat_id);
        ctx.save_pending_state(&mut document);
        self.chats.save(&request.workspace_id, document).await?;

        Ok(response)
    }

    async fn dispatch_message(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
    ) -> TurnResponse {
        // An open confirmation captures every reply until it resolves.
        if self.confirmations.get(&request.chat_id).is_some() {
            return self.process_confirmation_reply(request, turn, ctx).await;
        }

        if is_undo_request(&request.message) {
            return self.handle_undo(request).await;
        }

        match classify_quick_pattern(&request.message) {
            Some(QuickIntent::Greeting) => {
                return TurnResponse::handled(self.with_reminder(ctx, "¡Hola! ¿En qué te puedo ayudar?"));
            }
            Some(QuickIntent::Thanks) => {
                return TurnResponse::handled(self.with_reminder(ctx, "¡De nada!"));
            }
            _ => {}
        }

        let classification = self.classify(&request.message).await;
        if !classification.is_valid {
            return TurnResponse::handled(canned_reply(classification.category));
        }

        let reply = self.oracle_function_call(request, turn, ctx).await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(
                    event_name = "engine.oracle_call_failed",
                    chat_id = %request.chat_id,
                    error = %error,
                    "function call degraded"
                );
                return TurnResponse::handled(REPLY_DEGRADED);
            }
        };

        match reply {
            OracleReply::Text(text) => {
                TurnResponse::handled(self.with_reminder(ctx, &text))
            }
            OracleReply::ToolCall { name, arguments } => {
                self.dispatch_tool(request, turn, ctx, &name, arguments).await
            }
        }
    }

    async fn oracle_function_call(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &ChatContext,
    ) -> Result<OracleReply> {
        let system_prompt = build_system_prompt(&request.profile, &turn.tables);
        let table_names: Vec<String> = turn.tables.iter().map(|t| t.name.clone()).collect();
        let tools = build_tools(&table_names);

        let mut messages: Vec<OracleMessage> = ctx
            .history
            .iter()
            .map(|m| OracleMessage::new(m.role, m.content.clone()))
            .collect();

        // Active collection flow: remind the oracle what is being collected
        // so continuation data re-selects create_record. A nested related
        // record takes precedence over the parent draft.
        if let Some(relation) = &ctx.pending_relation {
            messages.push(OracleMessage::new(
                Role::System,
                build_pending_context(&relation.record, &relation.record.missing_fields()),
            ));
        } else if let Some(pending) = &ctx.pending_record {
            messages.push(OracleMessage::new(
                Role::System,
                build_pending_context(pending, &ctx.missing_fields),
            ));
        }
        messages.push(OracleMessage::new(Role::User, request.message.clone()));

        self.oracle
            .function_call(&system_prompt, &messages, &tools, &self.options.model)
            .await
    }

    async fn dispatch_tool(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
        tool_name: &str,
        arguments: Value,
    ) -> TurnResponse {
        let Some(kind) = ToolKind::from_name(tool_name) else {
            tracing::warn!(
                event_name = "engine.unknown_tool",
                tool = %tool_name,
                chat_id = %request.chat_id,
                "oracle selected a tool that does not exist"
            );
            return TurnResponse::unhandled(REPLY_MISUNDERSTOOD);
        };

        let requested_type = arguments.get("record_type").and_then(|v| v.as_str());
        let table = resolve_table(kind, requested_type, &turn.tables);
        if table.is_none() && requested_type.is_some() {
            tracing::warn!(
                event_name = "engine.table_unresolved",
                requested = requested_type.unwrap_or(""),
                available = %turn.tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(","),
                tool = %tool_name,
                "record_type did not match any tenant table"
            );
        }

        match kind {
            ToolKind::CreateRecord => {
                self.handle_create(request, turn, ctx, table, &arguments).await
            }
            ToolKind::QueryRecords
            | ToolKind::UpdateRecord
            | ToolKind::CheckAvailability
            | ToolKind::AnalyzeData
            | ToolKind::GeneralConversation => {
                self.route_side_tool(request, turn, ctx, table, &arguments, kind).await
            }
            ToolKind::SetupWorkspace => self.handle_setup(request, &arguments).await,
            ToolKind::CreateFlow => {
                self.handle_create_flow(request, turn, ctx, table, &arguments).await
            }
        }
    }

    async fn classify(&self, message: &str) -> Classification {
        if message.trim().is_empty() {
            return Classification { is_valid: false, category: MessageCategory::Garbage };
        }
        let cache_key = normalize_name(message);
        if let Some(hit) = self.classification_cache.get(&cache_key) {
            return hit;
        }
        match self.oracle.classify(message).await {
            Ok(classification) => {
                self.classification_cache.insert(cache_key, classification);
                classification
            }
            Err(error) => {
                // A broken classifier must not block legitimate users.
                tracing::warn!(
                    event_name = "engine.classification_failed",
                    error = %error,
                    "treating message as valid by default"
                );
                Classification::valid()
            }
        }
    }

    pub(crate) fn with_reminder(&self, ctx: &ChatContext, reply: &str) -> String {
        match pending_reminder(ctx) {
            Some(reminder) => format!("{reply}\n\n{reminder}"),
            None => reply.to_string(),
        }
    }

    pub(crate) async fn handle_undo(&self, request: &TurnRequest) -> TurnResponse {
        // Day-old entries are not offered for undo.
        self.actions.clean_old(&request.workspace_id);
        let Some(action) = self
            .actions
            .get_last_undoable(&request.workspace_id, Some(&request.chat_id))
        else {
            return TurnResponse::handled("No hay ninguna acción reciente que pueda deshacer.");
        };

        let instructions = rollback_instructions(&action);
        let result = match instructions.operation {
            RollbackOperation::Delete => {
                let record_id = instructions.record_id.as_deref().unwrap_or_default();
                self.records
                    .delete(&request.workspace_id, &instructions.table_id, record_id)
                    .await
                    .map(|_| ())
            }
            RollbackOperation::Update => {
                let record_id = instructions.record_id.as_deref().unwrap_or_default();
                self.records
                    .update(
                        &request.workspace_id,
                        &instructions.table_id,
                        record_id,
                        instructions.data.clone().unwrap_or_default(),
                    )
                    .await
                    .map(|_| ())
            }
            RollbackOperation::Create => self
                .records
                .create(
                    &request.workspace_id,
                    &instructions.table_id,
                    instructions.data.clone().unwrap_or_default(),
                )
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => {
                self.actions.mark_undone(&request.workspace_id, &action.id);
                TurnResponse::handled(instructions.message)
            }
            Err(error) => {
                tracing::error!(
                    event_name = "engine.undo_failed",
                    action_id = %action.id,
                    error = %error,
                    "rollback execution failed"
                );
                TurnResponse::handled("No pude deshacer la última acción. Inténtalo de nuevo.")
            }
        }
    }
}

pub(crate) fn pending_reminder(ctx: &ChatContext) -> Option<String> {
    let pending = ctx.pending_record.as_ref()?;
    if ctx.missing_fields.is_empty() {
        return None;
    }
    Some(format!(
        "Recuerda que estábamos registrando tu {}. Nos falta: {}.",
        pending.table_name,
        ctx.missing_fields.join(", ")
    ))
}

fn canned_reply(category: MessageCategory) -> &'static str {
    match category {
        MessageCategory::Garbage => {
            "No logré entender tu mensaje. ¿Puedes escribirlo de otra forma?"
        }
        MessageCategory::Spam => "Este canal es para atender solicitudes del negocio.",
        MessageCategory::Abuse => {
            "Estoy aquí para ayudarte; mantengamos la conversación con respeto."
        }
        MessageCategory::OffTopic => {
            "Puedo ayudarte con la información del negocio. ¿Qué necesitas?"
        }
        MessageCategory::Valid => REPLY_MISUNDERSTOOD,
    }
}

/// Map the oracle's free-text `record_type` to a tenant table: exact
/// normalized name, then substring in either direction, then singular/plural
/// tolerance. An unresolved `create_record` falls back to a table that
/// structurally looks like an appointment book.
pub(crate) fn resolve_table(
    kind: ToolKind,
    requested: Option<&str>,
    tables: &[TableConfig],
) -> Option<TableConfig> {
    let fallback = || {
        (kind == ToolKind::CreateRecord)
            .then(|| tables.iter().find(|t| t.looks_like_appointments()).cloned())
            .flatten()
    };

    let Some(requested) = requested else { return fallback() };
    let needle = normalize_name(requested);
    if needle.is_empty() {
        return fallback();
    }

    if let Some(table) = tables.iter().find(|t| normalize_name(&t.name) == needle) {
        return Some(table.clone());
    }
    if let Some(table) = tables.iter().find(|t| {
        let name = normalize_name(&t.name);
        name.contains(&needle) || needle.contains(&name)
    }) {
        return Some(table.clone());
    }
    if let Some(table) =
        tables.iter().find(|t| clerky_core::schema::names_match_loosely(&t.name, requested))
    {
        return Some(table.clone());
    }

    fallback()
}

#[cfg(test)]
mod tests {
    use clerky_core::schema::{FieldSpec, FieldType, TableConfig, TableId};

    use crate::tools::ToolKind;

    use super::{canned_reply, resolve_table};
    use crate::llm::MessageCategory;

    fn table(name: &str, fields: Vec<FieldSpec>) -> TableConfig {
        TableConfig {
            id: TableId(format!("tbl-{}", name.to_lowercase())),
            workspace_id: "ws-1".to_string(),
            name: name.to_string(),
            fields,
            rules: Vec::new(),
        }
    }

    fn tenant_tables() -> Vec<TableConfig> {
        vec![
            table(
                "Citas",
                vec![
                    FieldSpec::new("fecha", "Fecha", FieldType::Date).required(),
                    FieldSpec::new("hora", "Hora", FieldType::Time).required(),
                ],
            ),
            table("Clientes", vec![FieldSpec::new("nombre", "Nombre", FieldType::Text)]),
        ]
    }

    #[test]
    fn table_resolution_tries_exact_then_substring_then_plural() {
        let tables = tenant_tables();

        let exact = resolve_table(ToolKind::QueryRecords, Some("citas"), &tables);
        assert_eq!(exact.unwrap().name, "Citas");

        let substring = resolve_table(ToolKind::QueryRecords, Some("tabla de clientes"), &tables);
        assert_eq!(substring.unwrap().name, "Clientes");

        let singular = resolve_table(ToolKind::QueryRecords, Some("cita"), &tables);
        assert_eq!(singular.unwrap().name, "Citas");
    }

    #[test]
    fn unresolved_create_falls_back_to_appointment_like_table() {
        let tables = tenant_tables();

        let fallback = resolve_table(ToolKind::CreateRecord, Some("reservaciones"), &tables);
        assert_eq!(fallback.unwrap().name, "Citas");

        // Non-create tools degrade to None instead.
        let none = resolve_table(ToolKind::QueryRecords, Some("reservaciones"), &tables);
        assert!(none.is_none());
    }

    #[test]
    fn every_invalid_category_has_a_canned_reply() {
        for category in [
            MessageCategory::Garbage,
            MessageCategory::Spam,
            MessageCategory::Abuse,
            MessageCategory::OffTopic,
        ] {
            assert!(!canned_reply(category).is_empty());
        }
    }
}
