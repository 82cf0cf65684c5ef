//! Domain handlers behind the tool dispatch.
//!
//! Each handler turns a canonical action (tool + resolved table + untrusted
//! arguments) into repository calls and a natural-language reply. Handlers
//! never throw past the engine: repository and oracle failures degrade to
//! apologetic replies.

use serde_json::{json, Map, Value};

use clerky_core::confirm::{render_preview, ConfirmationDraft, ConfirmationReply, ConfirmationState};
use clerky_core::context::{ChatContext, PendingRecord, PendingRelation, Role};
use clerky_core::flows::{FlowKind, FlowPatch, FlowRequest, FlowStatus, FlowTemplate};
use clerky_core::history::{ActionInput, ActionKind};
use clerky_core::rules::RuleEngine;
use clerky_core::schema::{FieldType, TableConfig};
use clerky_core::validate::{validate_all, validate_field, BatchOptions, ValidateOptions};

use crate::collector::{Extraction, NewRelatedRecord};
use crate::engine::{
    pending_reminder, resolve_table, ChatEngine, TurnRequest, TurnResponse, TurnState,
    REPLY_MISUNDERSTOOD,
};
use crate::llm::OracleMessage;
use crate::quick::{classify_flow_sub_intent, FlowSubIntent};
use crate::tools::ToolKind;

const ACTION_CREATE: &str = "create";
const ACTION_CONFIRM_RELATION: &str = "confirm_relation";

impl ChatEngine {
    // ------------------------------------------------------------------
    // Confirmation sub-dialogue
    // ------------------------------------------------------------------

    pub(crate) async fn process_confirmation_reply(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
    ) -> TurnResponse {
        let Some(state) = self.confirmations.get(&request.chat_id) else {
            return TurnResponse::handled(REPLY_MISUNDERSTOOD);
        };

        match self.confirmations.process_response(&request.chat_id, &request.message) {
            ConfirmationReply::Confirmed { data } => {
                if state.action == ACTION_CONFIRM_RELATION {
                    self.accept_relation_candidate(request, turn, ctx, &data).await
                } else {
                    self.finalize_confirmed_create(request, turn, ctx, &state, data).await
                }
            }
            ConfirmationReply::Cancelled => {
                if state.action == ACTION_CONFIRM_RELATION {
                    let field = state
                        .data
                        .get("field")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let label = ctx
                        .pending_record
                        .as_ref()
                        .and_then(|p| p.spec(&field))
                        .map(|s| s.label.clone())
                        .unwrap_or(field);
                    TurnResponse::handled(format!(
                        "De acuerdo. ¿Entonces cuál es el valor correcto para {label}?"
                    ))
                } else {
                    self.cancel_active_collection(
                        request,
                        ctx,
                        "De acuerdo, cancelé el registro. ¿Te ayudo con algo más?",
                    )
                }
            }
            ConfirmationReply::Editing { field, current_value } => {
                let current = current_value
                    .map(|v| display_value(&v))
                    .unwrap_or_else(|| "(vacío)".to_string());
                TurnResponse::handled(format!(
                    "Claro, ¿cuál es el nuevo valor para {field}? (actual: {current})"
                ))
            }
            ConfirmationReply::Edited { field, old_value, new_value } => {
                self.validate_confirmation_edit(request, turn, ctx, &field, old_value, new_value)
            }
            ConfirmationReply::Expired => {
                // Stale confirmations are never acted on; rebuild from the
                // still-complete draft so the user re-approves fresh data.
                if let Some(pending) = ctx.pending_record.clone() {
                    let state = self.create_confirmation_for(&request.chat_id, &pending);
                    let preview = render_preview(&state, &pending.fields_config);
                    TurnResponse::handled(format!(
                        "La confirmación anterior expiró. Estos son los datos de nuevo:\n{preview}"
                    ))
                } else {
                    TurnResponse::handled(
                        "La confirmación expiró y ya no tengo los datos. Empecemos de nuevo.",
                    )
                }
            }
            ConfirmationReply::Unknown => TurnResponse::handled(
                "Responde \"sí\" para confirmar, \"no\" para cancelar, o dime qué campo \
                 cambiar (por ejemplo: cambiar hora).",
            ),
        }
    }

    async fn accept_relation_candidate(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
        data: &Map<String, Value>,
    ) -> TurnResponse {
        let field = data.get("field").and_then(Value::as_str).unwrap_or_default().to_string();
        let candidate = data.get("candidate").cloned().unwrap_or(Value::Null);

        if let Some(pending) = ctx.pending_record.as_mut() {
            pending.merge_validated([(field, candidate)].into_iter().collect());
        }
        ctx.update_missing_fields();
        self.finish_or_ask(request, turn, ctx).await
    }

    fn validate_confirmation_edit(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &ChatContext,
        field: &str,
        old_value: Option<Value>,
        new_value: Value,
    ) -> TurnResponse {
        let Some(mut state) = self.confirmations.get(&request.chat_id) else {
            return TurnResponse::handled(REPLY_MISUNDERSTOOD);
        };
        let spec = turn
            .tables
            .iter()
            .find(|t| t.id == state.table_id)
            .and_then(|t| t.field(field).cloned())
            .or_else(|| ctx.pending_record.as_ref().and_then(|p| p.spec(field).cloned()));

        let Some(spec) = spec else {
            // No schema to check against; keep the raw edit.
            let preview = render_preview(&state, &[]);
            return TurnResponse::handled(preview);
        };

        let result = validate_field(field, Some(&new_value), &spec, ValidateOptions::default());
        if result.valid {
            if let Some(normalized) = result.normalized {
                state.data.insert(field.to_string(), normalized);
                self.confirmations.restore(&request.chat_id, state.clone());
            }
            let specs = turn
                .tables
                .iter()
                .find(|t| t.id == state.table_id)
                .map(|t| t.fields.clone())
                .unwrap_or_default();
            TurnResponse::handled(render_preview(&state, &specs))
        } else {
            // Put the old value back and stay in editing.
            match old_value {
                Some(old) => {
                    state.data.insert(field.to_string(), old);
                }
                None => {
                    state.data.remove(field);
                }
            }
            state.status = clerky_core::confirm::ConfirmationStatus::Editing;
            state.editing_field = Some(field.to_string());
            self.confirmations.restore(&request.chat_id, state);
            let message =
                result.error.unwrap_or_else(|| format!("{field} no es válido"));
            TurnResponse::handled(format!("{message}. Intenta de nuevo."))
        }
    }

    async fn finalize_confirmed_create(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
        state: &ConfirmationState,
        mut data: Map<String, Value>,
    ) -> TurnResponse {
        let table_cfg = turn.tables.iter().find(|t| t.id == state.table_id);
        let mut warnings = Vec::new();

        if let Some(cfg) = table_cfg {
            let outcome = RuleEngine::new().evaluate(&cfg.rules, &data);
            if !outcome.errors.is_empty() {
                // Re-open the confirmation so the user can fix the field.
                self.confirmations.create_pending(
                    &request.chat_id,
                    ConfirmationDraft {
                        action: state.action.clone(),
                        table_name: state.table_name.clone(),
                        table_id: state.table_id.clone(),
                        data: data.clone(),
                        field_order: state.field_order.clone(),
                    },
                );
                return TurnResponse::handled(format!(
                    "Antes de guardar hay que corregir: {}. Dime qué campo cambiar.",
                    outcome.errors.join("; ")
                ));
            }
            for (key, value) in outcome.defaults {
                data.insert(key, value);
            }
            warnings = outcome.warnings;
        }

        let record = match self
            .records
            .create(&request.workspace_id, &state.table_id, data.clone())
            .await
        {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(
                    event_name = "engine.record_create_failed",
                    table = %state.table_name,
                    error = %error,
                    "write failed after confirmation"
                );
                return TurnResponse::handled(
                    "No pude guardar el registro. Inténtalo de nuevo en un momento.",
                );
            }
        };

        self.actions.record(
            &request.workspace_id,
            ActionInput {
                kind: ActionKind::Create,
                table_id: state.table_id.clone(),
                table_name: state.table_name.clone(),
                record_id: record.id.clone(),
                previous_data: None,
                new_data: Some(data),
                chat_id: request.chat_id.clone(),
            },
        );

        let follow_up = self
            .flows
            .get_active(&request.chat_id)
            .filter(|flow| flow.table_id == state.table_id)
            .and_then(|flow| {
                self.flows.complete(
                    &request.chat_id,
                    &flow.id,
                    json!({ "record_id": record.id }),
                )
            });

        ctx.clear_pending_record();

        let mut reply = format!("Listo, quedó registrado en {}.", state.table_name);
        if !warnings.is_empty() {
            reply.push_str(&format!(" Nota: {}.", warnings.join("; ")));
        }

        if let Some(next) = follow_up {
            if let Some(next_table) = turn.tables.iter().find(|t| t.id == next.table_id) {
                self.flows.mark_in_progress(&request.chat_id, &next.id);
                ctx.init_pending_record(
                    next_table.id.clone(),
                    next_table.name.clone(),
                    next_table.required_field_keys(),
                    next_table.fields.clone(),
                );
                let seeds: Map<String, Value> = next
                    .collected_fields
                    .iter()
                    .filter(|(key, _)| !key.starts_with('_'))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                ctx.apply_defaults(seeds);
                reply.push_str(&format!(
                    " Ahora sigamos con {}: {}",
                    next_table.name,
                    self.ask_next_missing(ctx)
                ));
                return TurnResponse::handled(reply);
            }
        }

        if let Some(resumed) = self.resume_most_recent_paused(request, turn, ctx) {
            reply.push_str(&format!(" {resumed}"));
        }
        TurnResponse::handled(reply)
    }

    fn resume_most_recent_paused(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
    ) -> Option<String> {
        let paused = self
            .flows
            .list(&request.chat_id)
            .into_iter()
            .filter(|f| f.status == FlowStatus::Paused && f.depends_on.is_none())
            .max_by_key(|f| f.created_at)?;
        let table = turn.tables.iter().find(|t| t.id == paused.table_id)?;

        self.flows.mark_in_progress(&request.chat_id, &paused.id);
        ctx.init_pending_record(
            table.id.clone(),
            table.name.clone(),
            table.required_field_keys(),
            table.fields.clone(),
        );
        ctx.apply_defaults(paused.collected_fields.clone());
        Some(format!(
            "Retomemos tu {} pendiente: {}",
            table.name,
            self.ask_next_missing(ctx)
        ))
    }

    // ------------------------------------------------------------------
    // create_record
    // ------------------------------------------------------------------

    pub(crate) async fn handle_create(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
        table: Option<TableConfig>,
        arguments: &Value,
    ) -> TurnResponse {
        if ctx.pending_relation.is_some() {
            return self.continue_relation(request, turn, ctx).await;
        }

        let Some(table) = table else {
            return TurnResponse::unhandled(REPLY_MISUNDERSTOOD);
        };

        let same_table =
            ctx.pending_record.as_ref().map(|pending| pending.table_id == table.id);
        match same_table {
            Some(true) => self.continue_collection(request, turn, ctx).await,
            Some(false) => {
                // Switching targets mid-flow: park the current draft on its
                // flow entry; starting the new one demotes it to PAUSED.
                let parked = ctx.collected_fields();
                if let Some(active) = self.flows.get_active(&request.chat_id) {
                    self.flows.update_flow(
                        &request.chat_id,
                        &active.id,
                        FlowPatch {
                            collected_fields: Some(parked),
                            ..FlowPatch::default()
                        },
                    );
                }
                ctx.clear_pending_record();
                self.start_collection(request, turn, ctx, &table, arguments, None).await
            }
            None => self.start_collection(request, turn, ctx, &table, arguments, None).await,
        }
    }

    pub(crate) async fn start_collection(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
        table: &TableConfig,
        arguments: &Value,
        on_complete: Option<FlowTemplate>,
    ) -> TurnResponse {
        let seed = arguments
            .get("fields")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut required = table.required_field_keys();
        let outcome = RuleEngine::new().evaluate(&table.rules, &seed);
        for extra in &outcome.required_fields {
            if !required.contains(extra) {
                required.push(extra.clone());
            }
        }
        required.retain(|key| !outcome.hidden_fields.contains(key));

        ctx.init_pending_record(
            table.id.clone(),
            table.name.clone(),
            required,
            table.fields.clone(),
        );

        let mut defaults = table.default_values();
        defaults.extend(outcome.defaults);
        ctx.apply_defaults(defaults);

        let flow_id = self.flows.push(FlowRequest {
            chat_id: request.chat_id.clone(),
            kind: Some(FlowKind::Create),
            table_id: Some(table.id.clone()),
            table_name: table.name.clone(),
            on_complete,
            ..FlowRequest::default()
        });
        self.flows.mark_in_progress(&request.chat_id, &flow_id);

        if !seed.is_empty() {
            if let Some(pending) = ctx.pending_record.clone() {
                let extraction = self
                    .collector
                    .validate_candidates(&request.workspace_id, &pending, seed)
                    .await;
                if let Some(response) =
                    self.apply_extraction(request, turn, ctx, extraction).await
                {
                    return response;
                }
            }
        }

        self.finish_or_ask(request, turn, ctx).await
    }

    async fn continue_collection(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
    ) -> TurnResponse {
        let Some(pending) = ctx.pending_record.clone() else {
            return TurnResponse::unhandled(REPLY_MISUNDERSTOOD);
        };

        let extraction = self
            .collector
            .extract_fields(
                &request.workspace_id,
                &request.message,
                &pending,
                &ctx.history,
                request.date_context,
            )
            .await;

        if extraction.wants_to_change_flow {
            match classify_flow_sub_intent(&request.message) {
                FlowSubIntent::CancelFlow => {
                    return self.cancel_active_collection(
                        request,
                        ctx,
                        "Sin problema, cancelé el registro. ¿Qué más necesitas?",
                    );
                }
                FlowSubIntent::Continue | FlowSubIntent::Thanks => {
                    return TurnResponse::handled(self.ask_next_missing(ctx));
                }
                FlowSubIntent::Other => {
                    let intent = extraction
                        .new_intent
                        .clone()
                        .unwrap_or_else(|| "otra cosa".to_string());
                    let reminder =
                        pending_reminder(ctx).unwrap_or_default();
                    return TurnResponse::handled(format!(
                        "Entiendo que ahora quieres {intent}. {reminder} \
                         ¿Continuamos con el registro o lo cancelo?"
                    ));
                }
            }
        }

        // "mejor cambia la fecha" mid-collection: reopen the field so the
        // next answer lands there.
        if let Some(field) = extraction.wants_to_change_field.clone() {
            let reopened = ctx
                .pending_record
                .as_mut()
                .filter(|p| p.spec(&field).is_some())
                .map(|p| {
                    p.fields.remove(&field);
                    p.spec(&field).cloned()
                })
                .flatten();
            ctx.update_missing_fields();
            if extraction.extracted_fields.is_empty() {
                if let Some(spec) = reopened {
                    return TurnResponse::handled(
                        spec.ask_prompt
                            .unwrap_or_else(|| format!("Claro, ¿cuál es {}?", spec.label)),
                    );
                }
            }
        }

        if let Some(response) = self.apply_extraction(request, turn, ctx, extraction).await {
            return response;
        }
        self.finish_or_ask(request, turn, ctx).await
    }

    /// Apply extraction side effects. Returns a response when the extraction
    /// decided the turn (relation clarification, validation error, nested
    /// record start); `None` means the caller continues to completion/ask.
    async fn apply_extraction(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
        extraction: Extraction,
    ) -> Option<TurnResponse> {
        if !extraction.extracted_fields.is_empty() {
            ctx.merge_fields(extraction.extracted_fields.clone());
            if let Some(active) = self.flows.get_active(&request.chat_id) {
                self.flows.update_flow(
                    &request.chat_id,
                    &active.id,
                    FlowPatch {
                        collected_fields: Some(ctx.collected_fields()),
                        ..FlowPatch::default()
                    },
                );
            }
        }

        if let Some(confirmation) = extraction.confirmation_needed {
            let pending = ctx.pending_record.as_ref()?;
            let mut data = Map::new();
            data.insert("field".to_string(), json!(confirmation.field));
            data.insert("candidate".to_string(), json!(confirmation.candidate));
            self.confirmations.create_pending(
                &request.chat_id,
                ConfirmationDraft {
                    action: ACTION_CONFIRM_RELATION.to_string(),
                    table_name: pending.table_name.clone(),
                    table_id: pending.table_id.clone(),
                    data,
                    field_order: Vec::new(),
                },
            );
            return Some(TurnResponse::handled(format!(
                "¿Te refieres a {}? (sí / no)",
                confirmation.candidate
            )));
        }

        if let Some(nested) = extraction.needs_new_related_record {
            return Some(self.start_relation(request, turn, ctx, nested).await);
        }

        if let Some(error) = extraction.relation_error {
            return Some(TurnResponse::handled(error.message));
        }

        if let Some(first_error) = extraction.field_errors.first() {
            return Some(TurnResponse::handled(format!(
                "{}. ¿Me lo repites?",
                first_error.message
            )));
        }

        if extraction.extracted_fields.is_empty() {
            if let Some(clarification) = extraction.clarification_needed {
                return Some(TurnResponse::handled(clarification));
            }
        }

        None
    }

    async fn start_relation(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
        nested: NewRelatedRecord,
    ) -> TurnResponse {
        let Some(related_table) = turn
            .tables
            .iter()
            .find(|t| clerky_core::schema::names_match_loosely(&t.name, &nested.table_name))
            .cloned()
        else {
            return TurnResponse::handled(format!(
                "No encontré \"{}\" y la tabla {} no está configurada para crearlo.",
                nested.initial_value, nested.table_name
            ));
        };

        let search_field = ctx
            .pending_record
            .as_ref()
            .and_then(|p| p.spec(&nested.field))
            .and_then(|s| s.relation.as_ref())
            .map(|r| r.search_field.clone());

        let mut record = PendingRecord {
            table_id: related_table.id.clone(),
            table_name: related_table.name.clone(),
            fields: Map::new(),
            required_fields: related_table.required_field_keys(),
            fields_config: related_table.fields.clone(),
        };

        if let Some(search_key) = search_field {
            if let Some(spec) = related_table.field(&search_key) {
                let candidate = Value::String(nested.initial_value.clone());
                let result =
                    validate_field(&search_key, Some(&candidate), spec, ValidateOptions::default());
                if let (true, Some(normalized)) = (result.valid, result.normalized) {
                    record.fields.insert(search_key, normalized);
                }
            }
        }

        if record.missing_fields().is_empty() {
            // Nothing else to ask; create the related record right away.
            return self
                .create_related_record(request, turn, ctx, nested.field, record)
                .await;
        }

        let ask = record
            .missing_fields()
            .first()
            .and_then(|key| record.spec(key).cloned())
            .map(|spec| {
                spec.ask_prompt.unwrap_or_else(|| format!("¿Cuál es {}?", spec.label))
            })
            .unwrap_or_else(|| "¿Me das los datos?".to_string());
        let reply = format!(
            "No tengo registrado a \"{}\"; lo agrego a {}. {ask}",
            nested.initial_value, related_table.name
        );
        ctx.pending_relation = Some(PendingRelation { parent_field: nested.field, record });
        TurnResponse::handled(reply)
    }

    async fn continue_relation(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
    ) -> TurnResponse {
        let Some(relation) = ctx.pending_relation.clone() else {
            return TurnResponse::unhandled(REPLY_MISUNDERSTOOD);
        };

        let extraction = self
            .collector
            .extract_fields(
                &request.workspace_id,
                &request.message,
                &relation.record,
                &ctx.history,
                request.date_context,
            )
            .await;

        let mut record = relation.record.clone();
        record.merge_validated(extraction.extracted_fields.clone());

        if let Some(first_error) = extraction.field_errors.first() {
            ctx.pending_relation =
                Some(PendingRelation { parent_field: relation.parent_field, record });
            return TurnResponse::handled(format!("{}. ¿Me lo repites?", first_error.message));
        }

        if record.missing_fields().is_empty() {
            return self
                .create_related_record(request, turn, ctx, relation.parent_field, record)
                .await;
        }

        let ask = record
            .missing_fields()
            .first()
            .and_then(|key| record.spec(key).cloned())
            .map(|spec| spec.ask_prompt.unwrap_or_else(|| format!("¿Cuál es {}?", spec.label)))
            .unwrap_or_else(|| "¿Me das el siguiente dato?".to_string());
        ctx.pending_relation =
            Some(PendingRelation { parent_field: relation.parent_field, record });
        TurnResponse::handled(ask)
    }

    async fn create_related_record(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
        parent_field: String,
        record: PendingRecord,
    ) -> TurnResponse {
        let created = match self
            .records
            .create(&request.workspace_id, &record.table_id, record.fields.clone())
            .await
        {
            Ok(created) => created,
            Err(error) => {
                tracing::error!(
                    event_name = "engine.related_create_failed",
                    table = %record.table_name,
                    error = %error,
                    "nested record write failed"
                );
                ctx.pending_relation = Some(PendingRelation {
                    parent_field,
                    record,
                });
                return TurnResponse::handled(
                    "No pude guardar el registro relacionado. Inténtalo de nuevo.",
                );
            }
        };

        self.actions.record(
            &request.workspace_id,
            ActionInput {
                kind: ActionKind::Create,
                table_id: record.table_id.clone(),
                table_name: record.table_name.clone(),
                record_id: created.id.clone(),
                previous_data: None,
                new_data: Some(record.fields.clone()),
                chat_id: request.chat_id.clone(),
            },
        );

        // Link the parent draft through the relation's display field.
        let display_key = ctx
            .pending_record
            .as_ref()
            .and_then(|p| p.spec(&parent_field))
            .and_then(|s| s.relation.as_ref())
            .map(|r| r.display_field.clone());
        let link_value = display_key
            .and_then(|key| created.data.get(&key).cloned())
            .unwrap_or_else(|| {
                created
                    .data
                    .values()
                    .next()
                    .cloned()
                    .unwrap_or(Value::Null)
            });

        if let Some(pending) = ctx.pending_record.as_mut() {
            pending
                .merge_validated([(parent_field, link_value)].into_iter().collect());
        }
        ctx.pending_relation = None;
        ctx.update_missing_fields();

        let prefix = format!("Listo, agregué el nuevo registro a {}.", record.table_name);
        let rest = self.finish_or_ask(request, turn, ctx).await;
        TurnResponse { reply: format!("{prefix} {}", rest.reply), handled: rest.handled }
    }

    pub(crate) async fn finish_or_ask(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
    ) -> TurnResponse {
        if !ctx.is_complete() {
            return TurnResponse::handled(self.ask_next_missing(ctx));
        }
        let Some(pending) = ctx.pending_record.clone() else {
            return TurnResponse::handled(REPLY_MISUNDERSTOOD);
        };

        let mut warnings = Vec::new();
        if let Some(cfg) = turn.tables.iter().find(|t| t.id == pending.table_id) {
            let outcome = RuleEngine::new().evaluate(&cfg.rules, &pending.fields);
            if !outcome.errors.is_empty() {
                return TurnResponse::handled(format!(
                    "Hay que corregir algo antes de continuar: {}.",
                    outcome.errors.join("; ")
                ));
            }
            warnings = outcome.warnings;
        }

        let state = self.create_confirmation_for(&request.chat_id, &pending);
        let preview = render_preview(&state, &pending.fields_config);
        let mut reply = preview;
        if !warnings.is_empty() {
            reply.push_str(&format!("\nNota: {}.", warnings.join("; ")));
        }
        TurnResponse::handled(reply)
    }

    pub(crate) fn create_confirmation_for(
        &self,
        chat_id: &str,
        pending: &PendingRecord,
    ) -> ConfirmationState {
        self.confirmations.create_pending(
            chat_id,
            ConfirmationDraft {
                action: ACTION_CREATE.to_string(),
                table_name: pending.table_name.clone(),
                table_id: pending.table_id.clone(),
                data: pending.fields.clone(),
                field_order: pending.present_keys_in_schema_order(),
            },
        )
    }

    pub(crate) fn ask_next_missing(&self, ctx: &ChatContext) -> String {
        match ctx.next_missing_spec() {
            Some(spec) => spec
                .ask_prompt
                .clone()
                .unwrap_or_else(|| format!("¿Cuál es {}?", spec.label)),
            None => REPLY_MISUNDERSTOOD.to_string(),
        }
    }

    pub(crate) fn cancel_active_collection(
        &self,
        request: &TurnRequest,
        ctx: &mut ChatContext,
        reply: &str,
    ) -> TurnResponse {
        if let Some(active) = self.flows.get_active(&request.chat_id) {
            self.flows.cancel(&request.chat_id, &active.id);
        }
        self.confirmations.discard(&request.chat_id);
        ctx.clear_pending_record();
        TurnResponse::handled(reply)
    }

    // ------------------------------------------------------------------
    // Side tools: query / update / availability / analyze / conversation
    // ------------------------------------------------------------------

    pub(crate) async fn route_side_tool(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
        table: Option<TableConfig>,
        arguments: &Value,
        kind: ToolKind,
    ) -> TurnResponse {
        // A side question during an active collection flow: decide whether
        // to interrupt it before serving anything.
        if ctx.pending_record.is_some() {
            match classify_flow_sub_intent(&request.message) {
                FlowSubIntent::CancelFlow => {
                    return self.cancel_active_collection(
                        request,
                        ctx,
                        "Sin problema, cancelé el registro. ¿Qué más necesitas?",
                    );
                }
                FlowSubIntent::Continue => {
                    return TurnResponse::handled(self.ask_next_missing(ctx));
                }
                FlowSubIntent::Thanks => {
                    return TurnResponse::handled(self.with_reminder(ctx, "¡De nada!"));
                }
                FlowSubIntent::Other => {}
            }
        }

        let response = match kind {
            ToolKind::QueryRecords => self.handle_query(request, table, arguments).await,
            ToolKind::UpdateRecord => self.handle_update(request, table, arguments).await,
            ToolKind::CheckAvailability => {
                self.handle_availability(request, turn, table, arguments).await
            }
            ToolKind::AnalyzeData => self.handle_analyze(request, table).await,
            ToolKind::GeneralConversation => self.handle_general(request, ctx).await,
            _ => TurnResponse::unhandled(REPLY_MISUNDERSTOOD),
        };

        TurnResponse {
            reply: self.with_reminder(ctx, &response.reply),
            handled: response.handled,
        }
    }

    async fn handle_query(
        &self,
        request: &TurnRequest,
        table: Option<TableConfig>,
        arguments: &Value,
    ) -> TurnResponse {
        let Some(table) = table else {
            return TurnResponse::unhandled(REPLY_MISUNDERSTOOD);
        };
        let filters = arguments
            .get("filters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let limit = arguments
            .get("limit")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(self.options.max_query_rows);

        let records = match self
            .records
            .query(&request.workspace_id, &table.id, &filters)
            .await
        {
            Ok(records) => records,
            Err(error) => {
                tracing::error!(
                    event_name = "engine.query_failed",
                    table = %table.name,
                    error = %error,
                    "record query failed"
                );
                return TurnResponse::handled(
                    "No pude consultar los registros en este momento.",
                );
            }
        };

        if records.is_empty() {
            let qualifier = if filters.is_empty() { "" } else { " con esos datos" };
            return TurnResponse::handled(format!(
                "No encontré registros de {}{qualifier}.",
                table.name
            ));
        }

        let mut lines = vec![format!("Encontré {} en {}:", records.len(), table.name)];
        for record in records.iter().take(limit) {
            lines.push(format!("• {}", summarize_record(&record.data, &table)));
        }
        if records.len() > limit {
            lines.push(format!("… y {} más.", records.len() - limit));
        }
        TurnResponse::handled(lines.join("\n"))
    }

    async fn handle_update(
        &self,
        request: &TurnRequest,
        table: Option<TableConfig>,
        arguments: &Value,
    ) -> TurnResponse {
        let Some(table) = table else {
            return TurnResponse::unhandled(REPLY_MISUNDERSTOOD);
        };
        let Some(fields) = arguments.get("fields").and_then(Value::as_object).cloned() else {
            return TurnResponse::handled("¿Qué campo quieres cambiar y a qué valor?");
        };

        let target = if let Some(record_id) = arguments.get("record_id").and_then(Value::as_str)
        {
            match self.records.get(&request.workspace_id, &table.id, record_id).await {
                Ok(found) => found,
                Err(_) => None,
            }
        } else {
            let filters = arguments
                .get("filters")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            if filters.is_empty() {
                return TurnResponse::handled(format!(
                    "¿Cuál registro de {} quieres actualizar? Dame algún dato para ubicarlo.",
                    table.name
                ));
            }
            match self.records.query(&request.workspace_id, &table.id, &filters).await {
                Ok(matches) if matches.len() > 1 => {
                    let listed = matches
                        .iter()
                        .take(5)
                        .map(|r| format!("• {}", summarize_record(&r.data, &table)))
                        .collect::<Vec<_>>()
                        .join("\n");
                    return TurnResponse::handled(format!(
                        "Encontré varios registros que coinciden. ¿Cuál de estos?\n{listed}"
                    ));
                }
                Ok(mut matches) => matches.pop(),
                Err(_) => None,
            }
        };

        let Some(existing) = target else {
            return TurnResponse::handled(format!(
                "No encontré el registro de {} que quieres cambiar.",
                table.name
            ));
        };

        let validation = validate_all(&fields, &table.fields, BatchOptions { is_partial: true });
        if !validation.valid {
            let first = &validation.errors[0];
            return TurnResponse::handled(format!("{}. ¿Me lo repites?", first.message));
        }

        let previous = existing.data.clone();
        let updated = match self
            .records
            .update(&request.workspace_id, &table.id, &existing.id, fields.clone())
            .await
        {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                return TurnResponse::handled(format!(
                    "No encontré el registro de {} que quieres cambiar.",
                    table.name
                ));
            }
            Err(error) => {
                tracing::error!(
                    event_name = "engine.record_update_failed",
                    table = %table.name,
                    error = %error,
                    "update failed"
                );
                return TurnResponse::handled("No pude actualizar el registro.");
            }
        };

        self.actions.record(
            &request.workspace_id,
            ActionInput {
                kind: ActionKind::Update,
                table_id: table.id.clone(),
                table_name: table.name.clone(),
                record_id: updated.id.clone(),
                previous_data: Some(previous),
                new_data: Some(updated.data.clone()),
                chat_id: request.chat_id.clone(),
            },
        );

        let changed = fields.keys().cloned().collect::<Vec<_>>().join(", ");
        TurnResponse::handled(format!("Actualicé {} ({changed}).", table.name))
    }

    async fn handle_availability(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        table: Option<TableConfig>,
        arguments: &Value,
    ) -> TurnResponse {
        let table = table.or_else(|| {
            turn.tables.iter().find(|t| t.looks_like_appointments()).cloned()
        });
        let Some(table) = table else {
            return TurnResponse::handled(
                "Este espacio de trabajo no tiene una agenda configurada.",
            );
        };
        let Some(date_key) = table
            .fields
            .iter()
            .find(|f| f.field_type == FieldType::Date)
            .map(|f| f.key.clone())
        else {
            return TurnResponse::handled(format!(
                "{} no tiene un campo de fecha para revisar disponibilidad.",
                table.name
            ));
        };
        let time_key = table
            .fields
            .iter()
            .find(|f| f.field_type == FieldType::Time)
            .map(|f| f.key.clone());

        let Some(fecha) = arguments.get("fecha").and_then(Value::as_str) else {
            return TurnResponse::handled("¿Para qué fecha quieres revisar disponibilidad?");
        };

        let mut filters = Map::new();
        filters.insert(date_key, json!(fecha));
        let taken = match self.records.query(&request.workspace_id, &table.id, &filters).await {
            Ok(records) => records,
            Err(_) => {
                return TurnResponse::handled("No pude revisar la agenda en este momento.")
            }
        };

        let taken_times: Vec<String> = time_key
            .as_ref()
            .map(|key| {
                taken
                    .iter()
                    .filter_map(|r| r.data.get(key).and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if let Some(hora) = arguments.get("hora").and_then(Value::as_str) {
            let normalized = normalize_time(hora);
            if taken_times.iter().any(|t| t == &normalized) {
                let suggestions = free_slots(&taken_times, 3);
                return TurnResponse::handled(if suggestions.is_empty() {
                    format!("El {fecha} a las {normalized} ya está ocupado y no veo huecos ese día.")
                } else {
                    format!(
                        "El {fecha} a las {normalized} ya está ocupado. Tengo libre: {}.",
                        suggestions.join(", ")
                    )
                });
            }
            return TurnResponse::handled(format!("Sí, el {fecha} a las {normalized} está libre."));
        }

        if taken.is_empty() {
            return TurnResponse::handled(format!("El {fecha} está completamente libre."));
        }
        let suggestions = free_slots(&taken_times, 3);
        TurnResponse::handled(format!(
            "El {fecha} hay {} espacios ocupados. Horarios libres: {}.",
            taken.len(),
            if suggestions.is_empty() { "ninguno".to_string() } else { suggestions.join(", ") }
        ))
    }

    async fn handle_analyze(
        &self,
        request: &TurnRequest,
        table: Option<TableConfig>,
    ) -> TurnResponse {
        let Some(table) = table else {
            return TurnResponse::unhandled(REPLY_MISUNDERSTOOD);
        };
        let records = match self
            .records
            .query(&request.workspace_id, &table.id, &Map::new())
            .await
        {
            Ok(records) => records,
            Err(_) => return TurnResponse::handled("No pude analizar los datos ahora."),
        };

        let mut lines = vec![format!("{} tiene {} registros.", table.name, records.len())];
        for field in table.fields.iter().filter(|f| f.field_type.is_numeric()) {
            let values: Vec<f64> = records
                .iter()
                .filter_map(|r| r.data.get(&field.key).and_then(Value::as_f64))
                .collect();
            if values.is_empty() {
                continue;
            }
            let total: f64 = values.iter().sum();
            let average = total / values.len() as f64;
            lines.push(format!(
                "{}: total {total:.2}, promedio {average:.2}.",
                field.label
            ));
        }
        TurnResponse::handled(lines.join("\n"))
    }

    async fn handle_general(&self, request: &TurnRequest, ctx: &ChatContext) -> TurnResponse {
        let mut messages: Vec<OracleMessage> = ctx
            .history
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|m| OracleMessage::new(m.role, m.content.clone()))
            .collect();
        messages.push(OracleMessage::new(Role::User, request.message.clone()));

        match self.oracle.complete(&messages, &self.options.model, 300, 0.7).await {
            Ok(completion) => TurnResponse::handled(completion.content),
            Err(_) => TurnResponse::handled("¡Aquí sigo! ¿En qué te ayudo?"),
        }
    }

    // ------------------------------------------------------------------
    // setup_workspace / create_flow
    // ------------------------------------------------------------------

    pub(crate) async fn handle_setup(
        &self,
        request: &TurnRequest,
        arguments: &Value,
    ) -> TurnResponse {
        let Some(definitions) = arguments.get("tables").and_then(Value::as_array) else {
            return TurnResponse::handled(
                "Dime qué tablas necesitas y qué campos lleva cada una.",
            );
        };

        let mut created = Vec::new();
        for definition in definitions {
            let Some(name) = definition.get("name").and_then(Value::as_str) else { continue };
            let fields = definition
                .get("fields")
                .and_then(Value::as_array)
                .map(|raw| {
                    raw.iter()
                        .filter_map(|f| {
                            serde_json::from_value::<clerky_core::schema::FieldSpec>(f.clone())
                                .map_err(|error| {
                                    tracing::warn!(
                                        event_name = "engine.setup_field_invalid",
                                        error = %error,
                                        "skipping malformed field spec"
                                    );
                                    error
                                })
                                .ok()
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            if fields.is_empty() {
                continue;
            }

            let table = TableConfig {
                id: clerky_core::schema::TableId(format!(
                    "tbl-{}",
                    clerky_core::schema::normalize_name(name).replace(' ', "-")
                )),
                workspace_id: request.workspace_id.clone(),
                name: name.to_string(),
                fields,
                rules: Vec::new(),
            };
            if self.tables.save(table).await.is_ok() {
                created.push(name.to_string());
            }
        }

        if created.is_empty() {
            TurnResponse::handled(
                "No pude crear las tablas; necesito al menos un campo válido por tabla.",
            )
        } else {
            TurnResponse::handled(format!("Configuré las tablas: {}.", created.join(", ")))
        }
    }

    pub(crate) async fn handle_create_flow(
        &self,
        request: &TurnRequest,
        turn: &TurnState,
        ctx: &mut ChatContext,
        table: Option<TableConfig>,
        arguments: &Value,
    ) -> TurnResponse {
        let Some(table) = table else {
            return TurnResponse::unhandled(REPLY_MISUNDERSTOOD);
        };

        let on_complete = arguments
            .get("then_record_type")
            .and_then(Value::as_str)
            .and_then(|name| resolve_table(ToolKind::QueryRecords, Some(name), &turn.tables))
            .map(|next| FlowTemplate {
                kind: FlowKind::Create,
                table_id: next.id.clone(),
                table_name: next.name.clone(),
                data: Map::new(),
                required_fields: next.required_field_keys(),
            });

        self.start_collection(request, turn, ctx, &table, arguments, on_complete).await
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn summarize_record(data: &Map<String, Value>, table: &TableConfig) -> String {
    let mut parts = Vec::new();
    for field in &table.fields {
        if parts.len() >= 4 {
            break;
        }
        if let Some(value) = data.get(&field.key) {
            if !clerky_core::validate::value_is_empty(value) {
                parts.push(format!("{}: {}", field.label, display_value(value)));
            }
        }
    }
    if parts.is_empty() {
        "(sin datos)".to_string()
    } else {
        parts.join(", ")
    }
}

fn normalize_time(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.split_once(':') {
        Some((h, m)) => match h.parse::<u32>() {
            Ok(hours) => format!("{hours:02}:{m}"),
            Err(_) => trimmed.to_string(),
        },
        None => trimmed.to_string(),
    }
}

/// Hourly slots between 09:00 and 19:00 not present in `taken`.
fn free_slots(taken: &[String], limit: usize) -> Vec<String> {
    (9..19)
        .map(|hour| format!("{hour:02}:00"))
        .filter(|slot| !taken.contains(slot))
        .take(limit)
        .collect()
}
