//! Per-chat conversation state.
//!
//! `ChatContext` is the working memory of one conversation: the in-progress
//! record draft, what is still missing, the bounded history window, and the
//! pending confirmation/relation sub-states. Everything durable serializes
//! into the chat's stored document; a process restart mid-flow recovers the
//! whole dialogue from `ChatDocument.data` on the next turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::confirm::ConfirmationState;
use crate::schema::{FieldSpec, TableId};
use crate::validate::value_is_empty;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub table_id: TableId,
    pub table_name: String,
    pub fields: Map<String, Value>,
    pub required_fields: Vec<String>,
    pub fields_config: Vec<FieldSpec>,
}

impl PendingRecord {
    /// Keys still required and not yet filled with a non-empty value.
    pub fn missing_fields(&self) -> Vec<String> {
        self.required_fields
            .iter()
            .filter(|key| {
                self.fields.get(key.as_str()).map(value_is_empty).unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    pub fn spec(&self, key: &str) -> Option<&FieldSpec> {
        self.fields_config.iter().find(|spec| spec.key == key)
    }

    /// Merge already-validated values, honoring the same guards as
    /// `ChatContext::merge_fields`: schema membership, still-missing, and
    /// non-empty. Returns the accepted keys.
    pub fn merge_validated(&mut self, fields: Map<String, Value>) -> Vec<String> {
        let missing = self.missing_fields();
        let mut accepted = Vec::new();
        for (key, value) in fields {
            if self.spec(&key).is_none()
                || !missing.contains(&key)
                || value_is_empty(&value)
            {
                continue;
            }
            self.fields.insert(key.clone(), value);
            accepted.push(key);
        }
        accepted
    }

    /// Field keys present in the draft, ordered as the schema declares them.
    pub fn present_keys_in_schema_order(&self) -> Vec<String> {
        self.fields_config
            .iter()
            .filter(|spec| {
                self.fields.get(&spec.key).map(|v| !value_is_empty(v)).unwrap_or(false)
            })
            .map(|spec| spec.key.clone())
            .collect()
    }
}

/// Nested draft for a related record being auto-created mid-flow (e.g. a new
/// client referenced by name while collecting an appointment).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingRelation {
    /// Field on the parent draft that the created record's id will fill.
    pub parent_field: String,
    pub record: PendingRecord,
}

/// Durable slice of a conversation, as persisted by the chat repository.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_record: Option<PendingRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_relation: Option<PendingRelation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_confirmation: Option<ConfirmationState>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatDocument {
    pub id: String,
    pub workspace_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub data: ChatData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatDocument {
    pub fn new(id: impl Into<String>, workspace_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            agent_id: agent_id.into(),
            messages: Vec::new(),
            data: ChatData::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotMissing,
    EmptyValue,
    UnknownField,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergeReport {
    pub accepted: Vec<String>,
    pub rejected: Vec<(String, RejectReason)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChatContext {
    pub workspace_id: String,
    pub agent_id: String,
    pub chat_id: String,
    pub message: String,
    pub history: Vec<ChatMessage>,
    pub pending_record: Option<PendingRecord>,
    pub pending_relation: Option<PendingRelation>,
    pub pending_confirmation: Option<ConfirmationState>,
    pub missing_fields: Vec<String>,
    history_limit: usize,
}

impl ChatContext {
    pub fn new(
        workspace_id: impl Into<String>,
        agent_id: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            agent_id: agent_id.into(),
            chat_id: chat_id.into(),
            message: String::new(),
            history: Vec::new(),
            pending_record: None,
            pending_relation: None,
            pending_confirmation: None,
            missing_fields: Vec::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(2);
        self
    }

    /// Hydrate the dialogue from the chat's persisted document.
    pub fn load_pending_state(&mut self, document: &ChatDocument) {
        self.pending_record = document.data.pending_record.clone();
        self.pending_relation = document.data.pending_relation.clone();
        self.pending_confirmation = document.data.pending_confirmation.clone();
        self.history = document.messages.clone();
        self.trim_history();
        self.update_missing_fields();
    }

    /// Write the dialogue state back onto the document. `None` sub-states are
    /// removed from the document rather than stored as nulls.
    pub fn save_pending_state(&self, document: &mut ChatDocument) {
        document.data.pending_record = self.pending_record.clone();
        document.data.pending_relation = self.pending_relation.clone();
        document.data.pending_confirmation = self.pending_confirmation.clone();
        document.messages = self.history.clone();
        document.updated_at = Utc::now();
    }

    pub fn init_pending_record(
        &mut self,
        table_id: TableId,
        table_name: impl Into<String>,
        required_fields: Vec<String>,
        fields_config: Vec<FieldSpec>,
    ) {
        self.pending_record = Some(PendingRecord {
            table_id,
            table_name: table_name.into(),
            fields: Map::new(),
            required_fields,
            fields_config,
        });
        self.update_missing_fields();
    }

    pub fn clear_pending_record(&mut self) {
        self.pending_record = None;
        self.pending_relation = None;
        self.missing_fields.clear();
    }

    /// Merge extracted fields into the draft. Only keys that are currently
    /// missing may land; a key the oracle invents for an already-confirmed
    /// field is rejected, as is any empty value and any key absent from the
    /// field schema.
    pub fn merge_fields(&mut self, new_fields: Map<String, Value>) -> MergeReport {
        let mut report = MergeReport::default();
        let missing_before = self.missing_fields.clone();

        let Some(pending) = self.pending_record.as_mut() else {
            report.rejected =
                new_fields.keys().map(|k| (k.clone(), RejectReason::NotMissing)).collect();
            return report;
        };

        for (key, value) in new_fields {
            if pending.spec(&key).is_none() {
                report.rejected.push((key, RejectReason::UnknownField));
                continue;
            }
            if !missing_before.iter().any(|m| m == &key) {
                report.rejected.push((key, RejectReason::NotMissing));
                continue;
            }
            if value_is_empty(&value) {
                report.rejected.push((key, RejectReason::EmptyValue));
                continue;
            }
            pending.fields.insert(key.clone(), value);
            report.accepted.push(key);
        }

        self.update_missing_fields();
        report
    }

    /// Apply configured or rule-derived defaults. Unlike `merge_fields` this
    /// may fill optional fields, but it never overwrites a value the user
    /// already provided and never writes outside the schema.
    pub fn apply_defaults(&mut self, defaults: Map<String, Value>) {
        let Some(pending) = self.pending_record.as_mut() else { return };
        for (key, value) in defaults {
            if pending.spec(&key).is_none() || value_is_empty(&value) {
                continue;
            }
            let already_set = pending
                .fields
                .get(&key)
                .map(|v| !value_is_empty(v))
                .unwrap_or(false);
            if !already_set {
                pending.fields.insert(key, value);
            }
        }
        self.update_missing_fields();
    }

    /// Recompute `missing_fields` from the draft. Derived, never hand-set.
    pub fn update_missing_fields(&mut self) {
        self.missing_fields =
            self.pending_record.as_ref().map(|p| p.missing_fields()).unwrap_or_default();
    }

    pub fn is_complete(&mut self) -> bool {
        self.update_missing_fields();
        self.pending_record.is_some() && self.missing_fields.is_empty()
    }

    pub fn collected_fields(&self) -> Map<String, Value> {
        self.pending_record.as_ref().map(|p| p.fields.clone()).unwrap_or_default()
    }

    /// First still-missing field in required order; what the assistant asks
    /// for next.
    pub fn next_missing_spec(&self) -> Option<&FieldSpec> {
        let pending = self.pending_record.as_ref()?;
        let key = self.missing_fields.first()?;
        pending.spec(key)
    }

    pub fn push_history(&mut self, role: Role, content: impl Into<String>) {
        self.history.push(ChatMessage { role, content: content.into(), timestamp: Utc::now() });
        self.trim_history();
    }

    pub fn last_assistant_message(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    fn trim_history(&mut self) {
        if self.history.len() > self.history_limit {
            let excess = self.history.len() - self.history_limit;
            self.history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use crate::schema::{FieldSpec, FieldType, TableId};

    use super::{ChatContext, ChatDocument, RejectReason, Role};

    fn citas_context() -> ChatContext {
        let mut ctx = ChatContext::new("ws-1", "agent-1", "chat-1");
        ctx.init_pending_record(
            TableId("tbl-citas".to_string()),
            "Citas",
            vec!["cliente".to_string(), "fecha".to_string(), "hora".to_string()],
            vec![
                FieldSpec::new("cliente", "Cliente", FieldType::Text).required(),
                FieldSpec::new("fecha", "Fecha", FieldType::Date).required(),
                FieldSpec::new("hora", "Hora", FieldType::Time).required(),
                FieldSpec::new("notas", "Notas", FieldType::Text),
            ],
        );
        ctx
    }

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn missing_fields_derive_from_required_minus_collected() {
        let mut ctx = citas_context();
        assert_eq!(ctx.missing_fields, vec!["cliente", "fecha", "hora"]);

        let report = ctx.merge_fields(fields(&[("cliente", json!("Juan Pérez"))]));
        assert_eq!(report.accepted, vec!["cliente"]);
        assert_eq!(ctx.missing_fields, vec!["fecha", "hora"]);
        assert!(!ctx.is_complete());

        ctx.merge_fields(fields(&[("fecha", json!("2026-02-28")), ("hora", json!("16:00"))]));
        assert!(ctx.is_complete());
        assert!(ctx.missing_fields.is_empty());
    }

    #[test]
    fn merge_rejects_keys_not_currently_missing() {
        let mut ctx = citas_context();
        ctx.merge_fields(fields(&[("cliente", json!("Juan"))]));

        // A second extraction hallucinating a new value for the confirmed
        // field must not overwrite it.
        let report = ctx.merge_fields(fields(&[("cliente", json!("Pedro"))]));
        assert_eq!(report.rejected, vec![("cliente".to_string(), RejectReason::NotMissing)]);
        assert_eq!(
            ctx.pending_record.as_ref().unwrap().fields.get("cliente"),
            Some(&json!("Juan"))
        );
    }

    #[test]
    fn merge_rejects_empty_values_and_unknown_keys() {
        let mut ctx = citas_context();
        let report = ctx.merge_fields(fields(&[
            ("fecha", json!("")),
            ("inventado", json!("x")),
            ("hora", Value::Null),
        ]));

        assert!(report.accepted.is_empty());
        assert!(report
            .rejected
            .contains(&("fecha".to_string(), RejectReason::EmptyValue)));
        assert!(report
            .rejected
            .contains(&("inventado".to_string(), RejectReason::UnknownField)));
        assert!(report
            .rejected
            .contains(&("hora".to_string(), RejectReason::EmptyValue)));
        assert_eq!(ctx.missing_fields, vec!["cliente", "fecha", "hora"]);
    }

    #[test]
    fn draft_never_contains_keys_outside_schema() {
        let mut ctx = citas_context();
        ctx.merge_fields(fields(&[("inventado", json!("x")), ("cliente", json!("Ana"))]));
        let pending = ctx.pending_record.as_ref().unwrap();
        assert!(pending.fields.get("inventado").is_none());
        assert!(pending.fields.get("cliente").is_some());
    }

    #[test]
    fn next_missing_spec_follows_required_order() {
        let mut ctx = citas_context();
        assert_eq!(ctx.next_missing_spec().unwrap().key, "cliente");
        ctx.merge_fields(fields(&[("cliente", json!("Ana"))]));
        assert_eq!(ctx.next_missing_spec().unwrap().key, "fecha");
    }

    #[test]
    fn pending_state_round_trips_through_the_document() {
        let mut ctx = citas_context();
        ctx.merge_fields(fields(&[("cliente", json!("Juan Pérez"))]));
        ctx.push_history(Role::User, "quiero agendar una cita");
        ctx.push_history(Role::Assistant, "¿Para qué cliente?");

        let mut document = ChatDocument::new("chat-1", "ws-1", "agent-1");
        ctx.save_pending_state(&mut document);

        let serialized = serde_json::to_string(&document).expect("serialize chat document");
        let reloaded: ChatDocument = serde_json::from_str(&serialized).expect("deserialize");

        let mut restored = ChatContext::new("ws-1", "agent-1", "chat-1");
        restored.load_pending_state(&reloaded);

        assert_eq!(restored.pending_record, ctx.pending_record);
        assert_eq!(restored.missing_fields, vec!["fecha", "hora"]);
        assert_eq!(restored.history.len(), 2);
    }

    #[test]
    fn clearing_the_draft_clears_derived_state() {
        let mut ctx = citas_context();
        ctx.merge_fields(fields(&[("cliente", json!("Juan"))]));
        ctx.clear_pending_record();
        assert!(ctx.pending_record.is_none());
        assert!(ctx.missing_fields.is_empty());
        assert!(!ctx.is_complete());
    }

    #[test]
    fn defaults_fill_optional_fields_without_overwriting() {
        let mut ctx = citas_context();
        ctx.merge_fields(fields(&[("cliente", json!("Juan"))]));

        ctx.apply_defaults(fields(&[
            ("notas", json!("sin notas")),
            ("cliente", json!("Otro")),
            ("inventado", json!("x")),
        ]));

        let pending = ctx.pending_record.as_ref().unwrap();
        assert_eq!(pending.fields.get("notas"), Some(&json!("sin notas")));
        assert_eq!(pending.fields.get("cliente"), Some(&json!("Juan")));
        assert!(pending.fields.get("inventado").is_none());
    }

    #[test]
    fn present_keys_follow_schema_order() {
        let mut ctx = citas_context();
        ctx.merge_fields(fields(&[("hora", json!("16:00")), ("cliente", json!("Ana"))]));
        let pending = ctx.pending_record.as_ref().unwrap();
        assert_eq!(pending.present_keys_in_schema_order(), vec!["cliente", "hora"]);
    }

    #[test]
    fn history_window_is_bounded() {
        let mut ctx = ChatContext::new("ws-1", "agent-1", "chat-1").with_history_limit(4);
        for i in 0..10 {
            ctx.push_history(Role::User, format!("mensaje {i}"));
        }
        assert_eq!(ctx.history.len(), 4);
        assert_eq!(ctx.history[0].content, "mensaje 6");
    }

    #[test]
    fn last_assistant_message_skips_user_turns() {
        let mut ctx = citas_context();
        ctx.push_history(Role::Assistant, "¿Para qué fecha?");
        ctx.push_history(Role::User, "mañana");
        assert_eq!(ctx.last_assistant_message(), Some("¿Para qué fecha?"));
    }
}
