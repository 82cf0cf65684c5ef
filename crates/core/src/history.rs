//! Per-workspace log of reversible actions.
//!
//! Every write the assistant performs lands here with enough context to
//! reverse it. The log is append-only, newest-first, capped per workspace,
//! and entries age out after a day.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::schema::TableId;

pub const MAX_ENTRIES_PER_WORKSPACE: usize = 50;
pub const MAX_AGE_HOURS: i64 = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Cancel,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    pub kind: ActionKind,
    pub table_id: TableId,
    pub table_name: String,
    pub record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_data: Option<Map<String, Value>>,
    pub chat_id: String,
    pub timestamp: DateTime<Utc>,
    pub can_undo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undone_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct ActionInput {
    pub kind: ActionKind,
    pub table_id: TableId,
    pub table_name: String,
    pub record_id: String,
    pub previous_data: Option<Map<String, Value>>,
    pub new_data: Option<Map<String, Value>>,
    pub chat_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackOperation {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollbackInstructions {
    pub operation: RollbackOperation,
    pub table_id: TableId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    pub message: String,
}

#[derive(Default)]
pub struct ActionLog {
    entries: Mutex<HashMap<String, Vec<ActionRecord>>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an action, newest first. Overflow evicts the oldest entries.
    pub fn record(&self, workspace_id: &str, input: ActionInput) -> String {
        let id = Uuid::new_v4().to_string();
        let record = ActionRecord {
            id: id.clone(),
            kind: input.kind,
            table_id: input.table_id,
            table_name: input.table_name,
            record_id: input.record_id,
            previous_data: input.previous_data,
            new_data: input.new_data,
            chat_id: input.chat_id,
            timestamp: Utc::now(),
            can_undo: true,
            undone_at: None,
        };
        let mut guard = self.lock();
        let entries = guard.entry(workspace_id.to_string()).or_default();
        entries.insert(0, record);
        entries.truncate(MAX_ENTRIES_PER_WORKSPACE);
        id
    }

    /// Most recent action that can still be undone, optionally scoped to one
    /// chat.
    pub fn get_last_undoable(&self, workspace_id: &str, chat_id: Option<&str>) -> Option<ActionRecord> {
        self.lock()
            .get(workspace_id)?
            .iter()
            .find(|record| {
                record.can_undo
                    && chat_id.map(|chat| record.chat_id == chat).unwrap_or(true)
            })
            .cloned()
    }

    /// Flip `can_undo` off. One-way: an undone action never becomes undoable
    /// again.
    pub fn mark_undone(&self, workspace_id: &str, action_id: &str) -> bool {
        let mut guard = self.lock();
        let Some(entries) = guard.get_mut(workspace_id) else { return false };
        let Some(record) = entries.iter_mut().find(|r| r.id == action_id) else { return false };
        if !record.can_undo {
            return false;
        }
        record.can_undo = false;
        record.undone_at = Some(Utc::now());
        true
    }

    pub fn clean_old(&self, workspace_id: &str) {
        let cutoff = Utc::now() - Duration::hours(MAX_AGE_HOURS);
        if let Some(entries) = self.lock().get_mut(workspace_id) {
            entries.retain(|record| record.timestamp > cutoff);
        }
    }

    pub fn list(&self, workspace_id: &str) -> Vec<ActionRecord> {
        self.lock().get(workspace_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<ActionRecord>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The inverse operation for an action. The mapping is mechanical:
/// create -> delete, update -> restore previous, delete -> recreate previous,
/// cancel -> restore previous status.
pub fn rollback_instructions(action: &ActionRecord) -> RollbackInstructions {
    match action.kind {
        ActionKind::Create => RollbackInstructions {
            operation: RollbackOperation::Delete,
            table_id: action.table_id.clone(),
            record_id: Some(action.record_id.clone()),
            data: None,
            message: format!("Eliminé el registro que había creado en {}.", action.table_name),
        },
        ActionKind::Update => RollbackInstructions {
            operation: RollbackOperation::Update,
            table_id: action.table_id.clone(),
            record_id: Some(action.record_id.clone()),
            data: action.previous_data.clone(),
            message: format!("Restauré los valores anteriores en {}.", action.table_name),
        },
        ActionKind::Delete => RollbackInstructions {
            operation: RollbackOperation::Create,
            table_id: action.table_id.clone(),
            record_id: None,
            data: action.previous_data.clone(),
            message: format!("Volví a crear el registro eliminado en {}.", action.table_name),
        },
        ActionKind::Cancel => {
            let status = action
                .previous_data
                .as_ref()
                .and_then(|data| data.get("status").cloned())
                .unwrap_or_else(|| json!("Pending"));
            let mut data = Map::new();
            data.insert("status".to_string(), status);
            RollbackInstructions {
                operation: RollbackOperation::Update,
                table_id: action.table_id.clone(),
                record_id: Some(action.record_id.clone()),
                data: Some(data),
                message: format!("Reactivé el registro cancelado en {}.", action.table_name),
            }
        }
    }
}

static UNDO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(deshacer|deshaz|deshazlo|revertir|revierte|reviértelo|undo|revert)\b|\bcancela\s+(lo\s+)?(último|ultimo)\b",
    )
    .expect("undo request regex")
});

pub fn is_undo_request(message: &str) -> bool {
    UNDO_RE.is_match(message)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use crate::schema::TableId;

    use super::{
        is_undo_request, rollback_instructions, ActionInput, ActionKind, ActionLog,
        RollbackOperation, MAX_ENTRIES_PER_WORKSPACE,
    };

    fn input(kind: ActionKind, record_id: &str, chat_id: &str) -> ActionInput {
        ActionInput {
            kind,
            table_id: TableId("tbl-citas".to_string()),
            table_name: "Citas".to_string(),
            record_id: record_id.to_string(),
            previous_data: None,
            new_data: None,
            chat_id: chat_id.to_string(),
        }
    }

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn last_undoable_is_newest_first_and_chat_scoped() {
        let log = ActionLog::new();
        log.record("ws-1", input(ActionKind::Create, "rec-1", "chat-a"));
        log.record("ws-1", input(ActionKind::Create, "rec-2", "chat-b"));

        assert_eq!(log.get_last_undoable("ws-1", None).unwrap().record_id, "rec-2");
        assert_eq!(
            log.get_last_undoable("ws-1", Some("chat-a")).unwrap().record_id,
            "rec-1"
        );
        assert!(log.get_last_undoable("ws-2", None).is_none());
    }

    #[test]
    fn mark_undone_flips_exactly_once() {
        let log = ActionLog::new();
        let id = log.record("ws-1", input(ActionKind::Create, "rec-1", "chat-a"));

        assert!(log.mark_undone("ws-1", &id));
        assert!(!log.mark_undone("ws-1", &id));
        assert!(log.get_last_undoable("ws-1", None).is_none());

        let record = &log.list("ws-1")[0];
        assert!(!record.can_undo);
        assert!(record.undone_at.is_some());
    }

    #[test]
    fn overflow_evicts_oldest() {
        let log = ActionLog::new();
        for i in 0..(MAX_ENTRIES_PER_WORKSPACE + 10) {
            log.record("ws-1", input(ActionKind::Create, &format!("rec-{i}"), "chat-a"));
        }
        let entries = log.list("ws-1");
        assert_eq!(entries.len(), MAX_ENTRIES_PER_WORKSPACE);
        assert_eq!(entries[0].record_id, format!("rec-{}", MAX_ENTRIES_PER_WORKSPACE + 9));
        assert!(!entries.iter().any(|r| r.record_id == "rec-0"));
    }

    #[test]
    fn rollback_mapping_is_exact() {
        let log = ActionLog::new();

        log.record("ws-1", input(ActionKind::Create, "rec-1", "chat-a"));
        let create = log.get_last_undoable("ws-1", None).unwrap();
        let rollback = rollback_instructions(&create);
        assert_eq!(rollback.operation, RollbackOperation::Delete);
        assert_eq!(rollback.record_id.as_deref(), Some("rec-1"));

        let mut update = input(ActionKind::Update, "rec-2", "chat-a");
        update.previous_data = Some(data(&[("hora", json!("10:00"))]));
        log.record("ws-1", update);
        let rollback = rollback_instructions(&log.get_last_undoable("ws-1", None).unwrap());
        assert_eq!(rollback.operation, RollbackOperation::Update);
        assert_eq!(rollback.data.unwrap().get("hora"), Some(&json!("10:00")));

        let mut delete = input(ActionKind::Delete, "rec-3", "chat-a");
        delete.previous_data = Some(data(&[("cliente", json!("Ana"))]));
        log.record("ws-1", delete);
        let rollback = rollback_instructions(&log.get_last_undoable("ws-1", None).unwrap());
        assert_eq!(rollback.operation, RollbackOperation::Create);
        assert!(rollback.record_id.is_none());
        assert_eq!(rollback.data.unwrap().get("cliente"), Some(&json!("Ana")));
    }

    #[test]
    fn cancel_rollback_restores_previous_status_or_pending() {
        let mut with_status = input(ActionKind::Cancel, "rec-4", "chat-a");
        with_status.previous_data = Some(data(&[("status", json!("Confirmada"))]));
        let log = ActionLog::new();
        log.record("ws-1", with_status);
        let rollback = rollback_instructions(&log.get_last_undoable("ws-1", None).unwrap());
        assert_eq!(rollback.data.unwrap().get("status"), Some(&json!("Confirmada")));

        log.record("ws-1", input(ActionKind::Cancel, "rec-5", "chat-a"));
        let rollback = rollback_instructions(&log.get_last_undoable("ws-1", None).unwrap());
        assert_eq!(rollback.data.unwrap().get("status"), Some(&json!("Pending")));
    }

    #[test]
    fn undo_phrases_match_spanish_and_english() {
        assert!(is_undo_request("deshaz lo último"));
        assert!(is_undo_request("puedes revertir eso?"));
        assert!(is_undo_request("undo that please"));
        assert!(is_undo_request("cancela lo último"));
        assert!(!is_undo_request("quiero agendar una cita"));
        assert!(!is_undo_request("cancela mi cita de mañana"));
    }
}
