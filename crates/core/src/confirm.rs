//! Confirmation dialogue guarding the final "about to write" step.
//!
//! A pending confirmation shows the user a preview of the draft record and
//! waits for a yes/no/edit reply. The state machine loops PENDING -> EDITING
//! -> PENDING until confirmed, cancelled, or expired; expiry is detected
//! lazily on the next read, there is no background timer.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::schema::{FieldSpec, FieldType, TableId};

pub const DEFAULT_TIMEOUT_SECS: i64 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfirmationStatus {
    Pending,
    Editing,
    Confirmed,
    Cancelled,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationState {
    pub id: String,
    pub status: ConfirmationStatus,
    pub action: String,
    pub table_name: String,
    pub table_id: TableId,
    pub data: Map<String, Value>,
    pub original_data: Map<String, Value>,
    /// Stable field ordering for ordinal references ("2" = second field).
    pub field_order: Vec<String>,
    pub editing_field: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConfirmationState {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmationDraft {
    pub action: String,
    pub table_name: String,
    pub table_id: TableId,
    pub data: Map<String, Value>,
    pub field_order: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConfirmationReply {
    Confirmed { data: Map<String, Value> },
    Cancelled,
    Editing { field: String, current_value: Option<Value> },
    Edited { field: String, old_value: Option<Value>, new_value: Value },
    Expired,
    Unknown,
}

/// Workspace-scoped store of pending confirmations, keyed by chat id. Safe to
/// share across chats; each entry belongs to exactly one conversation.
#[derive(Default)]
pub struct ConfirmationManager {
    timeout_secs: i64,
    states: Mutex<HashMap<String, ConfirmationState>>,
}

impl ConfirmationManager {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(timeout_secs: i64) -> Self {
        Self { timeout_secs: timeout_secs.max(1), states: Mutex::new(HashMap::new()) }
    }

    pub fn create_pending(&self, chat_id: &str, draft: ConfirmationDraft) -> ConfirmationState {
        self.create_pending_at(chat_id, draft, Utc::now())
    }

    pub fn create_pending_at(
        &self,
        chat_id: &str,
        draft: ConfirmationDraft,
        now: DateTime<Utc>,
    ) -> ConfirmationState {
        let state = ConfirmationState {
            id: Uuid::new_v4().to_string(),
            status: ConfirmationStatus::Pending,
            action: draft.action,
            table_name: draft.table_name,
            table_id: draft.table_id,
            original_data: draft.data.clone(),
            data: draft.data,
            field_order: draft.field_order,
            editing_field: None,
            created_at: now,
            expires_at: now + Duration::seconds(self.timeout_secs),
        };
        self.lock().insert(chat_id.to_string(), state.clone());
        state
    }

    /// Re-seed a confirmation loaded from the chat document (process restart
    /// mid-dialogue). Terminal states are not restored.
    pub fn restore(&self, chat_id: &str, state: ConfirmationState) {
        if matches!(state.status, ConfirmationStatus::Pending | ConfirmationStatus::Editing) {
            self.lock().insert(chat_id.to_string(), state);
        }
    }

    pub fn get(&self, chat_id: &str) -> Option<ConfirmationState> {
        self.lock().get(chat_id).cloned()
    }

    pub fn discard(&self, chat_id: &str) {
        self.lock().remove(chat_id);
    }

    pub fn process_response(&self, chat_id: &str, message: &str) -> ConfirmationReply {
        self.process_response_at(chat_id, message, Utc::now())
    }

    pub fn process_response_at(
        &self,
        chat_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> ConfirmationReply {
        let mut states = self.lock();
        let Some(state) = states.get_mut(chat_id) else {
            return ConfirmationReply::Unknown;
        };

        if state.is_expired_at(now) {
            state.status = ConfirmationStatus::Expired;
            let _ = states.remove(chat_id);
            return ConfirmationReply::Expired;
        }

        let text = message.trim().to_lowercase();

        if is_confirmation_phrase(&text) {
            state.status = ConfirmationStatus::Confirmed;
            let data = state.data.clone();
            states.remove(chat_id);
            return ConfirmationReply::Confirmed { data };
        }

        if is_cancellation_phrase(&text) {
            state.status = ConfirmationStatus::Cancelled;
            states.remove(chat_id);
            return ConfirmationReply::Cancelled;
        }

        if let Some(field) = match_edit_request(&text, &state.field_order) {
            state.status = ConfirmationStatus::Editing;
            state.editing_field = Some(field.clone());
            let current_value = state.data.get(&field).cloned();
            return ConfirmationReply::Editing { field, current_value };
        }

        if state.status == ConfirmationStatus::Editing {
            if let Some(field) = state.editing_field.take() {
                let old_value = state.data.get(&field).cloned();
                let new_value = Value::String(message.trim().to_string());
                state.data.insert(field.clone(), new_value.clone());
                state.status = ConfirmationStatus::Pending;
                return ConfirmationReply::Edited { field, old_value, new_value };
            }
        }

        ConfirmationReply::Unknown
    }

    /// System-initiated confirmation bypassing the user reply. Only valid
    /// from PENDING; anything else leaves the state untouched.
    pub fn force_confirm(&self, chat_id: &str) -> Option<Map<String, Value>> {
        let mut states = self.lock();
        let state = states.get(chat_id)?;
        if state.status != ConfirmationStatus::Pending {
            return None;
        }
        let data = state.data.clone();
        states.remove(chat_id);
        Some(data)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConfirmationState>> {
        match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

const CONFIRM_PHRASES: &[&str] = &[
    "sí", "si", "ok", "okay", "dale", "confirmo", "confirmar", "confirma", "correcto", "exacto",
    "claro", "va", "sale", "de acuerdo", "está bien", "esta bien", "yes", "yep", "sure", "confirm",
];

const CANCEL_PHRASES: &[&str] = &[
    "no", "cancelar", "cancela", "cancelalo", "cancélalo", "olvídalo", "olvidalo", "mejor no",
    "ya no", "dejalo", "déjalo", "cancel", "nevermind", "never mind", "forget it",
];

static EDIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(cambia(?:r)?|modifica(?:r)?|corrige|corregir|edita(?:r)?|change|edit|fix)\b\s*(?:la|el|los|las|the)?\s*(.*)$")
        .expect("edit request regex")
});

static ORDINAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,2}$").expect("ordinal regex"));

fn is_confirmation_phrase(text: &str) -> bool {
    CONFIRM_PHRASES.iter().any(|p| *p == text)
}

fn is_cancellation_phrase(text: &str) -> bool {
    CANCEL_PHRASES.iter().any(|p| *p == text)
}

fn match_edit_request(text: &str, field_order: &[String]) -> Option<String> {
    if ORDINAL_RE.is_match(text) {
        let index: usize = text.parse().ok()?;
        return field_order.get(index.checked_sub(1)?).cloned();
    }

    let caps = EDIT_RE.captures(text)?;
    let remainder = caps.get(2).map(|m| m.as_str().trim().to_lowercase()).unwrap_or_default();
    if remainder.is_empty() {
        return None;
    }
    field_order
        .iter()
        .find(|key| {
            let key = key.to_lowercase();
            remainder.contains(&key) || key.contains(&remainder)
        })
        .cloned()
}

/// Render the confirmation preview: fields in stable order, 1-indexed,
/// type-aware formatting.
pub fn render_preview(state: &ConfirmationState, specs: &[FieldSpec]) -> String {
    let mut lines = Vec::new();
    lines.push(format!("Voy a registrar esto en {}:", state.table_name));
    for (index, key) in state.field_order.iter().enumerate() {
        let spec = specs.iter().find(|s| &s.key == key);
        let label = spec.map(|s| s.label.as_str()).unwrap_or(key.as_str());
        let rendered = format_value(state.data.get(key), spec.map(|s| s.field_type));
        lines.push(format!("{}. {label}: {rendered}", index + 1));
    }
    lines.push("¿Confirmo? (sí / no / cambiar <campo>)".to_string());
    lines.join("\n")
}

fn format_value(value: Option<&Value>, field_type: Option<FieldType>) -> String {
    let Some(value) = value else { return "(vacío)".to_string() };
    if value.is_null() {
        return "(vacío)".to_string();
    }
    match field_type {
        Some(FieldType::Time) => value.as_str().map(format_time_12h).unwrap_or_else(|| value.to_string()),
        Some(FieldType::Date) => value.as_str().map(format_date_long).unwrap_or_else(|| value.to_string()),
        Some(FieldType::Boolean) => {
            if value.as_bool().unwrap_or(false) { "sí".to_string() } else { "no".to_string() }
        }
        _ => match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

fn format_time_12h(time: &str) -> String {
    let Some((h, m)) = time.split_once(':') else { return time.to_string() };
    let Ok(hours) = h.parse::<u32>() else { return time.to_string() };
    let suffix = if hours < 12 { "AM" } else { "PM" };
    let display = match hours % 12 {
        0 => 12,
        other => other,
    };
    format!("{display}:{m} {suffix}")
}

const WEEKDAYS_ES: &[&str] =
    &["lunes", "martes", "miércoles", "jueves", "viernes", "sábado", "domingo"];
const MONTHS_ES: &[&str] = &[
    "enero", "febrero", "marzo", "abril", "mayo", "junio", "julio", "agosto", "septiembre",
    "octubre", "noviembre", "diciembre",
];

fn format_date_long(date: &str) -> String {
    let Ok(parsed) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
        return date.to_string();
    };
    use chrono::Datelike;
    let weekday = WEEKDAYS_ES[parsed.weekday().num_days_from_monday() as usize];
    let month = MONTHS_ES[(parsed.month() - 1) as usize];
    format!("{weekday} {} de {month} de {}", parsed.day(), parsed.year())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::{json, Map, Value};

    use crate::schema::{FieldSpec, FieldType, TableId};

    use super::{
        render_preview, ConfirmationDraft, ConfirmationManager, ConfirmationReply,
        ConfirmationStatus,
    };

    fn draft() -> ConfirmationDraft {
        let mut data = Map::new();
        data.insert("cliente".to_string(), json!("Juan Pérez"));
        data.insert("fecha".to_string(), json!("2026-02-28"));
        data.insert("hora".to_string(), json!("16:00"));
        ConfirmationDraft {
            action: "create".to_string(),
            table_name: "Citas".to_string(),
            table_id: TableId("tbl-citas".to_string()),
            data,
            field_order: vec!["cliente".to_string(), "fecha".to_string(), "hora".to_string()],
        }
    }

    #[test]
    fn confirmation_phrase_confirms_and_discards() {
        let manager = ConfirmationManager::new();
        manager.create_pending("chat-1", draft());

        let reply = manager.process_response("chat-1", "dale");
        let ConfirmationReply::Confirmed { data } = reply else {
            panic!("expected confirmation, got {reply:?}");
        };
        assert_eq!(data.get("cliente"), Some(&json!("Juan Pérez")));
        assert!(manager.get("chat-1").is_none());
    }

    #[test]
    fn cancellation_discards_state() {
        let manager = ConfirmationManager::new();
        manager.create_pending("chat-1", draft());

        assert_eq!(manager.process_response("chat-1", "no"), ConfirmationReply::Cancelled);
        assert!(manager.get("chat-1").is_none());
        assert_eq!(manager.process_response("chat-1", "sí"), ConfirmationReply::Unknown);
    }

    #[test]
    fn edit_by_field_name_then_new_value_loops_back_to_pending() {
        let manager = ConfirmationManager::new();
        manager.create_pending("chat-1", draft());

        let reply = manager.process_response("chat-1", "cambia la hora");
        let ConfirmationReply::Editing { field, current_value } = reply else {
            panic!("expected editing, got {reply:?}");
        };
        assert_eq!(field, "hora");
        assert_eq!(current_value, Some(json!("16:00")));
        assert_eq!(manager.get("chat-1").unwrap().status, ConfirmationStatus::Editing);

        let reply = manager.process_response("chat-1", "17:00");
        let ConfirmationReply::Edited { field, old_value, new_value } = reply else {
            panic!("expected edited, got {reply:?}");
        };
        assert_eq!(field, "hora");
        assert_eq!(old_value, Some(json!("16:00")));
        assert_eq!(new_value, Value::String("17:00".to_string()));

        let state = manager.get("chat-1").unwrap();
        assert_eq!(state.status, ConfirmationStatus::Pending);
        assert_eq!(state.data.get("hora"), Some(&json!("17:00")));
        assert_eq!(state.original_data.get("hora"), Some(&json!("16:00")));
    }

    #[test]
    fn bare_ordinal_selects_field_in_order() {
        let manager = ConfirmationManager::new();
        manager.create_pending("chat-1", draft());

        let reply = manager.process_response("chat-1", "2");
        let ConfirmationReply::Editing { field, .. } = reply else {
            panic!("expected editing, got {reply:?}");
        };
        assert_eq!(field, "fecha");
    }

    #[test]
    fn expiry_is_detected_lazily() {
        let manager = ConfirmationManager::with_timeout(300);
        let created = Utc::now();
        manager.create_pending_at("chat-1", draft(), created);

        let still_fresh =
            manager.process_response_at("chat-1", "qué?", created + Duration::seconds(10));
        assert_eq!(still_fresh, ConfirmationReply::Unknown);

        let too_late =
            manager.process_response_at("chat-1", "sí", created + Duration::seconds(400));
        assert_eq!(too_late, ConfirmationReply::Expired);
        assert!(manager.get("chat-1").is_none());
    }

    #[test]
    fn unrecognized_reply_leaves_state_unchanged() {
        let manager = ConfirmationManager::new();
        manager.create_pending("chat-1", draft());

        assert_eq!(manager.process_response("chat-1", "¿y el clima?"), ConfirmationReply::Unknown);
        let state = manager.get("chat-1").unwrap();
        assert_eq!(state.status, ConfirmationStatus::Pending);
        assert_eq!(state.data.get("hora"), Some(&json!("16:00")));
    }

    #[test]
    fn force_confirm_only_from_pending() {
        let manager = ConfirmationManager::new();
        manager.create_pending("chat-1", draft());
        manager.process_response("chat-1", "cambiar fecha");

        assert!(manager.force_confirm("chat-1").is_none());

        manager.process_response("chat-1", "2026-03-01");
        assert!(manager.force_confirm("chat-1").is_some());
        assert!(manager.get("chat-1").is_none());
    }

    #[test]
    fn preview_formats_by_type_in_order() {
        let manager = ConfirmationManager::new();
        let state = manager.create_pending("chat-1", draft());
        let specs = vec![
            FieldSpec::new("cliente", "Cliente", FieldType::Text),
            FieldSpec::new("fecha", "Fecha", FieldType::Date),
            FieldSpec::new("hora", "Hora", FieldType::Time),
        ];

        let preview = render_preview(&state, &specs);
        assert!(preview.contains("1. Cliente: Juan Pérez"));
        assert!(preview.contains("2. Fecha: sábado 28 de febrero de 2026"));
        assert!(preview.contains("3. Hora: 4:00 PM"));
    }
}
