//! Chained and paused multi-record flows.
//!
//! A flow is one unit of record collection ("create client"). Flows chain
//! (`on_complete` spawns the next one), depend on each other (`depends_on`
//! pauses until the dependency completes), and pause when the user starts
//! something else. Per chat at most one flow is IN_PROGRESS at any instant.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::schema::TableId;

pub const COMPLETED_HISTORY_KEEP: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Create,
    Update,
    Query,
}

/// Template for a follow-up flow spawned on completion or failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowTemplate {
    pub kind: FlowKind,
    pub table_id: TableId,
    pub table_name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub id: String,
    pub chat_id: String,
    pub kind: FlowKind,
    pub table_id: TableId,
    pub table_name: String,
    pub status: FlowStatus,
    pub priority: i32,
    #[serde(default)]
    pub collected_fields: Map<String, Value>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<FlowTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<FlowTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct FlowRequest {
    pub chat_id: String,
    pub kind: Option<FlowKind>,
    pub table_id: Option<TableId>,
    pub table_name: String,
    pub priority: i32,
    pub collected_fields: Map<String, Value>,
    pub required_fields: Vec<String>,
    pub depends_on: Option<String>,
    pub on_complete: Option<FlowTemplate>,
    pub on_fail: Option<FlowTemplate>,
}

#[derive(Clone, Debug, Default)]
pub struct FlowPatch {
    pub collected_fields: Option<Map<String, Value>>,
    pub required_fields: Option<Vec<String>>,
    pub priority: Option<i32>,
}

/// In-memory stack of flows keyed by chat. Interior locking makes it safe to
/// share across concurrently running chats.
#[derive(Default)]
pub struct FlowStack {
    flows: Mutex<HashMap<String, Vec<FlowEntry>>>,
}

impl FlowStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: FlowRequest) -> String {
        let id = Uuid::new_v4().to_string();
        let status = if request.depends_on.is_some() {
            FlowStatus::Paused
        } else {
            FlowStatus::Pending
        };
        let entry = FlowEntry {
            id: id.clone(),
            chat_id: request.chat_id.clone(),
            kind: request.kind.unwrap_or(FlowKind::Create),
            table_id: request.table_id.unwrap_or_else(|| TableId(String::new())),
            table_name: request.table_name,
            status,
            priority: request.priority,
            collected_fields: request.collected_fields,
            required_fields: request.required_fields,
            depends_on: request.depends_on,
            on_complete: request.on_complete,
            on_fail: request.on_fail,
            parent_flow_id: None,
            error: None,
            created_at: Utc::now(),
        };
        self.lock().entry(request.chat_id).or_default().push(entry);
        id
    }

    pub fn get(&self, chat_id: &str, flow_id: &str) -> Option<FlowEntry> {
        self.lock().get(chat_id)?.iter().find(|f| f.id == flow_id).cloned()
    }

    /// The flow the conversation should be working on: the IN_PROGRESS entry
    /// if any, otherwise the highest-priority PENDING entry (ties broken by
    /// earliest creation).
    pub fn get_active(&self, chat_id: &str) -> Option<FlowEntry> {
        let guard = self.lock();
        let flows = guard.get(chat_id)?;
        if let Some(active) = flows.iter().find(|f| f.status == FlowStatus::InProgress) {
            return Some(active.clone());
        }
        flows
            .iter()
            .filter(|f| f.status == FlowStatus::Pending)
            .max_by(|a, b| {
                a.priority.cmp(&b.priority).then(b.created_at.cmp(&a.created_at))
            })
            .cloned()
    }

    /// Activate a flow, demoting any other IN_PROGRESS entry to PAUSED so the
    /// single-active invariant holds.
    pub fn mark_in_progress(&self, chat_id: &str, flow_id: &str) -> Option<FlowEntry> {
        let mut guard = self.lock();
        let flows = guard.get_mut(chat_id)?;
        for flow in flows.iter_mut() {
            if flow.id != flow_id && flow.status == FlowStatus::InProgress {
                flow.status = FlowStatus::Paused;
            }
        }
        let flow = flows.iter_mut().find(|f| f.id == flow_id)?;
        flow.status = FlowStatus::InProgress;
        Some(flow.clone())
    }

    pub fn update_flow(&self, chat_id: &str, flow_id: &str, patch: FlowPatch) -> Option<FlowEntry> {
        let mut guard = self.lock();
        let flow = guard.get_mut(chat_id)?.iter_mut().find(|f| f.id == flow_id)?;
        if let Some(fields) = patch.collected_fields {
            for (key, value) in fields {
                flow.collected_fields.insert(key, value);
            }
        }
        if let Some(required) = patch.required_fields {
            flow.required_fields = required;
        }
        if let Some(priority) = patch.priority {
            flow.priority = priority;
        }
        Some(flow.clone())
    }

    /// Complete a flow. Chains `on_complete` into a new PENDING flow carrying
    /// `_parent_result`, wakes any flow paused on this one (injecting
    /// `_dependency_result`), and prunes old completed entries.
    pub fn complete(&self, chat_id: &str, flow_id: &str, result: Value) -> Option<FlowEntry> {
        let mut guard = self.lock();
        let flows = guard.get_mut(chat_id)?;
        let completed_index = flows.iter().position(|f| f.id == flow_id)?;
        flows[completed_index].status = FlowStatus::Completed;
        let on_complete = flows[completed_index].on_complete.take();

        for flow in flows.iter_mut() {
            if flow.status == FlowStatus::Paused && flow.depends_on.as_deref() == Some(flow_id) {
                flow.status = FlowStatus::Pending;
                flow.collected_fields.insert("_dependency_result".to_string(), result.clone());
            }
        }

        let next = on_complete.map(|template| {
            let mut collected = template.data.clone();
            collected.insert("_parent_result".to_string(), result.clone());
            let entry = FlowEntry {
                id: Uuid::new_v4().to_string(),
                chat_id: chat_id.to_string(),
                kind: template.kind,
                table_id: template.table_id,
                table_name: template.table_name,
                status: FlowStatus::Pending,
                priority: 0,
                collected_fields: collected,
                required_fields: template.required_fields,
                depends_on: None,
                on_complete: None,
                on_fail: None,
                parent_flow_id: Some(flow_id.to_string()),
                error: None,
                created_at: Utc::now(),
            };
            flows.push(entry.clone());
            entry
        });

        prune_completed(flows);
        next
    }

    /// Fail a flow. A recovery flow from `on_fail` is synthesized and
    /// returned but not activated; the caller decides whether to run it.
    pub fn fail(&self, chat_id: &str, flow_id: &str, error: impl Into<String>) -> Option<FlowEntry> {
        let mut guard = self.lock();
        let flows = guard.get_mut(chat_id)?;
        let flow = flows.iter_mut().find(|f| f.id == flow_id)?;
        flow.status = FlowStatus::Failed;
        flow.error = Some(error.into());
        let template = flow.on_fail.take()?;

        Some(FlowEntry {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            kind: template.kind,
            table_id: template.table_id,
            table_name: template.table_name,
            status: FlowStatus::Pending,
            priority: 0,
            collected_fields: template.data,
            required_fields: template.required_fields,
            depends_on: None,
            on_complete: None,
            on_fail: None,
            parent_flow_id: Some(flow_id.to_string()),
            error: None,
            created_at: Utc::now(),
        })
    }

    pub fn cancel(&self, chat_id: &str, flow_id: &str) -> bool {
        let mut guard = self.lock();
        let Some(flows) = guard.get_mut(chat_id) else { return false };
        let Some(flow) = flows.iter_mut().find(|f| f.id == flow_id) else { return false };
        flow.status = FlowStatus::Cancelled;
        true
    }

    pub fn list(&self, chat_id: &str) -> Vec<FlowEntry> {
        self.lock().get(chat_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<FlowEntry>>> {
        match self.flows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn prune_completed(flows: &mut Vec<FlowEntry>) {
    let completed: Vec<usize> = flows
        .iter()
        .enumerate()
        .filter(|(_, f)| f.status == FlowStatus::Completed)
        .map(|(i, _)| i)
        .collect();
    if completed.len() <= COMPLETED_HISTORY_KEEP {
        return;
    }
    let drop_count = completed.len() - COMPLETED_HISTORY_KEEP;
    // Entries are in insertion order, so the first N completed are oldest.
    let drop_ids: Vec<String> =
        completed.iter().take(drop_count).map(|&i| flows[i].id.clone()).collect();
    flows.retain(|f| !drop_ids.contains(&f.id));
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use crate::schema::TableId;

    use super::{FlowKind, FlowRequest, FlowStack, FlowStatus, FlowTemplate};

    fn request(chat: &str, table: &str, priority: i32) -> FlowRequest {
        FlowRequest {
            chat_id: chat.to_string(),
            kind: Some(FlowKind::Create),
            table_id: Some(TableId(format!("tbl-{table}"))),
            table_name: table.to_string(),
            priority,
            ..FlowRequest::default()
        }
    }

    #[test]
    fn single_in_progress_invariant_holds() {
        let stack = FlowStack::new();
        let first = stack.push(request("chat-1", "clientes", 0));
        let second = stack.push(request("chat-1", "citas", 0));

        stack.mark_in_progress("chat-1", &first);
        stack.mark_in_progress("chat-1", &second);

        let flows = stack.list("chat-1");
        let in_progress: Vec<_> =
            flows.iter().filter(|f| f.status == FlowStatus::InProgress).collect();
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].id, second);
        assert_eq!(stack.get("chat-1", &first).unwrap().status, FlowStatus::Paused);
    }

    #[test]
    fn active_prefers_in_progress_then_priority_then_age() {
        let stack = FlowStack::new();
        let low = stack.push(request("chat-1", "notas", 1));
        let high = stack.push(request("chat-1", "citas", 5));

        assert_eq!(stack.get_active("chat-1").unwrap().id, high);

        stack.mark_in_progress("chat-1", &low);
        assert_eq!(stack.get_active("chat-1").unwrap().id, low);
    }

    #[test]
    fn completion_spawns_chained_flow_with_parent_result() {
        let stack = FlowStack::new();
        let flow_id = stack.push(FlowRequest {
            on_complete: Some(FlowTemplate {
                kind: FlowKind::Create,
                table_id: TableId("tbl-citas".to_string()),
                table_name: "Citas".to_string(),
                data: {
                    let mut data = Map::new();
                    data.insert("canal".to_string(), json!("chat"));
                    data
                },
                required_fields: vec!["fecha".to_string()],
            }),
            ..request("chat-1", "clientes", 0)
        });

        let next = stack
            .complete("chat-1", &flow_id, json!({"record_id": "rec-77"}))
            .expect("chained flow");

        assert_eq!(next.table_name, "Citas");
        assert_eq!(next.status, FlowStatus::Pending);
        assert_eq!(next.parent_flow_id.as_deref(), Some(flow_id.as_str()));
        assert_eq!(
            next.collected_fields.get("_parent_result"),
            Some(&json!({"record_id": "rec-77"}))
        );
        assert_eq!(next.collected_fields.get("canal"), Some(&json!("chat")));
    }

    #[test]
    fn dependent_flow_wakes_when_dependency_completes() {
        let stack = FlowStack::new();
        let dependency = stack.push(request("chat-1", "clientes", 0));
        let dependent = stack.push(FlowRequest {
            depends_on: Some(dependency.clone()),
            ..request("chat-1", "citas", 0)
        });

        assert_eq!(stack.get("chat-1", &dependent).unwrap().status, FlowStatus::Paused);

        stack.complete("chat-1", &dependency, json!({"record_id": "rec-1"}));

        let woken = stack.get("chat-1", &dependent).unwrap();
        assert_eq!(woken.status, FlowStatus::Pending);
        assert_eq!(
            woken.collected_fields.get("_dependency_result"),
            Some(&json!({"record_id": "rec-1"}))
        );
    }

    #[test]
    fn failure_returns_recovery_without_activating_it() {
        let stack = FlowStack::new();
        let flow_id = stack.push(FlowRequest {
            on_fail: Some(FlowTemplate {
                kind: FlowKind::Query,
                table_id: TableId("tbl-citas".to_string()),
                table_name: "Citas".to_string(),
                data: Map::new(),
                required_fields: Vec::new(),
            }),
            ..request("chat-1", "citas", 0)
        });

        let recovery = stack.fail("chat-1", &flow_id, "booking conflict").expect("recovery flow");
        assert_eq!(recovery.status, FlowStatus::Pending);
        assert_eq!(recovery.kind, FlowKind::Query);

        // Recovery is returned, not stored.
        assert!(stack.get("chat-1", &recovery.id).is_none());
        let failed = stack.get("chat-1", &flow_id).unwrap();
        assert_eq!(failed.status, FlowStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("booking conflict"));
    }

    #[test]
    fn completed_history_is_pruned_beyond_keep_limit() {
        let stack = FlowStack::new();
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(stack.push(request("chat-1", &format!("t{i}"), 0)));
        }
        for id in &ids {
            stack.complete("chat-1", id, json!({}));
        }

        let completed: Vec<_> = stack
            .list("chat-1")
            .into_iter()
            .filter(|f| f.status == FlowStatus::Completed)
            .collect();
        assert_eq!(completed.len(), super::COMPLETED_HISTORY_KEEP);
        // Oldest entries were dropped.
        assert!(!completed.iter().any(|f| f.id == ids[0]));
        assert!(completed.iter().any(|f| f.id == ids[7]));
    }

    #[test]
    fn chats_do_not_share_flows() {
        let stack = FlowStack::new();
        stack.push(request("chat-1", "citas", 0));
        assert!(stack.get_active("chat-2").is_none());
    }
}
