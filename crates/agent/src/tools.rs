//! Tool schemas offered to the oracle.
//!
//! One descriptor per action category. The `record_type` parameter of the
//! data tools carries an enum of the tenant's real table names; that
//! injection is what keeps the oracle from inventing a table.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    CheckAvailability,
    CreateRecord,
    QueryRecords,
    UpdateRecord,
    AnalyzeData,
    GeneralConversation,
    SetupWorkspace,
    CreateFlow,
}

impl ToolKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckAvailability => "check_availability",
            Self::CreateRecord => "create_record",
            Self::QueryRecords => "query_records",
            Self::UpdateRecord => "update_record",
            Self::AnalyzeData => "analyze_data",
            Self::GeneralConversation => "general_conversation",
            Self::SetupWorkspace => "setup_workspace",
            Self::CreateFlow => "create_flow",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "check_availability" => Some(Self::CheckAvailability),
            "create_record" => Some(Self::CreateRecord),
            "query_records" => Some(Self::QueryRecords),
            "update_record" => Some(Self::UpdateRecord),
            "analyze_data" => Some(Self::AnalyzeData),
            "general_conversation" => Some(Self::GeneralConversation),
            "setup_workspace" => Some(Self::SetupWorkspace),
            "create_flow" => Some(Self::CreateFlow),
            _ => None,
        }
    }

    pub fn all() -> [ToolKind; 8] {
        [
            Self::CheckAvailability,
            Self::CreateRecord,
            Self::QueryRecords,
            Self::UpdateRecord,
            Self::AnalyzeData,
            Self::GeneralConversation,
            Self::SetupWorkspace,
            Self::CreateFlow,
        ]
    }

    /// Tools whose `record_type` must be pinned to the tenant's tables.
    fn uses_record_type(&self) -> bool {
        matches!(
            self,
            Self::CheckAvailability
                | Self::CreateRecord
                | Self::QueryRecords
                | Self::UpdateRecord
                | Self::AnalyzeData
                | Self::CreateFlow
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Build the tool list for one tenant, injecting its real table names into
/// every `record_type` enum.
pub fn build_tools(table_names: &[String]) -> Vec<ToolDescriptor> {
    ToolKind::all().iter().map(|kind| descriptor(*kind, table_names)).collect()
}

fn record_type_schema(table_names: &[String]) -> Value {
    let mut schema = json!({
        "type": "string",
        "description": "Which table this operation targets",
    });
    if !table_names.is_empty() {
        schema["enum"] = json!(table_names);
    }
    schema
}

fn descriptor(kind: ToolKind, table_names: &[String]) -> ToolDescriptor {
    let mut parameters = match kind {
        ToolKind::CheckAvailability => json!({
            "type": "object",
            "properties": {
                "record_type": {},
                "fecha": { "type": "string", "description": "Date to check, YYYY-MM-DD" },
                "hora": { "type": "string", "description": "Time to check, HH:MM" }
            },
            "required": ["fecha"]
        }),
        ToolKind::CreateRecord => json!({
            "type": "object",
            "properties": {
                "record_type": {},
                "fields": {
                    "type": "object",
                    "description": "Field values already present in the user's message"
                }
            },
            "required": ["record_type"]
        }),
        ToolKind::QueryRecords => json!({
            "type": "object",
            "properties": {
                "record_type": {},
                "filters": {
                    "type": "object",
                    "description": "Equality filters over field values"
                },
                "limit": { "type": "integer" }
            },
            "required": ["record_type"]
        }),
        ToolKind::UpdateRecord => json!({
            "type": "object",
            "properties": {
                "record_type": {},
                "record_id": { "type": "string" },
                "filters": {
                    "type": "object",
                    "description": "How to locate the record when no id is known"
                },
                "fields": { "type": "object", "description": "Fields to change" }
            },
            "required": ["record_type", "fields"]
        }),
        ToolKind::AnalyzeData => json!({
            "type": "object",
            "properties": {
                "record_type": {},
                "question": { "type": "string" }
            },
            "required": ["record_type"]
        }),
        ToolKind::GeneralConversation => json!({
            "type": "object",
            "properties": {
                "message": { "type": "string", "description": "What the user said" }
            }
        }),
        ToolKind::SetupWorkspace => json!({
            "type": "object",
            "properties": {
                "tables": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "fields": { "type": "array", "items": { "type": "object" } }
                        },
                        "required": ["name"]
                    }
                }
            },
            "required": ["tables"]
        }),
        ToolKind::CreateFlow => json!({
            "type": "object",
            "properties": {
                "record_type": {},
                "then_record_type": {
                    "type": "string",
                    "description": "Table for the follow-up flow once this one completes"
                }
            },
            "required": ["record_type"]
        }),
    };

    if kind.uses_record_type() {
        parameters["properties"]["record_type"] = record_type_schema(table_names);
    }

    ToolDescriptor {
        name: kind.name().to_string(),
        description: description_for(kind).to_string(),
        parameters,
    }
}

fn description_for(kind: ToolKind) -> &'static str {
    match kind {
        ToolKind::CheckAvailability => {
            "Check whether a date/time slot is free before booking anything"
        }
        ToolKind::CreateRecord => {
            "Start or continue creating a record; use whenever the user wants to register, book, or add something"
        }
        ToolKind::QueryRecords => "Look up existing records, list them, or answer questions about what is stored",
        ToolKind::UpdateRecord => "Change fields of an existing record",
        ToolKind::AnalyzeData => "Aggregate or summarize records (counts, totals)",
        ToolKind::GeneralConversation => {
            "Small talk, greetings, or anything unrelated to the workspace data"
        }
        ToolKind::SetupWorkspace => "Create or adjust the tenant's table definitions",
        ToolKind::CreateFlow => "Chain multi-step work: create one record, then another that depends on it",
    }
}
