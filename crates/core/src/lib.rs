pub mod audit;
pub mod config;
pub mod confirm;
pub mod context;
pub mod errors;
pub mod flows;
pub mod history;
pub mod kv;
pub mod repo;
pub mod rules;
pub mod schema;
pub mod validate;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use confirm::{
    ConfirmationDraft, ConfirmationManager, ConfirmationReply, ConfirmationState,
    ConfirmationStatus,
};
pub use context::{
    ChatContext, ChatData, ChatDocument, ChatMessage, MergeReport, PendingRecord, PendingRelation,
    RejectReason, Role,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use flows::{FlowEntry, FlowKind, FlowPatch, FlowRequest, FlowStack, FlowStatus, FlowTemplate};
pub use history::{
    is_undo_request, rollback_instructions, ActionInput, ActionKind, ActionLog, ActionRecord,
    RollbackInstructions, RollbackOperation,
};
pub use kv::{InMemoryKeyValueStore, KeyValueStore, TtlCache};
pub use repo::{
    record_matches_filters, ChatRepository, RecordFilters, RecordRepository, RepoError,
    StoredRecord, TableRepository,
};
pub use rules::{Condition, ConditionNode, GroupLogic, Rule, RuleAction, RuleEngine, RuleOutcome};
pub use schema::{
    names_match_loosely, normalize_name, CustomRule, CustomRuleSpec, FieldSpec, FieldType,
    RelationSpec, TableConfig, TableId, ValidationRules,
};
pub use validate::{
    validate_all, validate_field, value_is_empty, BatchOptions, BatchValidation, FieldError,
    FieldErrorKind, FieldValidation, ValidateOptions,
};

// Re-export so downstream crates share one chrono/serde_json surface.
pub use chrono;
pub use serde_json;
