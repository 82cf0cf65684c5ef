pub mod collector;
pub mod engine;
mod handlers;
pub mod llm;
pub mod prompt;
pub mod quick;
pub mod tools;

pub use collector::{DateContext, Extraction, FieldCollector};
pub use engine::{ChatEngine, EngineOptions, TurnRequest, TurnResponse};
pub use llm::{
    Classification, Completion, MessageCategory, OracleClient, OracleMessage, OracleReply,
    ScriptedOracle,
};
pub use prompt::{build_pending_context, build_system_prompt, TenantProfile};
pub use quick::{classify_flow_sub_intent, classify_quick_pattern, FlowSubIntent, QuickIntent};
pub use tools::{build_tools, ToolDescriptor, ToolKind};
