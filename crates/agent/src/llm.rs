//! Oracle boundary.
//!
//! The LLM is a non-deterministic black box with three contracts: classify a
//! message, pick a function call given tool schemas, and complete free text.
//! Everything it returns is untrusted and re-validated downstream.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use clerky_core::context::Role;

use crate::tools::ToolDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageCategory {
    Valid,
    Garbage,
    Spam,
    Abuse,
    OffTopic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub is_valid: bool,
    pub category: MessageCategory,
}

impl Classification {
    pub fn valid() -> Self {
        Self { is_valid: true, category: MessageCategory::Valid }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OracleMessage {
    pub role: Role,
    pub content: String,
}

impl OracleMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OracleReply {
    /// Direct natural-language answer; returned to the user verbatim.
    Text(String),
    /// A selected tool plus untrusted arguments.
    ToolCall { name: String, arguments: Value },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub content: String,
}

#[async_trait]
pub trait OracleClient: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification>;

    async fn function_call(
        &self,
        system_prompt: &str,
        messages: &[OracleMessage],
        tools: &[ToolDescriptor],
        model: &str,
    ) -> Result<OracleReply>;

    async fn complete(
        &self,
        messages: &[OracleMessage],
        model: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Completion>;
}

/// Deterministic oracle for tests: replies are drained in order. A classify
/// script is optional; unscripted classifications default to VALID.
#[derive(Default)]
pub struct ScriptedOracle {
    classifications: std::sync::Mutex<std::collections::VecDeque<Classification>>,
    replies: std::sync::Mutex<std::collections::VecDeque<OracleReply>>,
    completions: std::sync::Mutex<std::collections::VecDeque<String>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_classification(&self, classification: Classification) {
        self.classifications.lock().expect("lock").push_back(classification);
    }

    pub fn push_reply(&self, reply: OracleReply) {
        self.replies.lock().expect("lock").push_back(reply);
    }

    pub fn push_completion(&self, content: impl Into<String>) {
        self.completions.lock().expect("lock").push_back(content.into());
    }
}

#[async_trait]
impl OracleClient for ScriptedOracle {
    async fn classify(&self, _text: &str) -> Result<Classification> {
        Ok(self
            .classifications
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(Classification::valid))
    }

    async fn function_call(
        &self,
        _system_prompt: &str,
        _messages: &[OracleMessage],
        _tools: &[ToolDescriptor],
        _model: &str,
    ) -> Result<OracleReply> {
        self.replies
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted oracle has no queued reply"))
    }

    async fn complete(
        &self,
        _messages: &[OracleMessage],
        _model: &str,
        _max_tokens: u32,
        _temperature: f32,
    ) -> Result<Completion> {
        self.completions
            .lock()
            .expect("lock")
            .pop_front()
            .map(|content| Completion { content })
            .ok_or_else(|| anyhow::anyhow!("scripted oracle has no queued completion"))
    }
}
