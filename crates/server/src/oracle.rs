//! HTTP oracle adapter.
//!
//! Speaks the OpenAI-compatible chat-completions protocol (OpenAI itself and
//! Ollama's `/v1` endpoint) and Anthropic's messages protocol. Anything the
//! provider returns is decoded into the neutral [`OracleReply`] shapes; the
//! engine re-validates all of it.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::{json, Value};

use clerky_agent::{
    Classification, Completion, MessageCategory, OracleClient, OracleMessage, OracleReply,
    ToolDescriptor,
};
use clerky_core::config::{LlmConfig, LlmProvider};
use clerky_core::context::Role;

pub struct HttpOracle {
    client: Client,
    provider: LlmProvider,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpOracle {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("building http client")?;

        let base_url = match config.provider {
            LlmProvider::OpenAi => config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            LlmProvider::Anthropic => config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            LlmProvider::Ollama => {
                let base = config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());
                format!("{}/v1", base.trim_end_matches('/'))
            }
        };

        Ok(Self {
            client,
            provider: config.provider,
            base_url,
            api_key: config.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            model: config.model.clone(),
        })
    }

    async fn chat_completions(&self, body: Value) -> Result<Value> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.context("oracle request failed")?;
        let status = response.status();
        let payload: Value = response.json().await.context("oracle returned non-JSON")?;
        if !status.is_success() {
            return Err(anyhow!("oracle returned {status}: {payload}"));
        }
        Ok(payload)
    }

    async fn anthropic_messages(&self, body: Value) -> Result<Value> {
        let url = format!("{}/messages", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request.send().await.context("oracle request failed")?;
        let status = response.status();
        let payload: Value = response.json().await.context("oracle returned non-JSON")?;
        if !status.is_success() {
            return Err(anyhow!("oracle returned {status}: {payload}"));
        }
        Ok(payload)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

fn openai_messages(system_prompt: Option<&str>, messages: &[OracleMessage]) -> Vec<Value> {
    let mut rendered = Vec::new();
    if let Some(system) = system_prompt {
        rendered.push(json!({ "role": "system", "content": system }));
    }
    for message in messages {
        rendered.push(json!({ "role": role_name(message.role), "content": message.content }));
    }
    rendered
}

fn openai_tools(tools: &[ToolDescriptor]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect()
}

pub(crate) fn parse_openai_reply(payload: &Value) -> Result<OracleReply> {
    let message = payload
        .pointer("/choices/0/message")
        .ok_or_else(|| anyhow!("oracle response missing choices[0].message"))?;

    if let Some(call) = message.pointer("/tool_calls/0/function") {
        let name = call
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("tool call missing name"))?
            .to_string();
        let raw_arguments = call.get("arguments").cloned().unwrap_or(Value::Null);
        let arguments = match raw_arguments {
            Value::String(text) => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            other => other,
        };
        return Ok(OracleReply::ToolCall { name, arguments });
    }

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(OracleReply::Text(content))
}

pub(crate) fn parse_anthropic_reply(payload: &Value) -> Result<OracleReply> {
    let blocks = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("oracle response missing content blocks"))?;

    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("tool_use") {
            let name = block
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("tool_use block missing name"))?
                .to_string();
            let arguments = block.get("input").cloned().unwrap_or(Value::Null);
            return Ok(OracleReply::ToolCall { name, arguments });
        }
    }

    let text = blocks
        .iter()
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    Ok(OracleReply::Text(text))
}

pub(crate) fn parse_classification(raw: &str) -> Classification {
    let cleaned = raw.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```").trim();
    match serde_json::from_str::<Classification>(cleaned) {
        Ok(classification) => classification,
        Err(_) => {
            // An unclassifiable reply must not block legitimate users.
            Classification { is_valid: true, category: MessageCategory::Valid }
        }
    }
}

const CLASSIFY_PROMPT: &str = "Clasifica el siguiente mensaje de un usuario de un asistente de \
negocios. Responde SOLO con JSON: {\"is_valid\": bool, \"category\": \"VALID\"|\"GARBAGE\"|\
\"SPAM\"|\"ABUSE\"|\"OFF_TOPIC\"}. GARBAGE es texto sin sentido; VALID es cualquier solicitud \
razonable.\n\nMensaje: ";

#[async_trait]
impl OracleClient for HttpOracle {
    async fn classify(&self, text: &str) -> Result<Classification> {
        let prompt = format!("{CLASSIFY_PROMPT}{text}");
        let completion = self
            .complete(&[OracleMessage::new(Role::User, prompt)], &self.model, 100, 0.0)
            .await?;
        Ok(parse_classification(&completion.content))
    }

    async fn function_call(
        &self,
        system_prompt: &str,
        messages: &[OracleMessage],
        tools: &[ToolDescriptor],
        model: &str,
    ) -> Result<OracleReply> {
        match self.provider {
            LlmProvider::Anthropic => {
                let body = json!({
                    "model": model,
                    "max_tokens": 1024,
                    "system": system_prompt,
                    "messages": messages.iter().map(|m| json!({
                        "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                        "content": m.content,
                    })).collect::<Vec<_>>(),
                    "tools": tools.iter().map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })).collect::<Vec<_>>(),
                });
                parse_anthropic_reply(&self.anthropic_messages(body).await?)
            }
            LlmProvider::OpenAi | LlmProvider::Ollama => {
                let body = json!({
                    "model": model,
                    "messages": openai_messages(Some(system_prompt), messages),
                    "tools": openai_tools(tools),
                });
                parse_openai_reply(&self.chat_completions(body).await?)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[OracleMessage],
        model: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Completion> {
        match self.provider {
            LlmProvider::Anthropic => {
                let body = json!({
                    "model": model,
                    "max_tokens": max_tokens,
                    "temperature": temperature,
                    "messages": messages.iter().map(|m| json!({
                        "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                        "content": m.content,
                    })).collect::<Vec<_>>(),
                });
                let payload = self.anthropic_messages(body).await?;
                match parse_anthropic_reply(&payload)? {
                    OracleReply::Text(content) => Ok(Completion { content }),
                    OracleReply::ToolCall { .. } => {
                        Err(anyhow!("completion returned a tool call"))
                    }
                }
            }
            LlmProvider::OpenAi | LlmProvider::Ollama => {
                let body = json!({
                    "model": model,
                    "messages": openai_messages(None, messages),
                    "max_tokens": max_tokens,
                    "temperature": temperature,
                });
                let payload = self.chat_completions(body).await?;
                match parse_openai_reply(&payload)? {
                    OracleReply::Text(content) => Ok(Completion { content }),
                    OracleReply::ToolCall { .. } => {
                        Err(anyhow!("completion returned a tool call"))
                    }
                }
            }
        }
    }
}
