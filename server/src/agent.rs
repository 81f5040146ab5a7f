//! Chat agent that drives the file tools through an OpenAI-compatible model.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::tools::{render, ToolContext, ToolError, ToolRegistry};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("no final answer after {0} steps")]
    StepLimit(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as the provider sends them.
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }

    pub fn tool_result(call_id: &str, content: String) -> Self {
        Self { role: Role::Tool, content: Some(content), tool_calls: None, tool_call_id: Some(call_id.to_string()) }
    }

    fn pending_calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or(&[])
    }
}

/// One completion round trip.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn default_model(&self) -> &str;

    async fn complete(&self, model: &str, messages: &[ChatMessage], tools: &[Value]) -> Result<ChatMessage, AgentError>;
}

pub struct OpenAiCompatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatModel {
    /// `None` when no API key is configured.
    pub fn from_config(cfg: &LlmConfig) -> Option<Self> {
        let api_key = cfg.api_key.clone().filter(|k| !k.trim().is_empty())?;
        Some(Self {
            client: reqwest::Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatModel {
    fn default_model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, model: &str, messages: &[ChatMessage], tools: &[Value]) -> Result<ChatMessage, AgentError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({ "model": model, "messages": messages });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        let resp = self.client.post(&url).bearer_auth(&self.api_key).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(AgentError::Provider { status: status.as_u16(), message });
        }
        first_choice(resp.json::<Value>().await?)
    }
}

/// Pull `choices[0].message` out of a completion response.
fn first_choice(mut body: Value) -> Result<ChatMessage, AgentError> {
    let message = body
        .get_mut("choices")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.get_mut("message"))
        .map(Value::take)
        .ok_or_else(|| AgentError::InvalidResponse("missing choices[0].message".into()))?;
    serde_json::from_value(message).map_err(|e| AgentError::InvalidResponse(e.to_string()))
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    pub content: String,
    pub model: String,
    pub steps: usize,
}

pub struct FileAgent {
    model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    ctx: ToolContext,
    max_steps: usize,
}

impl FileAgent {
    pub fn new(model: Arc<dyn ChatModel>, registry: Arc<ToolRegistry>, ctx: ToolContext, max_steps: usize) -> Self {
        Self { model, registry, ctx, max_steps: max_steps.max(1) }
    }

    fn system_prompt(&self) -> String {
        let roots: Vec<String> = self.ctx.authorizer.roots().iter().map(|r| format!("- {}", r.display())).collect();
        format!(
            "You are a file management assistant. You can rename, move, copy, delete, create and zip files, \
             create directories, and search the recorded file history using the provided tools. \
             Only paths inside these directories may be touched:\n{}\n\
             Always use absolute paths. Report tool errors to the user instead of retrying blindly.",
            if roots.is_empty() { "(none configured)".to_string() } else { roots.join("\n") }
        )
    }

    fn tool_specs(&self) -> Vec<Value> {
        self.registry
            .list_tools()
            .into_iter()
            .map(|t| json!({ "type": "function", "function": { "name": t.name, "description": t.description, "parameters": t.input_schema } }))
            .collect()
    }

    pub async fn run(&self, history: Vec<ChatMessage>, model: Option<&str>) -> Result<AgentReply, AgentError> {
        let model = model.filter(|m| !m.is_empty()).unwrap_or(self.model.default_model()).to_string();
        let tools = self.tool_specs();
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::text(Role::System, self.system_prompt()));
        messages.extend(history.into_iter().filter(|m| m.role != Role::System));

        for step in 1..=self.max_steps {
            let reply = self.model.complete(&model, &messages, &tools).await?;
            if reply.pending_calls().is_empty() {
                info!(steps = step, model = %model, "agent finished");
                return Ok(AgentReply { content: reply.content.unwrap_or_default(), model, steps: step });
            }
            let calls = reply.pending_calls().to_vec();
            messages.push(reply);
            for call in calls {
                let output = self.invoke(&call).await;
                debug!(tool = %call.function.name, step, "tool result: {}", output);
                messages.push(ChatMessage::tool_result(&call.id, output));
            }
        }
        warn!(max_steps = self.max_steps, "agent step limit reached");
        Err(AgentError::StepLimit(self.max_steps))
    }

    async fn invoke(&self, call: &ToolCall) -> String {
        let args: Value = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str(&call.function.arguments) {
                Ok(v) => v,
                Err(e) => return render(Err(ToolError::InvalidArguments(e))),
            }
        };
        let (registry, ctx, name) = (self.registry.clone(), self.ctx.clone(), call.function.name.clone());
        match tokio::task::spawn_blocking(move || render(registry.call(&name, args, &ctx))).await {
            Ok(output) => output,
            Err(err) => format!("Error: tool task failed: {}", err),
        }
    }
}
