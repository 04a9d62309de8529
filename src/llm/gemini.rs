//! Gemini API client
//!
//! Implements extraction (JSON-schema constrained output), replies with
//! function calling, and summaries over the `generateContent` endpoint.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::AssistantError;
use crate::llm::{summary_prompt, Extractor, Reply, Responder, Summarizer};
use crate::models::{ConversationMessage, DepositConditions, MessageRole, ToolCall, ToolSpec};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/{}:generateContent", BASE_URL, model),
        })
    }

    async fn generate(&self, request: &GeminiRequest) -> Result<Vec<Part>> {
        if self.api_key.is_empty() {
            return Err(AssistantError::ConfigurationMissing(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        debug!(contents = request.contents.len(), "Calling Gemini API");

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                AssistantError::LlmError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(AssistantError::LlmError(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            AssistantError::LlmError(format!("Gemini parse error: {}", e))
        })?;

        first_candidate_parts(gemini_response)
    }
}

#[async_trait]
impl Extractor for GeminiClient {
    async fn extract(&self, conversation: &[ConversationMessage]) -> Result<DepositConditions> {
        let (system, contents) = to_contents(conversation);
        let request = GeminiRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: 0.0,
                response_mime_type: Some("application/json".to_string()),
                response_schema: Some(deposit_conditions_schema()),
                ..GenerationConfig::default()
            },
            system_instruction: system.map(SystemInstruction::from_text),
            tools: Vec::new(),
        };

        let parts = self.generate(&request).await?;
        let conditions = parse_conditions(&collect_text(&parts))?;
        info!(
            amount = ?conditions.deposit_amount,
            duration = ?conditions.deposit_duration,
            "Gemini extraction complete"
        );
        Ok(conditions)
    }
}

#[async_trait]
impl Responder for GeminiClient {
    async fn respond(&self, conversation: &[ConversationMessage], tools: &[ToolSpec]) -> Result<Reply> {
        let (system, contents) = to_contents(conversation);

        let request = GeminiRequest {
            contents,
            generation_config: GenerationConfig::default(),
            system_instruction: system.map(SystemInstruction::from_text),
            tools: tool_declarations(tools),
        };

        let parts = self.generate(&request).await?;
        into_reply(parts)
    }
}

#[async_trait]
impl Summarizer for GeminiClient {
    async fn summarize(&self, amount: u64, duration: u32, rate: Decimal) -> Result<String> {
        let request = GeminiRequest {
            contents: vec![Content::text("user", summary_prompt(amount, duration, rate))],
            generation_config: GenerationConfig::default(),
            system_instruction: None,
            tools: Vec::new(),
        };

        let text = collect_text(&self.generate(&request).await?);
        if text.trim().is_empty() {
            return Err(AssistantError::LlmError("Empty summary from Gemini".to_string()));
        }
        Ok(text)
    }
}

/// Split the conversation into a system instruction and chat contents
fn to_contents(conversation: &[ConversationMessage]) -> (Option<String>, Vec<Content>) {
    let mut system = Vec::new();
    let mut contents = Vec::with_capacity(conversation.len());

    for message in conversation {
        match message.role {
            MessageRole::System => system.push(message.content.clone()),
            MessageRole::User => contents.push(Content::text("user", message.content.clone())),
            MessageRole::Agent => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(Part::text(message.content.clone()));
                }
                for call in &message.tool_calls {
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            name: call.name.clone(),
                            args: call.arguments.clone(),
                        }),
                        ..Part::default()
                    });
                }
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
            }
            MessageRole::Tool => contents.push(Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    function_response: Some(FunctionResponse {
                        name: message.name.clone().unwrap_or_default(),
                        response: json!({ "result": message.content }),
                    }),
                    ..Part::default()
                }],
            }),
        }
    }

    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, contents)
}

fn tool_declarations(tools: &[ToolSpec]) -> Vec<ToolDeclarations> {
    if tools.is_empty() {
        return Vec::new();
    }
    vec![ToolDeclarations {
        function_declarations: tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
            })
            .collect(),
    }]
}

fn deposit_conditions_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "deposit_amount": {
                "type": "INTEGER",
                "description": "Amount of money user would like to allocate for a deposit in EUR. \
                                Set amount value to -1 if user didn't tell it yet."
            },
            "deposit_duration": {
                "type": "INTEGER",
                "description": "Duration of deposit in days - latest duration provided by user. \
                                Set duration value to -1 if user didn't tell it yet."
            }
        },
        "required": ["deposit_amount", "deposit_duration"]
    })
}

#[derive(Debug, Deserialize)]
struct RawConditions {
    #[serde(default = "unknown")]
    deposit_amount: i64,
    #[serde(default = "unknown")]
    deposit_duration: i64,
}

fn unknown() -> i64 {
    -1
}

fn parse_conditions(text: &str) -> Result<DepositConditions> {
    let raw: RawConditions = serde_json::from_str(text.trim()).map_err(|e| {
        AssistantError::LlmError(format!("Unparseable extraction output '{}': {}", text, e))
    })?;
    Ok(DepositConditions::from_raw(raw.deposit_amount, raw.deposit_duration))
}

fn first_candidate_parts(response: GeminiResponse) -> Result<Vec<Part>> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| AssistantError::LlmError("No response from Gemini API".to_string()))?;

    let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
    if parts.is_empty() {
        return Err(AssistantError::LlmError(format!(
            "Empty response from Gemini (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }
    Ok(parts)
}

fn collect_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
}

fn into_reply(parts: Vec<Part>) -> Result<Reply> {
    let calls: Vec<ToolCall> = parts
        .iter()
        .filter_map(|p| p.function_call.as_ref())
        .map(|call| ToolCall::new(call.name.clone(), call.args.clone()))
        .collect();

    if !calls.is_empty() {
        return Ok(Reply::ToolCalls(calls));
    }

    let text = collect_text(&parts);
    if text.trim().is_empty() {
        return Err(AssistantError::LlmError("Empty reply from Gemini".to_string()));
    }
    Ok(Reply::Message(text))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclarations>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: &str, text: String) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 1024,
            response_mime_type: None,
            response_schema: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

impl SystemInstruction {
    fn from_text(text: String) -> Self {
        Self {
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}
