//! Core data models for the deposit assistant

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Messages =================
//

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Agent,
    Tool,
}

/// A tool invocation requested by the reply capability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// A single message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub role: MessageRole,
    pub content: String,
    /// Producing step or tool (`confirm_amount_and_duration`, `get_rates`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool results; matches `ToolCall::call_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            role,
            content: content.into(),
            name: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Agent, content)
    }

    /// Agent message produced by a named workflow step
    pub fn step(name: &str, content: impl Into<String>) -> Self {
        let mut message = Self::new(MessageRole::Agent, content);
        message.name = Some(name.to_string());
        message
    }

    pub fn tool_request(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut message = Self::new(MessageRole::Agent, content);
        message.tool_calls = calls;
        message
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        let mut message = Self::new(MessageRole::Tool, content);
        message.name = Some(call.name.clone());
        message.tool_call_id = Some(call.call_id.clone());
        message
    }

    /// Pretty print in the console transcript style
    pub fn pretty(&self) -> String {
        let title = match (self.role, self.name.as_deref()) {
            (MessageRole::System, _) => "System Message".to_string(),
            (MessageRole::User, _) => "Human Message".to_string(),
            (MessageRole::Agent, Some(name)) => format!("Agent Message ({})", name),
            (MessageRole::Agent, None) => "Agent Message".to_string(),
            (MessageRole::Tool, Some(name)) => format!("Tool Message ({})", name),
            (MessageRole::Tool, None) => "Tool Message".to_string(),
        };

        let mut out = format!("================ {} ================\n", title);
        if !self.content.is_empty() {
            out.push_str(&self.content);
            out.push('\n');
        }
        for call in &self.tool_calls {
            out.push_str(&format!("  tool call: {} {}\n", call.name, call.arguments));
        }
        out
    }
}

//
// ================= Extraction =================
//

/// Amount and duration recovered from the conversation.
///
/// `None` means the value has not been provided yet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositConditions {
    pub deposit_amount: Option<u64>,
    pub deposit_duration: Option<u32>,
}

impl DepositConditions {
    /// Build from raw model output, where anything not strictly positive
    /// counts as not provided.
    pub fn from_raw(amount: i64, duration: i64) -> Self {
        Self {
            deposit_amount: u64::try_from(amount).ok().filter(|a| *a > 0),
            deposit_duration: u32::try_from(duration).ok().filter(|d| *d > 0),
        }
    }

    pub fn has_both(&self) -> bool {
        self.deposit_amount.is_some() && self.deposit_duration.is_some()
    }
}

//
// ================= Confirmation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    ConfirmAmountAndDuration,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestKind::ConfirmAmountAndDuration => "confirm_amount_and_duration",
        };
        write!(f, "{}", s)
    }
}

/// Emitted at the human-in-the-loop boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub request_id: Uuid,
    pub kind: RequestKind,
    pub question: String,
    pub proposed_amount: u64,
    pub proposed_duration: u32,
}

/// Value supplied by the human to resume a suspended session
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_duration: Option<i64>,
}

impl ResumePayload {
    pub fn confirmed() -> Self {
        Self {
            correct: Some(true),
            ..Self::default()
        }
    }

    pub fn is_confirmation(&self) -> bool {
        self.correct == Some(true)
    }
}

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool_name: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub data: serde_json::Value,
    pub error: Option<String>,
}

/// Name and description advertised to the reply capability
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}
