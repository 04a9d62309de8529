//! Language model capabilities
//!
//! The workflow only sees three narrow traits. Gemini implements all of
//! them over REST; `MockLanguageModel` implements them offline.

use crate::config::{AppConfig, LlmProvider};
use crate::error::AssistantError;
use crate::models::{ConversationMessage, DepositConditions, ToolCall, ToolSpec};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

pub mod gemini;
pub mod mock;

pub use gemini::GeminiClient;
pub use mock::MockLanguageModel;

/// Output of the free-form reply capability
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Message(String),
    ToolCalls(Vec<ToolCall>),
}

/// Structured extraction of deposit conditions from the conversation
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, conversation: &[ConversationMessage]) -> Result<DepositConditions>;
}

/// Free-form reply, possibly requesting tool calls
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, conversation: &[ConversationMessage], tools: &[ToolSpec]) -> Result<Reply>;
}

/// Final summary of an agreed deposit
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, amount: u64, duration: u32, rate: Decimal) -> Result<String>;
}

/// The capabilities injected into the orchestrator
#[derive(Clone)]
pub struct Capabilities {
    pub extractor: Arc<dyn Extractor>,
    pub responder: Arc<dyn Responder>,
    pub summarizer: Arc<dyn Summarizer>,
}

impl Capabilities {
    /// All three capabilities backed by one model
    pub fn from_model<M>(model: Arc<M>) -> Self
    where
        M: Extractor + Responder + Summarizer + 'static,
    {
        Self {
            extractor: model.clone(),
            responder: model.clone(),
            summarizer: model,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        match config.provider {
            LlmProvider::Mock => Ok(Self::from_model(Arc::new(MockLanguageModel::new()))),
            LlmProvider::Gemini => {
                let api_key = config.gemini_api_key.clone().ok_or_else(|| {
                    AssistantError::ConfigurationMissing("GEMINI_API_KEY".to_string())
                })?;
                let client = GeminiClient::new(api_key, &config.gemini_model)?;
                Ok(Self::from_model(Arc::new(client)))
            }
        }
    }
}

/// Prompt for the closing message
pub fn summary_prompt(amount: u64, duration: u32, rate: Decimal) -> String {
    format!(
        "Inform the client briefly about the deposit: {} euros for {} days at a rate of {}%. \
         Do not ask additional questions, only provide information.",
        amount, duration, rate
    )
}
