//! Offline language model
//!
//! Keyword and number heuristics standing in for the hosted model, so the
//! demo and the server run without network access.

use crate::llm::{Extractor, Reply, Responder, Summarizer};
use crate::models::{ConversationMessage, DepositConditions, MessageRole, ToolCall, ToolSpec};
use crate::tools::AvailableCashTool;
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;

const BALANCE_KEYWORDS: &[&str] = &["balance", "cash", "how much do we have", "how much money"];
const WHOLE_AMOUNT_KEYWORDS: &[&str] = &["entire", "everything", "all of it", "all the money", "whole"];

pub struct MockLanguageModel;

impl MockLanguageModel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip currency signs, thousands separators and trailing punctuation
fn parse_number(token: &str) -> Option<u64> {
    let cleaned: String = token
        .trim_start_matches(|c: char| c == '€' || c == '$')
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .chars()
        .filter(|c| *c != ',' && *c != '_')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn days_per_unit(unit: &str) -> Option<u64> {
    let unit = unit.to_lowercase();
    if unit.starts_with("day") {
        Some(1)
    } else if unit.starts_with("week") {
        Some(7)
    } else if unit.starts_with("month") {
        Some(30)
    } else if unit.starts_with("year") {
        Some(365)
    } else {
        None
    }
}

fn latest_available_cash(conversation: &[ConversationMessage]) -> Option<u64> {
    conversation
        .iter()
        .rev()
        .filter(|m| m.role == MessageRole::Tool)
        .find(|m| m.name.as_deref() == Some(AvailableCashTool::NAME))
        .and_then(|m| parse_number(m.content.trim()))
}

fn scan(conversation: &[ConversationMessage]) -> DepositConditions {
    let mut conditions = DepositConditions::default();

    for message in conversation.iter().filter(|m| m.role == MessageRole::User) {
        let lowered = message.content.to_lowercase();
        if WHOLE_AMOUNT_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
            if let Some(cash) = latest_available_cash(conversation) {
                conditions.deposit_amount = Some(cash);
            }
        }

        let tokens: Vec<&str> = message.content.split_whitespace().collect();
        for (i, token) in tokens.iter().enumerate() {
            let Some(value) = parse_number(token).filter(|v| *v > 0) else {
                continue;
            };

            match tokens.get(i + 1).and_then(|unit| days_per_unit(unit)) {
                Some(factor) => {
                    conditions.deposit_duration = value
                        .checked_mul(factor)
                        .and_then(|days| u32::try_from(days).ok());
                }
                None => conditions.deposit_amount = Some(value),
            }
        }
    }

    conditions
}

#[async_trait]
impl Extractor for MockLanguageModel {
    async fn extract(&self, conversation: &[ConversationMessage]) -> Result<DepositConditions> {
        Ok(scan(conversation))
    }
}

#[async_trait]
impl Responder for MockLanguageModel {
    async fn respond(&self, conversation: &[ConversationMessage], tools: &[ToolSpec]) -> Result<Reply> {
        let last_user = conversation.iter().rposition(|m| m.role == MessageRole::User);
        let since_user = &conversation[last_user.map(|i| i + 1).unwrap_or(0)..];

        if let Some(result) = since_user.iter().rev().find(|m| m.role == MessageRole::Tool) {
            return Ok(Reply::Message(format!(
                "You currently have {} euros available that can be placed on deposit. \
                 How much would you like to deposit, and for how many days?",
                result.content.trim()
            )));
        }

        let asks_balance = last_user
            .map(|i| conversation[i].content.to_lowercase())
            .map(|text| BALANCE_KEYWORDS.iter().any(|kw| text.contains(kw)))
            .unwrap_or(false);
        let cash_tool_available = tools.iter().any(|t| t.name == AvailableCashTool::NAME);

        if asks_balance && cash_tool_available {
            return Ok(Reply::ToolCalls(vec![ToolCall::new(AvailableCashTool::NAME, json!({}))]));
        }

        Ok(Reply::Message(
            "I can offer a deposit rate once I know the amount (up to 100,000,000 euros) \
             and the duration (1 to 365 days)."
                .to_string(),
        ))
    }
}

#[async_trait]
impl Summarizer for MockLanguageModel {
    async fn summarize(&self, amount: u64, duration: u32, rate: Decimal) -> Result<String> {
        Ok(format!(
            "Your deposit of {} euros for {} days is arranged at {}% per annum.",
            amount, duration, rate
        ))
    }
}
