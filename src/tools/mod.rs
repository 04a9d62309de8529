//! Tool trait and registry
//!
//! Tools are zero-side-effect queries the reply capability may request
//! while chatting with the client.

use crate::error::AssistantError;
use crate::models::{ToolCall, ToolInput, ToolOutput, ToolSpec};
use crate::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn execute(&self, input: &ToolInput) -> Result<ToolOutput>;
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Specs advertised to the reply capability, sorted by name
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Run a requested call and render its result as message content
    pub async fn invoke(&self, call: &ToolCall) -> Result<String> {
        let tool = self
            .get(&call.name)
            .ok_or_else(|| AssistantError::ToolNotFound(call.name.clone()))?;

        debug!(tool_name = %call.name, "Invoking tool");

        let output = tool
            .execute(&ToolInput {
                tool_name: call.name.clone(),
                parameters: call.arguments.clone(),
            })
            .await?;

        if !output.success {
            return Err(AssistantError::ToolError(format!(
                "{} failed: {}",
                call.name,
                output.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        Ok(match &output.data {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Free cash on the client's accounts that could go on deposit
pub struct AvailableCashTool {
    amount: u64,
}

impl AvailableCashTool {
    pub const NAME: &'static str = "get_user_available_cash";

    pub fn new(amount: u64) -> Self {
        Self { amount }
    }
}

#[async_trait::async_trait]
impl Tool for AvailableCashTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Get the amount of free cash in euros available in the user's accounts \
         that can potentially be placed on deposit."
    }

    async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
        Ok(ToolOutput {
            success: true,
            data: json!(self.amount),
            error: None,
        })
    }
}

/// Registry with the tools exposed to the reply capability
pub fn create_default_registry(available_cash: u64) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(AvailableCashTool::new(available_cash)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenTool;

    #[async_trait::async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn description(&self) -> &'static str {
            "Always fails"
        }

        async fn execute(&self, _input: &ToolInput) -> Result<ToolOutput> {
            Ok(ToolOutput {
                success: false,
                data: serde_json::Value::Null,
                error: Some("backend down".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_available_cash() {
        let registry = create_default_registry(1_000_000);
        let call = ToolCall::new(AvailableCashTool::NAME, json!({}));
        let content = registry.invoke(&call).await.unwrap();
        assert_eq!(content, "1000000");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = create_default_registry(1);
        let call = ToolCall::new("web_search", json!({"query": "rates"}));
        let err = registry.invoke(&call).await.unwrap_err();
        assert!(matches!(err, AssistantError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_tool_output() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(BrokenTool));
        let err = registry
            .invoke(&ToolCall::new("broken", json!({})))
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("backend down"));
    }

    #[test]
    fn test_specs() {
        let registry = create_default_registry(1);
        let specs = registry.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "get_user_available_cash");
        assert_eq!(registry.list(), vec!["get_user_available_cash"]);
    }
}
