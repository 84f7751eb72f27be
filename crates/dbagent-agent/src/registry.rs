//! The Tool contract and the registry that looks tools up by name.
//!
//! `validate`/`should_confirm` are distinct steps the scheduler drives
//! separately from `execute`, rather than one opaque `call`.

use async_trait::async_trait;
use dbagent_core::error::AgentError;
use dbagent_core::events::AbortSignal;
use dbagent_core::tool::{ConfirmationDetails, ParametersSchema, ToolSpec};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

/// What a tool execution hands back to the scheduler.
///
/// `llm_content` is folded back into [`dbagent_core::content::Part::FunctionResponse`];
/// `return_display` is UI-facing and may differ (e.g. a diff vs. a summary
/// sentence); `summary` is the one-line digest used when history is curated
/// or compressed.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub summary: String,
    pub llm_content: Value,
    pub return_display: Option<String>,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(summary: impl Into<String>, llm_content: Value) -> Self {
        Self {
            summary: summary.into(),
            llm_content,
            return_display: None,
            error: None,
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.return_display = Some(display.into());
        self
    }

    pub fn failed(summary: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            summary: summary.into(),
            llm_content: Value::String(error.clone()),
            return_display: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A callback a tool may use to stream partial output while it runs.
/// Exposure to the UI is gated by [`FunctionTool::can_update_output`].
pub type ProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

/// The uniform interface every tool implements: a narrow trait, not a class
/// hierarchy — each tool is a value implementing this interface.
#[async_trait]
pub trait FunctionTool: Send + Sync {
    /// Stable identifier used for lookup and in `function_call.name`.
    fn name(&self) -> &str;

    /// Human-facing name for confirmation dialogs and telemetry.
    fn display_name(&self) -> &str {
        self.name()
    }

    /// Sent to the LLM as part of the tool's schema.
    fn description(&self) -> &str;

    fn parameter_schema(&self) -> ParametersSchema;

    /// Whether `return_display` should be rendered as markdown.
    fn is_output_markdown(&self) -> bool {
        false
    }

    /// Whether this tool streams incremental output via a [`ProgressCallback`].
    fn can_update_output(&self) -> bool {
        false
    }

    /// Whether the scheduler should fold a long result down to `summary`
    /// once the batch completes, rather than keeping `llm_content` verbatim.
    fn should_summarize_display(&self) -> bool {
        false
    }

    /// Whether this tool is safe to run concurrently with other calls in the
    /// same batch. Tools that mutate shared external state (e.g. a single
    /// shell session) should return `false`.
    fn is_parallel_safe(&self) -> bool {
        true
    }

    /// Validate `params` against this tool's declared contract. Called first,
    /// before `should_confirm`; a returned message moves the call straight to
    /// `Error`.
    fn validate(&self, params: &Value) -> Result<(), String>;

    /// Return confirmation details if this call requires user sign-off given
    /// `params`, or `None` to proceed straight to execution.
    async fn should_confirm(&self, params: &Value, abort: &AbortSignal) -> Option<ConfirmationDetails>;

    /// Run the tool. `abort` is a child signal the scheduler aborts whenever
    /// the parent session aborts.
    async fn execute(
        &self,
        params: Value,
        abort: &AbortSignal,
        progress: Option<ProgressCallback>,
    ) -> ToolResult;

    /// The schema form sent to every [`dbagent_core::provider::ModelProvider`].
    fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameter_schema(),
        }
    }
}

/// Insertion-ordered `name -> tool` map. Uses `IndexMap` rather than
/// `HashMap` so `tool_specs()` always serializes in registration order —
/// relevant for providers (like OpenAI) that echo tool order back in error
/// messages, and for deterministic golden tests.
#[derive(Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn FunctionTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: IndexMap::new() }
    }

    /// Register a tool. Errors on name collision; collisions are rejected
    /// at registration time rather than silently overwriting.
    pub fn register(&mut self, tool: Arc<dyn FunctionTool>) -> Result<(), AgentError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(AgentError::DuplicateTool { name });
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn FunctionTool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool schemas for every registered tool, in registration order.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.to_spec()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbagent_core::tool::ParameterProperty;

    struct EchoTool;

    #[async_trait]
    impl FunctionTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "echoes its input"
        }

        fn parameter_schema(&self) -> ParametersSchema {
            ParametersSchema::object().with_property("text", ParameterProperty::string("text to echo"))
        }

        fn validate(&self, params: &Value) -> Result<(), String> {
            if params.get("text").is_none() {
                return Err("missing 'text'".to_string());
            }
            Ok(())
        }

        async fn should_confirm(&self, _params: &Value, _abort: &AbortSignal) -> Option<ConfirmationDetails> {
            None
        }

        async fn execute(&self, params: Value, _abort: &AbortSignal, _progress: Option<ProgressCallback>) -> ToolResult {
            ToolResult::ok("echoed", params)
        }
    }

    #[test]
    fn registration_is_insertion_ordered() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        assert_eq!(registry.names(), vec!["echo".to_string()]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, AgentError::DuplicateTool { .. }));
    }

    #[tokio::test]
    async fn validate_rejects_missing_required_arg() {
        let tool = EchoTool;
        assert!(tool.validate(&serde_json::json!({})).is_err());
        assert!(tool.validate(&serde_json::json!({"text": "hi"})).is_ok());
    }
}
