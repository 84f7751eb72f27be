//! Illustrative built-in tools that exercise the scheduler and risk
//! evaluator end-to-end without pulling in a real database driver, which
//! stays an external collaborator.
//!
//! `SchemaDiscoveryTool` is a convenience wrapper over `SHOW TABLES`-style
//! introspection that never confirms; `SqlExecuteTool` routes its `sql`
//! argument through `dbagent_risk::evaluate` to decide whether the call
//! needs user sign-off first.

use async_trait::async_trait;
use dbagent_core::events::AbortSignal;
use dbagent_core::tool::{ConfirmationDetails, ParameterProperty, ParametersSchema};
use dbagent_risk::{RiskContext, RiskLevel};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::registry::{FunctionTool, ProgressCallback, ToolResult};

/// A caller-supplied, in-memory view of known tables, so this tool can run
/// without a live connection. Production callers back this with a schema
/// cache kept current by the actual database driver.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    /// table name -> column names
    pub tables: BTreeMap<String, Vec<String>>,
    pub views: BTreeMap<String, Vec<String>>,
}

/// Lists tables (and optionally views), with an optional name pattern —
/// a convenience alternative to `sql_execute("SHOW TABLES")`.
pub struct SchemaDiscoveryTool {
    catalog: SchemaCatalog,
}

impl SchemaDiscoveryTool {
    pub fn new(catalog: SchemaCatalog) -> Self {
        Self { catalog }
    }

    fn matches(name: &str, pattern: Option<&str>) -> bool {
        let Some(pattern) = pattern else { return true };
        let glob = pattern.replace('%', "*");
        match glob.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == glob,
        }
    }
}

#[async_trait]
impl FunctionTool for SchemaDiscoveryTool {
    fn name(&self) -> &str {
        "schema_discovery"
    }

    fn display_name(&self) -> &str {
        "Schema Discovery"
    }

    fn description(&self) -> &str {
        "Lists known tables (and optionally views), filtered by an optional name pattern. \
         A faster alternative to running SHOW TABLES via sql_execute."
    }

    fn parameter_schema(&self) -> ParametersSchema {
        ParametersSchema::object()
            .with_property(
                "pattern",
                ParameterProperty::string("Optional table name pattern, e.g. 'user%' matches names starting with 'user'"),
            )
            .with_property("include_views", ParameterProperty::boolean("Whether to include views; default false"))
    }

    fn is_output_markdown(&self) -> bool {
        true
    }

    fn validate(&self, _params: &Value) -> Result<(), String> {
        Ok(())
    }

    async fn should_confirm(&self, _params: &Value, _abort: &AbortSignal) -> Option<ConfirmationDetails> {
        None
    }

    async fn execute(&self, params: Value, _abort: &AbortSignal, _progress: Option<ProgressCallback>) -> ToolResult {
        let pattern = params.get("pattern").and_then(Value::as_str);
        let include_views = params.get("include_views").and_then(Value::as_bool).unwrap_or(false);

        let mut names: Vec<&String> = self.catalog.tables.keys().filter(|n| Self::matches(n, pattern)).collect();
        if include_views {
            names.extend(self.catalog.views.keys().filter(|n| Self::matches(n, pattern)));
        }
        names.sort();

        let summary = format!("found {} table(s)", names.len());
        let llm_content = json!({ "tables": names });
        let display = names.iter().map(|n| format!("- {n}")).collect::<Vec<_>>().join("\n");
        ToolResult::ok(summary, llm_content).with_display(display)
    }
}

/// Runs a SQL statement through a caller-supplied [`SqlExecutor`], gating
/// destructive statements behind confirmation via `dbagent_risk::evaluate`.
///
/// The executor is an external collaborator; only the confirmation/risk
/// wiring is this crate's concern.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<Value, String>;
}

pub struct SqlExecuteTool {
    executor: Arc<dyn SqlExecutor>,
    context: RiskContext,
}

impl SqlExecuteTool {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self {
            executor,
            context: RiskContext::default(),
        }
    }

    pub fn with_context(mut self, context: RiskContext) -> Self {
        self.context = context;
        self
    }
}

#[async_trait]
impl FunctionTool for SqlExecuteTool {
    fn name(&self) -> &str {
        "sql_execute"
    }

    fn display_name(&self) -> &str {
        "Execute SQL"
    }

    fn description(&self) -> &str {
        "Executes a SQL statement against the connected database. Destructive or \
         wide-reaching statements require user confirmation first."
    }

    fn parameter_schema(&self) -> ParametersSchema {
        ParametersSchema::object()
            .with_property("sql", ParameterProperty::string("SQL statement to run"))
            .require("sql")
    }

    fn validate(&self, params: &Value) -> Result<(), String> {
        match params.get("sql").and_then(Value::as_str) {
            Some(sql) if !sql.trim().is_empty() => Ok(()),
            _ => Err("missing 'sql'".to_string()),
        }
    }

    async fn should_confirm(&self, params: &Value, _abort: &AbortSignal) -> Option<ConfirmationDetails> {
        let sql = params.get("sql").and_then(Value::as_str)?;
        let assessment = dbagent_risk::evaluate(sql, Some(&self.context));
        if !assessment.requires_confirmation {
            return None;
        }
        Some(ConfirmationDetails {
            title: format!("Run {} statement?", assessment.operation_type),
            message: assessment.reasons.join("; "),
            risk_level: risk_level_str(assessment.level).to_string(),
        })
    }

    async fn execute(&self, params: Value, _abort: &AbortSignal, _progress: Option<ProgressCallback>) -> ToolResult {
        let Some(sql) = params.get("sql").and_then(Value::as_str) else {
            return ToolResult::failed("no sql provided", "missing 'sql'");
        };
        match self.executor.execute(sql).await {
            Ok(rows) => ToolResult::ok("statement executed", rows),
            Err(err) => ToolResult::failed("statement failed", err),
        }
    }
}

fn risk_level_str(level: RiskLevel) -> &'static str {
    match level {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "high",
        RiskLevel::Critical => "critical",
    }
}
