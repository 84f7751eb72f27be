//! Tool-call schema and lifecycle record.
//!
//! `FunctionTool`/`ParametersSchema`/`ParameterProperty` are the
//! JSON-Schema-shaped wire types sent to providers describing callable
//! tools. `ToolCall` adds the lifecycle bookkeeping (status, timestamps,
//! result) that a bare name/args pair doesn't carry on its own.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use time::OffsetDateTime;

/// Represents a single parameter in a tool's [`ParametersSchema`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParameterProperty {
    #[serde(rename = "type")]
    pub property_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParameterProperty>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "enum")]
    pub enum_list: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
}

impl ParameterProperty {
    pub fn string(description: impl Into<String>) -> Self {
        Self {
            property_type: "string".into(),
            description: description.into(),
            items: None,
            enum_list: None,
            minimum: None,
            maximum: None,
        }
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self {
            property_type: "boolean".into(),
            description: description.into(),
            items: None,
            enum_list: None,
            minimum: None,
            maximum: None,
        }
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self {
            property_type: "number".into(),
            description: description.into(),
            items: None,
            enum_list: None,
            minimum: None,
            maximum: None,
        }
    }
}

/// JSON-Schema-shaped parameters object for a tool. Must stay
/// expressible in plain JSON Schema (`type`, `properties`, `required`,
/// `enum`, `minimum`, `maximum`, `items`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ParametersSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: HashMap<String, ParameterProperty>,
    pub required: Vec<String>,
}

impl ParametersSchema {
    pub fn object() -> Self {
        Self {
            schema_type: "object".into(),
            properties: HashMap::new(),
            required: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, prop: ParameterProperty) -> Self {
        self.properties.insert(name.into(), prop);
        self
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }
}

/// The schema sent to every provider for one registered tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FunctionTool {
    pub name: String,
    pub description: String,
    pub parameters: ParametersSchema,
}

/// Convenience alias used at the Provider boundary; kept distinct from
/// `FunctionTool` in naming only so call sites read `ToolSpec` (what the
/// registry publishes) vs. `FunctionTool` (the wire shape).
pub type ToolSpec = FunctionTool;

/// The lifecycle states a [`ToolCall`] can occupy.
///
/// The only legal transitions are:
/// `Validating -> (Scheduled | AwaitingApproval | Error)`,
/// `Scheduled -> Executing`, `AwaitingApproval -> (Executing | Cancelled)`,
/// `Executing -> (Success | Error | Cancelled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Validating,
    Scheduled,
    AwaitingApproval,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl ToolCallStatus {
    /// Whether this status is one of the three terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    /// Whether `next` is a legal transition target from `self`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ToolCallStatus::*;
        matches!(
            (self, next),
            (Validating, Scheduled)
                | (Validating, AwaitingApproval)
                | (Validating, Error)
                | (Scheduled, Executing)
                | (AwaitingApproval, Executing)
                | (AwaitingApproval, Cancelled)
                | (Executing, Success)
                | (Executing, Error)
                | (Executing, Cancelled)
        )
    }
}

/// Details surfaced to the UI when a tool call requires user confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationDetails {
    pub title: String,
    pub message: String,
    pub risk_level: String,
}

/// The outcome the UI feeds back for a parked confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    ProceedOnce,
    ProceedAlways,
    Cancel,
    Modify { new_args: Value },
}

/// Lifecycle record for one requested tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within the turn that requested it.
    pub request_id: String,
    /// Stable across retries/confirmation round-trips.
    pub call_id: String,
    pub name: String,
    pub args: Value,
    pub status: ToolCallStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_ts: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_ts: Option<OffsetDateTime>,
    pub result: Option<Value>,
    /// UI-facing rendering of the result, when it differs from `result`
    /// (e.g. a diff vs. the summary folded back into history).
    pub return_display: Option<String>,
    pub error: Option<String>,
    pub confirmation: Option<ConfirmationDetails>,
}

impl ToolCall {
    pub fn new(request_id: impl Into<String>, call_id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            request_id: request_id.into(),
            call_id: call_id.into(),
            name: name.into(),
            args,
            status: ToolCallStatus::Validating,
            start_ts: OffsetDateTime::now_utc(),
            end_ts: None,
            result: None,
            return_display: None,
            error: None,
            confirmation: None,
        }
    }

    /// Move to `next`, panicking on a state-machine violation. Scheduler
    /// code is expected to route every transition through this so no
    /// unspecified transition is observable.
    pub fn transition(&mut self, next: ToolCallStatus) {
        assert!(
            self.status.can_transition_to(next),
            "illegal tool call transition: {:?} -> {:?}",
            self.status,
            next
        );
        self.status = next;
        if next.is_terminal() {
            self.end_ts = Some(OffsetDateTime::now_utc());
        }
    }
}
