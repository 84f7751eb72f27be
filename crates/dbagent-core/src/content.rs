//! The conversational unit of history: [`Content`] and its [`Part`]s.
//!
//! A three-part union (text / function_call / function_response) so that
//! providers can round-trip tool calls losslessly across three wire
//! protocols.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a [`Content`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
}

/// One piece of a [`Content`]. A `Content` carries an ordered list of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    FunctionCall {
        id: String,
        name: String,
        args: Value,
    },
    FunctionResponse {
        id: String,
        name: String,
        response: Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn function_call(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Part::FunctionCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    pub fn function_response(id: impl Into<String>, name: impl Into<String>, response: Value) -> Self {
        Part::FunctionResponse {
            id: id.into(),
            name: name.into(),
            response,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Part::FunctionCall { id, .. } | Part::FunctionResponse { id, .. } => Some(id),
            Part::Text { .. } => None,
        }
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self, Part::FunctionCall { .. })
    }

    pub fn is_function_response(&self) -> bool {
        matches!(self, Part::FunctionResponse { .. })
    }
}

/// One turn of conversational history: a role plus an ordered list of parts.
///
/// Invariant: every `FunctionCall` part must eventually be
/// paired, in a later `Content`, with a `FunctionResponse` part carrying the
/// same `id`. [`crate::content::synthesize_pending_response`] is the
/// reconciliation helper used when a call is orphaned (cancelled or the
/// session ended before a real result arrived).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Content {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Content { role: Role::Model, parts }
    }

    pub fn tool(parts: Vec<Part>) -> Self {
        Content { role: Role::Tool, parts }
    }

    /// Concatenation of every text part, in order. Empty string if none.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    /// True if this content carries no text and no parts at all, or only
    /// whitespace text — the "empty model turn" half of the curation rule.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty() || self.text().trim().is_empty() && !self.has_function_call()
    }

    pub fn has_function_call(&self) -> bool {
        self.parts.iter().any(Part::is_function_call)
    }

    pub fn function_call_ids(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter(|p| p.is_function_call())
            .filter_map(Part::call_id)
            .collect()
    }
}

/// Build the placeholder `function_response` for an orphaned `function_call`
/// whose batch was cancelled or superseded before a real result arrived.
pub fn synthesize_pending_response(call_id: &str, name: &str) -> Part {
    Part::function_response(
        call_id,
        name,
        serde_json::json!({ "status": "pending or awaiting confirmation" }),
    )
}
