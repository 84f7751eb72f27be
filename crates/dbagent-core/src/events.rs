//! The event union yielded by a [`crate::provider::ModelProvider`] stream and
//! (re-exported upward, see `dbagent-agent::turn`) by a Turn, plus the
//! cooperative-cancellation primitive threaded through every suspension
//! point.

use crate::tool::{ConfirmationDetails, ToolCall};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Discriminated union emitted upward by the Turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnEvent {
    Content { text: String },
    ToolCallRequest { call: ToolCall },
    ToolCallResponse {
        call_id: String,
        result_summary: String,
        return_display: Option<String>,
    },
    ToolCallConfirmation { call_id: String, details: ConfirmationDetails },
    UserCancelled,
    Error { kind: String, message: String },
    ChatCompressed { tokens_before: usize, tokens_after: usize },
    MaxTurnsReached,
    UsageMetadata {
        model: String,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
}

/// Thread-safe abort flag, shared per-session.
///
/// Every long-running task — provider stream reads, tool executions, the
/// strict-pair reconciliation poll, retry backoff sleeps — checks this at
/// each suspension point. `reset()` is called at the start of each new user
/// turn and does not retroactively un-cancel anything already aborted.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    inner: Arc<AtomicBool>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn abort(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Clears the flag for a fresh turn. Does not affect tasks that already
    /// observed the prior abort.
    pub fn reset(&self) {
        self.inner.store(false, Ordering::SeqCst);
    }
}
