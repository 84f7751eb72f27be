//! The `ModelProvider` trait: the one seam every wire protocol (Gemini,
//! Anthropic, OpenAI) normalizes behind.
//!
//! One streaming entry point the Turn drives, plus one non-streaming
//! structured-output entry point; tools are always attached when present
//! rather than split across separate call variants.

use crate::content::Content;
use crate::error::AgentError;
use crate::tool::{ToolCall, ToolSpec};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

/// One fragment of a provider's streamed response, already normalized to a
/// protocol-agnostic shape. Providers are responsible
/// for the strict-pairing reconciliation their wire format demands before
/// handing chunks to the caller; see each provider crate's streaming
/// parser for the reordering this implies.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A fragment of assistant-visible text.
    Text(String),
    /// A tool call has begun; `partial_args` accumulates until `ToolCallEnd`.
    ToolCallStart { index: usize, call_id: String, name: String },
    /// An incremental fragment of a tool call's JSON arguments.
    ToolCallDelta { index: usize, partial_json: String },
    /// A tool call's arguments are complete and parseable.
    ToolCallEnd { index: usize, call: ToolCall },
    /// Token usage for the turn, when the provider reports it inline.
    Usage { prompt_tokens: u32, completion_tokens: u32 },
    /// The stream is finished; `stop_reason` is the provider's raw reason
    /// string (`"end_turn"`, `"tool_use"`, `"stop"`, ...) for the Next-Speaker
    /// Arbiter and telemetry to interpret.
    Done { stop_reason: String },
}

/// A provider-normalized connection to one concrete LLM backend.
///
/// Implementations own retry/backoff for transient failures internally
/// (typical defaults: 3-5 attempts for streams, 5 for JSON calls, 2s
/// initial delay, 10-20s cap, full jitter) — callers only ever see a
/// terminal `AgentError::ProviderFatal` after retries are exhausted.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Short identifier used in telemetry and error messages, e.g. `"anthropic"`.
    fn name(&self) -> &str;

    /// The concrete model identifier in use, e.g. `"claude-sonnet-4-5"`.
    fn model(&self) -> &str;

    /// Stream a turn given the curated history and the tools currently
    /// available. `system_instruction`, when present, is carried in the
    /// wire protocol's own system-prompt field (Anthropic's `system`,
    /// Gemini's `systemInstruction`, OpenAI's `role: "system"` message) —
    /// never folded into `history` as an ordinary turn. The returned stream
    /// ends (is dropped) once a `Done` chunk has been yielded or the
    /// `AgentError` is returned inline as the last item.
    async fn send_message_stream(
        &self,
        history: Vec<Content>,
        tools: Vec<ToolSpec>,
        system_instruction: Option<&str>,
    ) -> Result<BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError>;

    /// A non-streaming call constrained to return a JSON object shaped
    /// like `schema`. Used by the Next-Speaker Arbiter and by any
    /// structured tool-input repair path.
    async fn generate_json(
        &self,
        prompt: Vec<Content>,
        schema: Value,
    ) -> Result<Value, AgentError>;
}
