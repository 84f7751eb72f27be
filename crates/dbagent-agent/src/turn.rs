//! One model round-trip: append user input, open the provider stream,
//! forward events as they arrive, flush the assembled model content back
//! into Chat once the stream ends.

use dbagent_core::content::{Content, Part, Role};
use dbagent_core::error::AgentError;
use dbagent_core::events::{AbortSignal, TurnEvent};
use dbagent_core::provider::{ModelProvider, StreamChunk};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use crate::chat::Chat;
use crate::registry::ToolRegistry;
use crate::scheduler::ToolCallRequest;

/// What a Turn hands back to the [`crate::client::Client`] once its stream
/// has ended. The Turn itself never schedules tool calls or waits on
/// them — that is the Client's job.
#[derive(Debug, Default)]
pub struct TurnOutcome {
    pub tool_call_requests: Vec<ToolCallRequest>,
    pub stop_reason: String,
    pub usage: Option<(u32, u32)>,
}

/// In-progress tool call accumulated across `ToolCallStart`/`ToolCallDelta`/
/// `ToolCallEnd` chunks, in case a provider ever splits `ToolCallEnd` from
/// its own partial-JSON accumulation (none of ours do today, but the field
/// exists on the wire type so Turn must tolerate it).
struct PartialCall {
    call_id: String,
    name: String,
    partial_json: String,
}

/// Run one Turn to completion, forwarding every [`TurnEvent`] onto `events_tx`
/// as it is produced and returning the residue the Client needs to drive the
/// next step.
///
/// `is_bridge` marks an internally-generated continuation prompt ("Please
/// continue.") — these are never persisted to `chat`, only used to prompt
/// this one provider call.
#[instrument(skip(chat, registry, provider, events_tx, abort), fields(request_id = %request_id, is_bridge))]
pub async fn run_turn(
    chat: &mut Chat,
    registry: &ToolRegistry,
    provider: &dyn ModelProvider,
    system_instruction: Option<&str>,
    request_id: &str,
    user_parts: Vec<Part>,
    is_bridge: bool,
    abort: &AbortSignal,
    events_tx: &mpsc::UnboundedSender<TurnEvent>,
) -> Result<TurnOutcome, AgentError> {
    let user_content = Content {
        role: Role::User,
        parts: user_parts,
    };

    let prompt_history = if is_bridge {
        let mut history = chat.curated();
        history.push(user_content);
        history
    } else {
        chat.add(user_content);
        chat.curated()
    };

    let tool_specs = registry.tool_specs();

    if abort.is_aborted() {
        let _ = events_tx.send(TurnEvent::UserCancelled);
        return Ok(TurnOutcome::default());
    }

    let mut stream = provider.send_message_stream(prompt_history, tool_specs, system_instruction).await?;

    let mut assembled_parts: Vec<Part> = Vec::new();
    let mut text_buffer = String::new();
    let mut partials: HashMap<usize, PartialCall> = HashMap::new();
    let mut tool_call_requests = Vec::new();
    let mut stop_reason = String::from("end_turn");
    let mut usage = None;
    let mut aborted = false;

    while let Some(chunk) = stream.next().await {
        if abort.is_aborted() {
            aborted = true;
            break;
        }
        match chunk {
            Ok(StreamChunk::Text(fragment)) => {
                text_buffer.push_str(&fragment);
                let _ = events_tx.send(TurnEvent::Content { text: fragment });
            }
            Ok(StreamChunk::ToolCallStart { index, call_id, name }) => {
                partials.insert(
                    index,
                    PartialCall {
                        call_id,
                        name,
                        partial_json: String::new(),
                    },
                );
            }
            Ok(StreamChunk::ToolCallDelta { index, partial_json }) => {
                if let Some(partial) = partials.get_mut(&index) {
                    partial.partial_json.push_str(&partial_json);
                }
            }
            Ok(StreamChunk::ToolCallEnd { index, call }) => {
                partials.remove(&index);
                assembled_parts.push(Part::function_call(call.call_id.clone(), call.name.clone(), call.args.clone()));
                let _ = events_tx.send(TurnEvent::ToolCallRequest { call: call.clone() });
                tool_call_requests.push(ToolCallRequest {
                    call_id: call.call_id,
                    name: call.name,
                    args: call.args,
                });
            }
            Ok(StreamChunk::Usage { prompt_tokens, completion_tokens }) => {
                usage = Some((prompt_tokens, completion_tokens));
                let _ = events_tx.send(TurnEvent::UsageMetadata {
                    model: provider.model().to_string(),
                    prompt_tokens,
                    completion_tokens,
                });
            }
            Ok(StreamChunk::Done { stop_reason: reason }) => {
                stop_reason = reason;
                break;
            }
            Err(err) => {
                let _ = events_tx.send(TurnEvent::Error {
                    kind: "provider".to_string(),
                    message: err.to_string(),
                });
                return Err(err);
            }
        }
    }

    if !partials.is_empty() {
        warn!(count = partials.len(), "stream ended with unterminated tool call deltas");
    }

    if !text_buffer.is_empty() {
        assembled_parts.insert(0, Part::text(text_buffer));
    }

    if !assembled_parts.is_empty() {
        chat.add(Content::model(assembled_parts));
    }

    if aborted {
        let _ = events_tx.send(TurnEvent::UserCancelled);
    }

    Ok(TurnOutcome {
        tool_call_requests,
        stop_reason,
        usage,
    })
}
