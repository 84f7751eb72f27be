//! OpenAI Chat Completions API provider.
//!
//! OpenAI is a strict-pairing wire format: an assistant message carrying
//! `tool_calls` must be immediately followed by one `role: "tool"` message
//! per call, in call order, before another user/assistant turn can be sent.
//! [`reorder_for_strict_pairing`] enforces that over the curated history —
//! dropping bridge prompts that would otherwise land between a call and its
//! result, and synthesizing a placeholder `tool` message for any call left
//! unpaired. Argument fragments stream in `delta.tool_calls[].function.arguments`
//! and are buffered per index until `finish_reason` arrives.

use async_trait::async_trait;
use dbagent_core::content::{Content, Part, Role};
use dbagent_core::error::AgentError;
use dbagent_core::provider::{ModelProvider, StreamChunk};
use dbagent_core::tool::{ToolCall, ToolSpec};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

const API_BASE: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub system: Option<String>,
    pub timeout_seconds: u64,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.7,
            system: None,
            timeout_seconds: 60,
        }
    }
}

pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AgentError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self { config, client })
    }
}

/// Reorders curated history for a strict-pairing wire format: every
/// `function_call` part must be immediately followed by its `function_response`
/// in call order, with no unrelated content interleaved. Bridge-style user
/// turns that would otherwise land between a call and its result are dropped;
/// calls with no matching response in the tail get a synthesized "pending or
/// awaiting confirmation" placeholder so the assistant/tool pair stays intact.
pub fn reorder_for_strict_pairing(history: &[Content]) -> Vec<Content> {
    let mut responses: HashMap<&str, &Part> = HashMap::new();
    for content in history {
        for part in &content.parts {
            if let Part::FunctionResponse { id, .. } = part {
                responses.insert(id.as_str(), part);
            }
        }
    }

    let mut out = Vec::with_capacity(history.len());
    for content in history {
        if content.has_function_call() {
            out.push(content.clone());
            let mut synthesized = Vec::new();
            for id in content.function_call_ids() {
                let name = content
                    .parts
                    .iter()
                    .find_map(|p| match p {
                        Part::FunctionCall { id: cid, name, .. } if cid == id => Some(name.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                match responses.get(id) {
                    Some(part) => synthesized.push((*part).clone()),
                    None => synthesized.push(dbagent_core::content::synthesize_pending_response(id, &name)),
                }
            }
            if !synthesized.is_empty() {
                out.push(Content::tool(synthesized));
            }
            continue;
        }
        if content.role == Role::Tool {
            // Already emitted alongside its matching call above.
            continue;
        }
        out.push(content.clone());
    }
    out
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Model => "assistant",
        Role::Tool => "tool",
    }
}

fn content_to_wire_messages(content: &Content) -> Vec<Value> {
    if content.role == Role::Tool {
        return content
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionResponse { id, response, .. } => Some(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": response.to_string(),
                })),
                _ => None,
            })
            .collect();
    }

    let text: String = content.parts.iter().filter_map(Part::as_text).collect::<Vec<_>>().join("");
    let tool_calls: Vec<Value> = content
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::FunctionCall { id, name, args } => Some(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": args.to_string() },
            })),
            _ => None,
        })
        .collect();

    let mut message = json!({ "role": role_name(content.role) });
    if !text.is_empty() || tool_calls.is_empty() {
        message["content"] = json!(text);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }
    vec![message]
}

fn to_wire_messages(config: &OpenAiConfig, history: &[Content], system_instruction: Option<&str>) -> Vec<Value> {
    let reordered = reorder_for_strict_pairing(history);
    let mut messages = Vec::new();
    if let Some(system) = system_instruction.or(config.system.as_deref()) {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for content in &reordered {
        messages.extend(content_to_wire_messages(content));
    }
    messages
}

fn build_request_body(
    config: &OpenAiConfig,
    history: &[Content],
    tools: &[ToolSpec],
    stream: bool,
    system_instruction: Option<&str>,
) -> Value {
    let mut body = json!({
        "model": config.model,
        "temperature": config.temperature,
        "messages": to_wire_messages(config, history, system_instruction),
        "stream": stream,
    });
    if !tools.is_empty() {
        let tool_defs: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": serde_json::to_value(&t.parameters).unwrap_or(Value::Null),
                    },
                })
            })
            .collect();
        body["tools"] = json!(tool_defs);
    }
    body
}

#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    delta: Option<ChatDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChatToolCallDelta>>,
}

#[derive(Deserialize)]
struct ChatToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<ChatFunctionDelta>,
}

#[derive(Deserialize)]
struct ChatFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

struct ToolAccumulator {
    call_id: String,
    name: String,
    json_buffer: String,
}

/// Parses one SSE line batch into normalized chunks, buffering
/// `delta.tool_calls[].function.arguments` fragments per index until
/// `finish_reason` closes the call out.
fn parse_sse_text(
    text: &str,
    pending: &mut HashMap<usize, ToolAccumulator>,
    request_id: &str,
) -> Vec<Result<StreamChunk, AgentError>> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let chunk: ChatChunk = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                out.push(Err(AgentError::Serialization(format!("openai stream decode: {e}"))));
                continue;
            }
        };

        if let Some(usage) = chunk.usage {
            out.push(Ok(StreamChunk::Usage {
                prompt_tokens: usage.prompt_tokens.unwrap_or(0),
                completion_tokens: usage.completion_tokens.unwrap_or(0),
            }));
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content {
                    if !text.is_empty() {
                        out.push(Ok(StreamChunk::Text(text)));
                    }
                }
                for tc in delta.tool_calls.unwrap_or_default() {
                    if let Some(id) = tc.id.clone() {
                        let name = tc.function.as_ref().and_then(|f| f.name.clone()).unwrap_or_default();
                        out.push(Ok(StreamChunk::ToolCallStart { index: tc.index, call_id: id.clone(), name: name.clone() }));
                        pending.insert(tc.index, ToolAccumulator { call_id: id, name, json_buffer: String::new() });
                    }
                    if let Some(args) = tc.function.and_then(|f| f.arguments) {
                        if let Some(acc) = pending.get_mut(&tc.index) {
                            acc.json_buffer.push_str(&args);
                        }
                        out.push(Ok(StreamChunk::ToolCallDelta { index: tc.index, partial_json: args }));
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                if reason == "tool_calls" {
                    let mut indices: Vec<usize> = pending.keys().copied().collect();
                    indices.sort_unstable();
                    for index in indices {
                        if let Some(acc) = pending.remove(&index) {
                            let args: Value = if acc.json_buffer.trim().is_empty() {
                                json!({})
                            } else {
                                serde_json::from_str(&acc.json_buffer).unwrap_or(Value::Null)
                            };
                            let call = ToolCall::new(request_id, acc.call_id, acc.name, args);
                            out.push(Ok(StreamChunk::ToolCallEnd { index, call }));
                        }
                    }
                }
                out.push(Ok(StreamChunk::Done { stop_reason: reason }));
            }
        }
    }
    out
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

async fn backoff_sleep(attempt: u32, initial_ms: u64, cap_ms: u64) {
    let exp = initial_ms.saturating_mul(1u64 << attempt.min(16)).min(cap_ms);
    let jittered = rand::random::<u64>() % exp.max(1);
    tokio::time::sleep(Duration::from_millis(jittered)).await;
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn send_message_stream(
        &self,
        history: Vec<Content>,
        tools: Vec<ToolSpec>,
        system_instruction: Option<&str>,
    ) -> Result<BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
        let mut body = build_request_body(&self.config, &history, &tools, true, system_instruction);
        body["stream_options"] = json!({ "include_usage": true });
        let request_id = uuid::Uuid::new_v4().to_string();

        const MAX_ATTEMPTS: u32 = 4;
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                backoff_sleep(attempt, 2_000, 20_000).await;
            }
            let response = self
                .client
                .post(API_BASE)
                .bearer_auth(&self.config.api_key)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(format!("request failed: {e}"));
                    continue;
                }
            };
            if is_retryable_status(response.status()) {
                last_err = Some(format!("retryable status: {}", response.status()));
                continue;
            }
            if !response.status().is_success() {
                let status = response.status();
                let body_text = response.text().await.unwrap_or_default();
                return Err(AgentError::ProviderFatal {
                    reason: format!("openai returned {status}: {body_text}"),
                });
            }

            let byte_stream = response.bytes_stream();
            let pending: HashMap<usize, ToolAccumulator> = HashMap::new();
            let carry = String::new();

            let stream = stream::unfold(
                (byte_stream, pending, carry, request_id.clone()),
                move |(mut bytes, mut pending, mut carry, request_id)| async move {
                    loop {
                        match bytes.next().await {
                            Some(Ok(chunk)) => {
                                let text = String::from_utf8_lossy(&chunk);
                                carry.push_str(&text);
                                if let Some(last_newline) = carry.rfind('\n') {
                                    let (complete, rest) = carry.split_at(last_newline + 1);
                                    let parsed = parse_sse_text(complete, &mut pending, &request_id);
                                    let rest = rest.to_string();
                                    if parsed.is_empty() {
                                        carry = rest;
                                        continue;
                                    }
                                    return Some((stream::iter(parsed), (bytes, pending, rest, request_id)));
                                }
                            }
                            Some(Err(e)) => {
                                return Some((
                                    stream::iter(vec![Err(AgentError::ProviderFatal {
                                        reason: format!("stream read error: {e}"),
                                    })]),
                                    (bytes, pending, carry, request_id),
                                ));
                            }
                            None => return None,
                        }
                    }
                },
            )
            .flatten();

            return Ok(stream.boxed());
        }

        Err(AgentError::ProviderFatal {
            reason: last_err.unwrap_or_else(|| "exhausted retries".to_string()),
        })
    }

    async fn generate_json(&self, prompt: Vec<Content>, schema: Value) -> Result<Value, AgentError> {
        let mut body = build_request_body(&self.config, &prompt, &[], false, None);
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": { "name": "structured_output", "schema": schema, "strict": true },
        });

        const MAX_ATTEMPTS: u32 = 5;
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                backoff_sleep(attempt, 2_000, 10_000).await;
            }
            let response = self
                .client
                .post(API_BASE)
                .bearer_auth(&self.config.api_key)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await;
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(format!("request failed: {e}"));
                    continue;
                }
            };
            if is_retryable_status(response.status()) {
                last_err = Some(format!("retryable status: {}", response.status()));
                continue;
            }
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(AgentError::ProviderFatal {
                    reason: format!("openai returned {status}: {text}"),
                });
            }

            let parsed: Value = response.json().await.map_err(|e| AgentError::ProviderFatal {
                reason: format!("failed to decode response body: {e}"),
            })?;

            let text = parsed
                .get("choices")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|t| t.as_str());

            return match text {
                Some(t) => serde_json::from_str(t).map_err(|e| AgentError::ProviderFatal {
                    reason: format!("openai structured response was not valid json: {e}"),
                }),
                None => Err(AgentError::ProviderFatal {
                    reason: "openai response had no message content for structured output".to_string(),
                }),
            };
        }

        Err(AgentError::ProviderFatal {
            reason: last_err.unwrap_or_else(|| "exhausted retries".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_mapping_matches_openai_convention() {
        assert_eq!(role_name(Role::User), "user");
        assert_eq!(role_name(Role::Model), "assistant");
        assert_eq!(role_name(Role::Tool), "tool");
    }

    #[test]
    fn strict_pairing_drops_bridge_prompt_between_call_and_result() {
        let history = vec![
            Content::user("list tables"),
            Content::model(vec![Part::function_call("call_1", "schema_discovery", json!({}))]),
            Content::user("Please continue."),
            Content::tool(vec![Part::function_response("call_1", "schema_discovery", json!({"tables": []}))]),
        ];
        let reordered = reorder_for_strict_pairing(&history);
        assert_eq!(reordered.len(), 3);
        assert!(reordered[1].has_function_call());
        assert_eq!(reordered[2].role, Role::Tool);
    }

    #[test]
    fn unpaired_call_gets_synthesized_placeholder() {
        let history = vec![Content::model(vec![Part::function_call("call_1", "sql_execute", json!({"sql": "SELECT 1"}))])];
        let reordered = reorder_for_strict_pairing(&history);
        assert_eq!(reordered.len(), 2);
        match &reordered[1].parts[0] {
            Part::FunctionResponse { response, .. } => {
                assert!(response.to_string().contains("pending"));
            }
            other => panic!("expected function_response, got {other:?}"),
        }
    }

    #[test]
    fn sse_tool_call_end_is_emitted_on_finish_reason() {
        let mut pending = HashMap::new();
        let start = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"sql_execute\",\"arguments\":\"\"}}]}}]}\n";
        let delta = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"sql\\\":\\\"SELECT 1\\\"}\"}}]}}]}\n";
        let stop = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n";

        parse_sse_text(start, &mut pending, "req-1");
        parse_sse_text(delta, &mut pending, "req-1");
        let out = parse_sse_text(stop, &mut pending, "req-1");

        assert!(out.iter().any(|c| matches!(c, Ok(StreamChunk::ToolCallEnd { call, .. }) if call.name == "sql_execute")));
        assert!(out.iter().any(|c| matches!(c, Ok(StreamChunk::Done { stop_reason }) if stop_reason == "tool_calls")));
    }

    /// Round-trip check for spec scenario 4 (provider parity): text and a
    /// tool call/result pair survive `internal -> wire -> internal` with
    /// name, arguments, and pairing intact.
    #[test]
    fn text_and_tool_call_round_trip_through_wire_form() {
        let history = vec![
            Content::user("list tables"),
            Content::model(vec![Part::function_call("call_1", "schema_discovery", json!({}))]),
            Content::tool(vec![Part::function_response("call_1", "schema_discovery", json!({"tables": []}))]),
        ];
        let wire = to_wire_messages(&OpenAiConfig::new("key", "gpt-4o"), &history, None);
        assert_eq!(wire[0]["content"], "list tables");
        assert_eq!(wire[1]["tool_calls"][0]["function"]["name"], "schema_discovery");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "call_1");

        let mut pending = HashMap::new();
        let start = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"schema_discovery\",\"arguments\":\"\"}}]}}]}\n";
        let stop = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n";
        parse_sse_text(start, &mut pending, "req-1");
        let out = parse_sse_text(stop, &mut pending, "req-1");
        match out.iter().find_map(|c| match c {
            Ok(StreamChunk::ToolCallEnd { call, .. }) => Some(call),
            _ => None,
        }) {
            Some(call) => assert_eq!(call.name, "schema_discovery"),
            None => panic!("expected a ToolCallEnd chunk"),
        }
    }

    #[test]
    fn per_call_system_instruction_becomes_the_leading_system_message() {
        let config = OpenAiConfig::new("key", "gpt-4o");
        let wire = to_wire_messages(&config, &[], Some("be terse"));
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[0]["content"], "be terse");
    }

    #[test]
    fn per_call_system_instruction_overrides_config_default() {
        let mut config = OpenAiConfig::new("key", "gpt-4o");
        config.system = Some("config default".into());
        let wire = to_wire_messages(&config, &[], Some("call-time override"));
        assert_eq!(wire[0]["content"], "call-time override");
    }
}
