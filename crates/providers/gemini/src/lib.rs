//! Gemini `generateContent` API provider.
//!
//! Gemini's SSE stream carries a complete `GenerateContentResponse` JSON
//! object per event; `functionCall` parts arrive whole (no fragment
//! accumulation needed, unlike Anthropic/OpenAI). Role names are already
//! `user`/`model` so conversion is mostly a field-name and empty-`parts`
//! normalization pass, not a reshaping one. The initial request retries
//! transient failures with full-jitter exponential backoff before the
//! stream is handed back to the caller.

use async_trait::async_trait;
use dbagent_core::content::{Content, Part, Role};
use dbagent_core::error::AgentError;
use dbagent_core::provider::{ModelProvider, StreamChunk};
use dbagent_core::tool::{ToolCall, ToolSpec};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub system_instruction: Option<String>,
    pub timeout_seconds: u64,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.7,
            system_instruction: None,
            timeout_seconds: 60,
        }
    }
}

pub struct GeminiProvider {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AgentError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn stream_url(&self) -> String {
        format!(
            "{API_BASE}/{}:streamGenerateContent?alt=sse&key={}",
            self.config.model, self.config.api_key
        )
    }

    fn generate_url(&self) -> String {
        format!("{API_BASE}/{}:generateContent?key={}", self.config.model, self.config.api_key)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User | Role::Tool => "user",
        Role::Model => "model",
    }
}

fn part_to_gemini(part: &Part) -> Value {
    match part {
        Part::Text { text } => json!({ "text": text }),
        Part::FunctionCall { name, args, .. } => json!({
            "functionCall": { "name": name, "args": args }
        }),
        Part::FunctionResponse { name, response, .. } => json!({
            "functionResponse": { "name": name, "response": response }
        }),
    }
}

fn to_wire_contents(history: &[Content]) -> Vec<Value> {
    history
        .iter()
        .filter(|c| !c.parts.is_empty())
        .map(|c| {
            json!({
                "role": role_name(c.role),
                "parts": c.parts.iter().map(part_to_gemini).collect::<Vec<_>>(),
            })
        })
        .collect()
}

fn schema_to_gemini(schema: &Value) -> Value {
    // Gemini's function-declaration schema is JSON Schema with upper-cased
    // `type` tokens; pass most fields through and normalize that one.
    fn upper_type(v: &Value) -> Value {
        match v {
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, val) in map {
                    if k == "type" {
                        if let Value::String(t) = val {
                            out.insert(k.clone(), json!(t.to_uppercase()));
                            continue;
                        }
                    }
                    out.insert(k.clone(), upper_type(val));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(upper_type).collect()),
            other => other.clone(),
        }
    }
    upper_type(schema)
}

fn build_request_body(config: &GeminiConfig, history: &[Content], tools: &[ToolSpec], system_instruction: Option<&str>) -> Value {
    let mut body = json!({
        "contents": to_wire_contents(history),
        "generationConfig": { "temperature": config.temperature },
    });
    if let Some(system) = system_instruction.or(config.system_instruction.as_deref()) {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": schema_to_gemini(&serde_json::to_value(&t.parameters).unwrap_or(Value::Null)),
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    body
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: Option<Value>,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}

/// Parses one SSE line batch into normalized chunks. Gemini emits whole
/// `functionCall` parts per event so each one becomes a `ToolCallStart`
/// immediately followed by its `ToolCallEnd` — no delta accumulation state
/// needs to cross calls, unlike the other two providers.
fn parse_sse_text(text: &str, request_id: &str, call_index: &mut usize) -> Vec<Result<StreamChunk, AgentError>> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() {
            continue;
        }
        let parsed: GenerateContentResponse = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                out.push(Err(AgentError::Serialization(format!("gemini stream decode: {e}"))));
                continue;
            }
        };

        if let Some(usage) = parsed.usage_metadata {
            out.push(Ok(StreamChunk::Usage {
                prompt_tokens: usage.prompt_token_count.unwrap_or(0),
                completion_tokens: usage.candidates_token_count.unwrap_or(0),
            }));
        }

        let mut finish_reason = None;
        for candidate in parsed.candidates.unwrap_or_default() {
            finish_reason = candidate.finish_reason.clone().or(finish_reason);
            for part in candidate.content.and_then(|c| c.parts).unwrap_or_default() {
                if let Some(text) = part.text {
                    if !text.is_empty() {
                        out.push(Ok(StreamChunk::Text(text)));
                    }
                }
                if let Some(fc) = part.function_call {
                    let index = *call_index;
                    *call_index += 1;
                    let call_id = format!("{request_id}-{index}");
                    out.push(Ok(StreamChunk::ToolCallStart {
                        index,
                        call_id: call_id.clone(),
                        name: fc.name.clone(),
                    }));
                    let args = fc.args.unwrap_or(json!({}));
                    let call = ToolCall::new(request_id, call_id, fc.name, args);
                    out.push(Ok(StreamChunk::ToolCallEnd { index, call }));
                }
            }
        }
        if let Some(reason) = finish_reason {
            out.push(Ok(StreamChunk::Done { stop_reason: reason }));
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
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
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
        let body = build_request_body(&self.config, &history, &tools, system_instruction);
        let request_id = uuid::Uuid::new_v4().to_string();
        let url = self.stream_url();

        const MAX_ATTEMPTS: u32 = 5;
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                backoff_sleep(attempt, 2_000, 20_000).await;
            }
            let response = self.client.post(&url).header("content-type", "application/json").json(&body).send().await;

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
                    reason: format!("gemini returned {status}: {text}"),
                });
            }

            let byte_stream = response.bytes_stream();
            let carry = String::new();

            let stream = stream::unfold(
                (byte_stream, carry, request_id.clone(), 0usize),
                move |(mut bytes, mut carry, request_id, mut call_index)| async move {
                    loop {
                        match bytes.next().await {
                            Some(Ok(chunk)) => {
                                let text = String::from_utf8_lossy(&chunk);
                                carry.push_str(&text);
                                if let Some(last_newline) = carry.rfind('\n') {
                                    let (complete, rest) = carry.split_at(last_newline + 1);
                                    let parsed = parse_sse_text(complete, &request_id, &mut call_index);
                                    let rest = rest.to_string();
                                    if parsed.is_empty() {
                                        carry = rest;
                                        continue;
                                    }
                                    return Some((stream::iter(parsed), (bytes, rest, request_id, call_index)));
                                }
                            }
                            Some(Err(e)) => {
                                return Some((
                                    stream::iter(vec![Err(AgentError::ProviderFatal {
                                        reason: format!("stream read error: {e}"),
                                    })]),
                                    (bytes, carry, request_id, call_index),
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
        let mut body = build_request_body(&self.config, &prompt, &[], None);
        body["generationConfig"]["responseMimeType"] = json!("application/json");
        body["generationConfig"]["responseSchema"] = schema_to_gemini(&schema);

        const MAX_ATTEMPTS: u32 = 5;
        let mut last_err = None;
        let url = self.generate_url();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                backoff_sleep(attempt, 2_000, 10_000).await;
            }
            let response = self.client.post(&url).header("content-type", "application/json").json(&body).send().await;
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
                    reason: format!("gemini returned {status}: {text}"),
                });
            }

            let parsed: Value = response.json().await.map_err(|e| AgentError::ProviderFatal {
                reason: format!("failed to decode response body: {e}"),
            })?;

            let text = parsed
                .get("candidates")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
                .and_then(|c| c.get("content"))
                .and_then(|c| c.get("parts"))
                .and_then(|p| p.as_array())
                .and_then(|p| p.first())
                .and_then(|p| p.get("text"))
                .and_then(|t| t.as_str());

            return match text {
                Some(t) => serde_json::from_str(t).map_err(|e| AgentError::ProviderFatal {
                    reason: format!("gemini structured response was not valid json: {e}"),
                }),
                None => Err(AgentError::ProviderFatal {
                    reason: "gemini response had no text part for structured output".to_string(),
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
    fn role_mapping_matches_gemini_convention() {
        assert_eq!(role_name(Role::User), "user");
        assert_eq!(role_name(Role::Model), "model");
        assert_eq!(role_name(Role::Tool), "user");
    }

    #[test]
    fn schema_type_tokens_are_upper_cased() {
        let schema = json!({ "type": "object", "properties": { "sql": { "type": "string" } } });
        let converted = schema_to_gemini(&schema);
        assert_eq!(converted["type"], "OBJECT");
        assert_eq!(converted["properties"]["sql"]["type"], "STRING");
    }

    #[test]
    fn sse_text_chunk_is_parsed() {
        let mut idx = 0;
        let data = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"hi\"}]}}]}\n";
        let chunks = parse_sse_text(data, "req-1", &mut idx);
        assert_eq!(chunks.len(), 1);
        match chunks.into_iter().next().unwrap().unwrap() {
            StreamChunk::Text(t) => assert_eq!(t, "hi"),
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn sse_function_call_arrives_whole() {
        let mut idx = 0;
        let data = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"schema_discovery\",\"args\":{}}}]},\"finishReason\":\"STOP\"}]}\n";
        let chunks = parse_sse_text(data, "req-1", &mut idx);
        assert_eq!(chunks.len(), 3);
        assert!(matches!(chunks[0].as_ref().unwrap(), StreamChunk::ToolCallStart { .. }));
        match chunks[1].as_ref().unwrap() {
            StreamChunk::ToolCallEnd { call, .. } => assert_eq!(call.name, "schema_discovery"),
            other => panic!("unexpected chunk: {other:?}"),
        }
        assert!(matches!(chunks[2].as_ref().unwrap(), StreamChunk::Done { .. }));
    }

    #[test]
    fn empty_parts_contents_are_dropped_from_wire_form() {
        let history = vec![Content::model(vec![])];
        assert!(to_wire_contents(&history).is_empty());
    }

    /// Round-trip check for spec scenario 4 (provider parity): a text turn
    /// followed by a tool call survives `internal -> wire -> internal`
    /// (outbound text/name through `to_wire_contents`, inbound shape through
    /// `parse_sse_text`) with the call's name and arguments intact.
    #[test]
    fn text_and_tool_call_round_trip_through_wire_form() {
        let history = vec![
            Content::user("list tables"),
            Content::model(vec![Part::function_call("c1", "schema_discovery", json!({}))]),
        ];
        let wire = to_wire_contents(&history);
        assert_eq!(wire[0]["parts"][0]["text"], "list tables");
        assert_eq!(wire[1]["parts"][0]["functionCall"]["name"], "schema_discovery");

        let data = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"schema_discovery\",\"args\":{}}}]},\"finishReason\":\"STOP\"}]}\n";
        let mut idx = 0;
        let chunks = parse_sse_text(data, "req-1", &mut idx);
        match chunks[1].as_ref().unwrap() {
            StreamChunk::ToolCallEnd { call, .. } => {
                assert_eq!(call.name, "schema_discovery");
                assert_eq!(call.args, json!({}));
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[test]
    fn per_call_system_instruction_populates_the_native_system_field() {
        let config = GeminiConfig::new("key", "gemini-2.0-flash");
        let body = build_request_body(&config, &[], &[], Some("be terse"));
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        assert!(!body["contents"].as_array().unwrap().iter().any(|c| c["parts"][0]["text"] == "be terse"));
    }

    #[test]
    fn per_call_system_instruction_overrides_config_default() {
        let mut config = GeminiConfig::new("key", "gemini-2.0-flash");
        config.system_instruction = Some("config default".into());
        let body = build_request_body(&config, &[], &[], Some("call-time override"));
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "call-time override");
    }
}
