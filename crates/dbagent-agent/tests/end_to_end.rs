//! Exercises the full `Client` drive loop end to end: a tool call that
//! never confirms, one that requires sign-off and gets cancelled, two
//! concurrent calls in a single batch, compression firing at threshold,
//! and a mid-stream abort. Each test stands in for one scenario a UI
//! integration would actually hit.

use async_trait::async_trait;
use dbagent_agent::{
    Chat, Client, ClientConfig, CompressionConfig, RetryConfig, SchemaCatalog, SchemaDiscoveryTool, SqlExecuteTool,
    SqlExecutor, ToolRegistry,
};
use dbagent_core::content::{Content, Part};
use dbagent_core::error::AgentError;
use dbagent_core::events::{AbortSignal, TurnEvent};
use dbagent_core::provider::{ModelProvider, StreamChunk};
use dbagent_core::tool::{ConfirmationOutcome, ToolCall};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Replays one scripted `Vec<StreamChunk>` per call to `send_message_stream`,
/// in order, and answers every `generate_json` (the Next-Speaker Arbiter)
/// the same way.
struct ScriptedProvider {
    turns: std::sync::Mutex<Vec<Vec<Result<StreamChunk, AgentError>>>>,
    next_speaker_answer: Value,
}

impl ScriptedProvider {
    fn new(turns: Vec<Vec<Result<StreamChunk, AgentError>>>) -> Arc<Self> {
        Arc::new(Self {
            turns: std::sync::Mutex::new(turns),
            next_speaker_answer: serde_json::json!({"next_speaker": "user", "reasoning": "turn complete"}),
        })
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }
    fn model(&self) -> &str {
        "scripted-model"
    }
    async fn send_message_stream(
        &self,
        _history: Vec<Content>,
        _tools: Vec<dbagent_core::tool::ToolSpec>,
        _system_instruction: Option<&str>,
    ) -> Result<BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
        let mut turns = self.turns.lock().unwrap();
        let next = turns.remove(0);
        Ok(stream::iter(next).boxed())
    }
    async fn generate_json(&self, _prompt: Vec<Content>, _schema: Value) -> Result<Value, AgentError> {
        Ok(self.next_speaker_answer.clone())
    }
}

/// A stream that yields one chunk immediately, sleeps, then yields the rest
/// — giving a test a real window in which to call `abort()` mid-stream.
struct SlowProvider {
    chunks: std::sync::Mutex<Option<Vec<Result<StreamChunk, AgentError>>>>,
    next_speaker_answer: Value,
}

#[async_trait]
impl ModelProvider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }
    fn model(&self) -> &str {
        "slow-model"
    }
    async fn send_message_stream(
        &self,
        _history: Vec<Content>,
        _tools: Vec<dbagent_core::tool::ToolSpec>,
        _system_instruction: Option<&str>,
    ) -> Result<BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
        let chunks = self.chunks.lock().unwrap().take().expect("script already consumed");
        let paced = stream::unfold(chunks.into_iter(), |mut iter| async move {
            let next = iter.next()?;
            tokio::time::sleep(Duration::from_millis(40)).await;
            Some((next, iter))
        });
        Ok(paced.boxed())
    }
    async fn generate_json(&self, _prompt: Vec<Content>, _schema: Value) -> Result<Value, AgentError> {
        Ok(self.next_speaker_answer.clone())
    }
}

fn catalog_with_users_table() -> SchemaCatalog {
    let mut tables = BTreeMap::new();
    tables.insert("users".to_string(), vec!["id".to_string(), "name".to_string()]);
    SchemaCatalog { tables, views: BTreeMap::new() }
}

struct RejectingExecutor;

#[async_trait]
impl SqlExecutor for RejectingExecutor {
    async fn execute(&self, _sql: &str) -> Result<Value, String> {
        panic!("executor should never run a cancelled statement")
    }
}

/// Scenario 1: a safe read requires no confirmation and the session ends
/// with exactly one request/response pair.
#[tokio::test]
async fn safe_read_completes_without_confirmation() {
    let call = ToolCall::new("s1-turn-1", "c1", "schema_discovery", serde_json::json!({}));
    let provider = ScriptedProvider::new(vec![
        vec![
            Ok(StreamChunk::ToolCallStart { index: 0, call_id: "c1".into(), name: "schema_discovery".into() }),
            Ok(StreamChunk::ToolCallEnd { index: 0, call }),
            Ok(StreamChunk::Done { stop_reason: "tool_use".into() }),
        ],
        vec![
            Ok(StreamChunk::Text("users".into())),
            Ok(StreamChunk::Done { stop_reason: "end_turn".into() }),
        ],
    ]);
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SchemaDiscoveryTool::new(catalog_with_users_table()))).unwrap();
    let client = Client::new(Arc::new(registry), provider, ClientConfig::default());

    let abort = AbortSignal::new();
    let mut stream = client.send_message_stream("list tables".into(), abort, "s1".into());

    let mut requests = 0;
    let mut responses = 0;
    let mut confirmations = 0;
    while let Some(event) = stream.next().await {
        match event {
            TurnEvent::ToolCallRequest { .. } => requests += 1,
            TurnEvent::ToolCallResponse { .. } => responses += 1,
            TurnEvent::ToolCallConfirmation { .. } => confirmations += 1,
            _ => {}
        }
    }
    assert_eq!(requests, 1);
    assert_eq!(responses, 1);
    assert_eq!(confirmations, 0);
}

/// Scenario 2: a no-WHERE DELETE must be confirmed; cancelling ends the
/// session without another model turn.
#[tokio::test]
async fn destructive_sql_requires_confirmation_then_cancel_ends_session() {
    let call = ToolCall::new(
        "s2-turn-1",
        "c1",
        "sql_execute",
        serde_json::json!({"sql": "DELETE FROM orders"}),
    );
    let provider = ScriptedProvider::new(vec![vec![
        Ok(StreamChunk::ToolCallStart { index: 0, call_id: "c1".into(), name: "sql_execute".into() }),
        Ok(StreamChunk::ToolCallEnd { index: 0, call }),
        Ok(StreamChunk::Done { stop_reason: "tool_use".into() }),
    ]]);
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SqlExecuteTool::new(Arc::new(RejectingExecutor)))).unwrap();
    let client = Client::new(Arc::new(registry), provider, ClientConfig::default());

    let abort = AbortSignal::new();
    let mut stream = client.send_message_stream("delete the orders".into(), abort, "s2".into());

    let mut confirmed_call_id = None;
    let mut cancelled_response = None;
    while let Some(event) = stream.next().await {
        match event {
            TurnEvent::ToolCallConfirmation { call_id, details } => {
                assert_eq!(details.risk_level, "high");
                confirmed_call_id = Some(call_id);
                client.handle_confirmation(confirmed_call_id.as_ref().unwrap(), ConfirmationOutcome::Cancel).await;
            }
            TurnEvent::ToolCallResponse { call_id, return_display, .. } => {
                cancelled_response = Some((call_id, return_display));
            }
            _ => {}
        }
    }
    assert!(confirmed_call_id.is_some(), "must have asked for confirmation");
    let (call_id, _) = cancelled_response.expect("must have synthesized a response for the cancelled call");
    assert_eq!(call_id, "c1");
}

/// Scenario 3: two parallel-safe calls in one batch complete concurrently
/// but their responses land in call order regardless of completion order.
#[tokio::test]
async fn parallel_batch_preserves_call_order_in_responses() {
    struct VariableDelayTool {
        calls_seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl dbagent_agent::FunctionTool for VariableDelayTool {
        fn name(&self) -> &str {
            "read_file"
        }
        fn description(&self) -> &str {
            "reads a file, slower for later letters"
        }
        fn parameter_schema(&self) -> dbagent_core::tool::ParametersSchema {
            dbagent_core::tool::ParametersSchema::object()
                .with_property("path", dbagent_core::tool::ParameterProperty::string("path"))
        }
        fn validate(&self, _params: &Value) -> Result<(), String> {
            Ok(())
        }
        async fn should_confirm(&self, _params: &Value, _abort: &AbortSignal) -> Option<dbagent_core::tool::ConfirmationDetails> {
            None
        }
        async fn execute(
            &self,
            params: Value,
            _abort: &AbortSignal,
            _progress: Option<dbagent_agent::registry::ProgressCallback>,
        ) -> dbagent_agent::registry::ToolResult {
            let path = params["path"].as_str().unwrap_or_default().to_string();
            // "b" finishes before "a" so order can only come from request order.
            let delay = if path == "a.txt" { 40 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.calls_seen.lock().unwrap().push(path.clone());
            dbagent_agent::registry::ToolResult::ok("read ok", serde_json::json!({ "path": path }))
        }
    }

    let call_a = ToolCall::new("s3-turn-1", "a", "read_file", serde_json::json!({"path": "a.txt"}));
    let call_b = ToolCall::new("s3-turn-1", "b", "read_file", serde_json::json!({"path": "b.txt"}));
    let provider = ScriptedProvider::new(vec![
        vec![
            Ok(StreamChunk::ToolCallStart { index: 0, call_id: "a".into(), name: "read_file".into() }),
            Ok(StreamChunk::ToolCallEnd { index: 0, call: call_a }),
            Ok(StreamChunk::ToolCallStart { index: 1, call_id: "b".into(), name: "read_file".into() }),
            Ok(StreamChunk::ToolCallEnd { index: 1, call: call_b }),
            Ok(StreamChunk::Done { stop_reason: "tool_use".into() }),
        ],
        vec![
            Ok(StreamChunk::Text("done".into())),
            Ok(StreamChunk::Done { stop_reason: "end_turn".into() }),
        ],
    ]);
    let calls_seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(VariableDelayTool { calls_seen: calls_seen.clone() })).unwrap();
    let client = Client::new(Arc::new(registry), provider, ClientConfig::default());

    let abort = AbortSignal::new();
    let mut stream = client.send_message_stream("read both files".into(), abort, "s3".into());

    let mut response_order = Vec::new();
    while let Some(event) = stream.next().await {
        if let TurnEvent::ToolCallResponse { call_id, .. } = event {
            response_order.push(call_id);
        }
    }

    // b.txt actually finished executing first...
    assert_eq!(*calls_seen.lock().unwrap(), vec!["b.txt".to_string(), "a.txt".to_string()]);
    // ...but responses are appended in call order, a then b.
    assert_eq!(response_order, vec!["a".to_string(), "b".to_string()]);
}

/// Scenario 5: compression fires once the curated history crosses the
/// configured token budget, keeping the most recent turns verbatim.
#[tokio::test]
async fn compression_fires_once_at_threshold_and_keeps_recent_turns() {
    struct SummarizingProvider {
        summary_calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelProvider for SummarizingProvider {
        fn name(&self) -> &str {
            "summarizer"
        }
        fn model(&self) -> &str {
            "summarizer-model"
        }
        async fn send_message_stream(
            &self,
            _history: Vec<Content>,
            _tools: Vec<dbagent_core::tool::ToolSpec>,
            _system_instruction: Option<&str>,
        ) -> Result<BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
            unimplemented!("not exercised by this scenario")
        }
        async fn generate_json(&self, _prompt: Vec<Content>, _schema: Value) -> Result<Value, AgentError> {
            self.summary_calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({ "summary": "condensed summary of the prior turns" }))
        }
    }

    let provider = SummarizingProvider { summary_calls: AtomicUsize::new(0) };
    let mut chat = Chat::new();
    for i in 0..10 {
        chat.add(Content::user(format!("question {i}")));
        chat.add(Content::model(vec![Part::text(format!("answer {i}"))]));
    }

    let config = CompressionConfig {
        threshold_fraction: 0.0,
        context_budget_tokens: 1,
        keep_recent_turns: 6,
        retry: RetryConfig::default(),
    };
    assert!(chat.needs_compression(&config));
    let tokens_before = chat.estimated_curated_tokens();
    let outcome = chat.compress(&provider, &config).await.unwrap().expect("should have compressed");

    assert_eq!(outcome.tokens_before, tokens_before);
    assert!(outcome.tokens_after < outcome.tokens_before);
    assert_eq!(provider.summary_calls.load(Ordering::SeqCst), 1);

    // The 6 most recent turns (3 question/answer pairs) survive verbatim.
    let curated = chat.curated();
    assert!(curated.iter().any(|c| c.text() == "question 9"));
    assert!(curated.iter().any(|c| c.text() == "answer 9"));

    // Compressing again immediately is a no-op: idempotent.
    assert!(!chat.needs_compression(&config) || chat.compress(&provider, &config).await.unwrap().is_none());
}

/// Scenario 6: aborting mid-stream yields at most one more chunk, then
/// `UserCancelled`, and the partial model text is still committed to Chat.
#[tokio::test]
async fn abort_mid_stream_stops_after_one_more_chunk_and_keeps_partial_text() {
    let provider = Arc::new(SlowProvider {
        chunks: std::sync::Mutex::new(Some(vec![
            Ok(StreamChunk::Text("partial answer".into())),
            Ok(StreamChunk::Text(" that should never arrive".into())),
            Ok(StreamChunk::Done { stop_reason: "end_turn".into() }),
        ])),
        next_speaker_answer: serde_json::json!({"next_speaker": "user", "reasoning": "n/a"}),
    });
    let registry = Arc::new(ToolRegistry::new());
    let client = Client::new(registry, provider, ClientConfig::default());

    let abort = AbortSignal::new();
    let mut stream = client.send_message_stream("start talking".into(), abort.clone(), "s6".into());

    let mut saw_cancelled = false;
    let mut extra_chunks_after_abort = 0;
    let mut aborted_yet = false;
    while let Some(event) = stream.next().await {
        match event {
            TurnEvent::Content { .. } => {
                if !aborted_yet {
                    abort.abort();
                    aborted_yet = true;
                } else {
                    extra_chunks_after_abort += 1;
                }
            }
            TurnEvent::UserCancelled => saw_cancelled = true,
            _ => {}
        }
    }

    assert!(saw_cancelled, "expected a UserCancelled event after abort");
    assert!(extra_chunks_after_abort <= 1, "at most one more chunk should be yielded after abort");
}
