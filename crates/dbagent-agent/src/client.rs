//! The Client: the public, long-lived handle that owns Chat, the
//! Scheduler, and the Provider, and drives the Turn / Scheduler /
//! Next-Speaker loop behind one `stream<TurnEvent>` per call.
//!
//! Owns every collaborator, exposes one streaming entry point, runs the
//! loop on a spawned task, and forwards events onto an mpsc channel. While
//! waiting on a just-confirmed batch it uses a bounded-poll reconciliation
//! pattern rather than blocking indefinitely.

use dbagent_core::content::{synthesize_pending_response, Content, Part};
use dbagent_core::error::AgentError;
use dbagent_core::events::{AbortSignal, TurnEvent};
use dbagent_core::provider::ModelProvider;
use dbagent_core::telemetry::{TelemetryEvent, TelemetryHub, TelemetryLevel};
use dbagent_core::tool::{ConfirmationOutcome, ToolCall, ToolCallStatus};
use dbagent_core::usage::{TokenStatistics, TokenUsageRecord};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, instrument, warn};

use crate::chat::{Chat, CompressionConfig};
use crate::registry::ToolRegistry;
use crate::scheduler::{SchedulerObserver, ToolScheduler};
use crate::turn::run_turn;
use crate::arbiter::{decide_next_speaker, NextSpeaker};

const BRIDGE_PROMPT: &str = "Please continue.";

/// How strictly a provider requires `function_call`/`function_response`
/// pairing before the next request — governs the reconciliation wait after
/// a batch completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStrictness {
    /// OpenAI-style: poll up to 5s at ≤100ms cadence for all-terminal.
    Strict,
    /// Gemini/Anthropic-style: a small fixed settle delay is enough.
    Tolerant,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_session_turns: usize,
    pub compression: CompressionConfig,
    pub system_instruction: Option<String>,
    pub pairing: PairingStrictness,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_session_turns: 25,
            compression: CompressionConfig::default(),
            system_instruction: None,
            pairing: PairingStrictness::Tolerant,
        }
    }
}

/// Routes `on_all_tool_calls_complete` back to whichever `send_message_stream`
/// call is waiting on that batch's `request_id`, and forwards
/// `on_tool_calls_update` transitions into `AwaitingApproval` onto the public
/// event stream as `ToolCallConfirmation`. This is a one-way notification
/// path from Scheduler to Client, so the Scheduler never needs to know
/// about `Client` itself.
struct BatchCompletionRouter {
    waiters: Mutex<HashMap<String, oneshot::Sender<Vec<ToolCall>>>>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<TurnEvent>>>,
    confirmations_emitted: Mutex<HashSet<String>>,
}

#[async_trait::async_trait]
impl SchedulerObserver for BatchCompletionRouter {
    async fn on_tool_calls_update(&self, all_calls: &[ToolCall]) {
        let Some(tx) = self.event_tx.lock().await.clone() else {
            return;
        };
        let mut emitted = self.confirmations_emitted.lock().await;
        for call in all_calls {
            if call.status == ToolCallStatus::AwaitingApproval && emitted.insert(call.call_id.clone()) {
                if let Some(details) = &call.confirmation {
                    let _ = tx.send(TurnEvent::ToolCallConfirmation {
                        call_id: call.call_id.clone(),
                        details: details.clone(),
                    });
                }
            }
        }
    }

    async fn on_all_tool_calls_complete(&self, batch_calls: &[ToolCall]) {
        let Some(request_id) = batch_calls.first().map(|c| c.request_id.clone()) else {
            return;
        };
        let calls = batch_calls.to_vec();
        let mut waiters = self.waiters.lock().await;
        if let Some(tx) = waiters.remove(&request_id) {
            let _ = tx.send(calls);
        }
    }
}

/// The conversational agent's public handle.
pub struct Client {
    chat: Mutex<Chat>,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn ModelProvider>,
    scheduler: Arc<ToolScheduler>,
    router: Arc<BatchCompletionRouter>,
    config: ClientConfig,
    usage: Mutex<TokenStatistics>,
    telemetry: TelemetryHub,
}

impl Client {
    pub fn new(registry: Arc<ToolRegistry>, provider: Arc<dyn ModelProvider>, config: ClientConfig) -> Arc<Self> {
        Self::with_telemetry(registry, provider, config, TelemetryHub::new())
    }

    pub fn with_telemetry(
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn ModelProvider>,
        config: ClientConfig,
        telemetry: TelemetryHub,
    ) -> Arc<Self> {
        let router = Arc::new(BatchCompletionRouter {
            waiters: Mutex::new(HashMap::new()),
            event_tx: Mutex::new(None),
            confirmations_emitted: Mutex::new(HashSet::new()),
        });
        let scheduler = Arc::new(ToolScheduler::new(registry.clone(), router.clone() as Arc<dyn SchedulerObserver>));
        Arc::new(Self {
            chat: Mutex::new(Chat::new()),
            registry,
            provider,
            scheduler,
            router,
            config,
            usage: Mutex::new(TokenStatistics::new()),
            telemetry,
        })
    }

    pub async fn token_statistics(&self) -> TokenStatistics {
        self.usage.lock().await.clone()
    }

    fn emit_telemetry(&self, session_id: &str, level: TelemetryLevel, name: &str, fields: serde_json::Value) {
        self.telemetry.emit(TelemetryEvent::new(level, name, session_id, fields));
    }

    /// Start (or continue) a conversation turn. Each call resets the abort
    /// signal and drives the Turn / Scheduler / Next-Speaker loop on a
    /// spawned task, forwarding every [`TurnEvent`] as it is produced.
    #[instrument(skip(self, abort), fields(session_id = %session_id))]
    pub fn send_message_stream(
        self: &Arc<Self>,
        user_text: String,
        abort: AbortSignal,
        session_id: String,
    ) -> UnboundedReceiverStream<TurnEvent> {
        abort.reset();
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.clone();
        tokio::spawn(async move {
            client.drive(user_text, abort, session_id, tx).await;
        });
        UnboundedReceiverStream::new(rx)
    }

    async fn drive(self: Arc<Self>, user_text: String, abort: AbortSignal, session_id: String, tx: mpsc::UnboundedSender<TurnEvent>) {
        *self.router.event_tx.lock().await = Some(tx.clone());
        let mut next_parts = vec![Part::text(user_text)];
        let mut is_bridge = false;
        let mut turns_taken = 0usize;
        let mut request_counter = 0u64;

        loop {
            if turns_taken >= self.config.max_session_turns {
                let _ = tx.send(TurnEvent::MaxTurnsReached);
                self.emit_telemetry(&session_id, TelemetryLevel::Warn, "turn.max_reached", serde_json::json!({}));
                break;
            }
            turns_taken += 1;
            request_counter += 1;
            let request_id = format!("{session_id}-turn-{request_counter}");

            if let Err(e) = self.maybe_compress(&session_id, &tx).await {
                let _ = tx.send(TurnEvent::Error { kind: "compression".into(), message: e.to_string() });
                break;
            }

            if abort.is_aborted() {
                let _ = tx.send(TurnEvent::UserCancelled);
                break;
            }

            let outcome = {
                let mut chat = self.chat.lock().await;
                let result = run_turn(
                    &mut chat,
                    &self.registry,
                    &*self.provider,
                    self.config.system_instruction.as_deref(),
                    &request_id,
                    next_parts.clone(),
                    is_bridge,
                    &abort,
                    &tx,
                )
                .await;
                result
            };

            let outcome = match outcome {
                Ok(o) => o,
                Err(e) => {
                    warn!(error = %e, "turn failed after retries");
                    let _ = tx.send(TurnEvent::Error { kind: "provider".into(), message: e.to_string() });
                    break;
                }
            };

            if let Some((prompt_tokens, completion_tokens)) = outcome.usage {
                self.usage
                    .lock()
                    .await
                    .add_usage(TokenUsageRecord::new(self.provider.model(), prompt_tokens, completion_tokens));
            }

            if abort.is_aborted() {
                let _ = tx.send(TurnEvent::UserCancelled);
                break;
            }

            if !outcome.tool_call_requests.is_empty() {
                let (completion_tx, completion_rx) = oneshot::channel();
                self.router.waiters.lock().await.insert(request_id.clone(), completion_tx);

                let scheduler = self.scheduler.clone();
                let schedule_abort = abort.clone();
                let requests = outcome.tool_call_requests.clone();
                let schedule_request_id = request_id.clone();
                tokio::spawn(async move {
                    scheduler.schedule(&schedule_request_id, requests, &schedule_abort).await;
                });

                let batch_calls = self.await_batch_completion(&request_id, completion_rx, &abort).await;

                if batch_calls.is_empty() && abort.is_aborted() {
                    let _ = tx.send(TurnEvent::UserCancelled);
                    break;
                }

                let user_rejected = batch_calls.iter().any(|c| c.status == ToolCallStatus::Cancelled);

                {
                    let mut chat = self.chat.lock().await;
                    chat.add(build_tool_response_content(&batch_calls));
                }

                for call in &batch_calls {
                    let _ = tx.send(TurnEvent::ToolCallResponse {
                        call_id: call.call_id.clone(),
                        result_summary: call
                            .error
                            .clone()
                            .unwrap_or_else(|| call.result.as_ref().map(|r| r.to_string()).unwrap_or_default()),
                        return_display: call.return_display.clone(),
                    });
                }

                if user_rejected {
                    break;
                }

                next_parts = vec![Part::text(BRIDGE_PROMPT)];
                is_bridge = true;
                continue;
            }

            let decision = {
                let chat = self.chat.lock().await;
                decide_next_speaker(&chat.curated(), &*self.provider).await
            };
            match decision {
                Ok(d) if d.next_speaker == NextSpeaker::Model => {
                    info!(reasoning = %d.reasoning, "next-speaker arbiter: model continues");
                    next_parts = vec![Part::text(BRIDGE_PROMPT)];
                    is_bridge = true;
                    continue;
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "next-speaker arbiter failed; defaulting to user");
                    break;
                }
            }
        }
    }

    async fn maybe_compress(&self, session_id: &str, tx: &mpsc::UnboundedSender<TurnEvent>) -> Result<(), AgentError> {
        let mut chat = self.chat.lock().await;
        if !chat.needs_compression(&self.config.compression) {
            return Ok(());
        }
        if let Some(outcome) = chat.compress(&*self.provider, &self.config.compression).await? {
            self.emit_telemetry(
                session_id,
                TelemetryLevel::Info,
                "chat.compressed",
                serde_json::json!({"tokens_before": outcome.tokens_before, "tokens_after": outcome.tokens_after}),
            );
            let _ = tx.send(TurnEvent::ChatCompressed {
                tokens_before: outcome.tokens_before,
                tokens_after: outcome.tokens_after,
            });
        }
        Ok(())
    }

    /// Wait for the batch-complete callback, or abort — the strict-pair
    /// reconciliation wait. Pairing strictness controls how aggressively we
    /// poll once `abort` fires mid-wait: strict providers
    /// must observe every call in the batch reach a terminal state (capped
    /// at 5s / 100ms cadence) before the Client proceeds; tolerant providers
    /// accept whatever the scheduler reports immediately.
    async fn await_batch_completion(&self, request_id: &str, completion_rx: oneshot::Receiver<Vec<ToolCall>>, abort: &AbortSignal) -> Vec<ToolCall> {
        tokio::select! {
            result = completion_rx => result.unwrap_or_default(),
            _ = wait_for_abort(abort) => {
                self.scheduler.cancel_all(abort).await;
                self.router.waiters.lock().await.remove(request_id);
                self.poll_until_terminal_or_deadline(request_id).await
            }
        }
    }

    async fn poll_until_terminal_or_deadline(&self, request_id: &str) -> Vec<ToolCall> {
        let deadline = match self.config.pairing {
            PairingStrictness::Strict => std::time::Duration::from_secs(5),
            PairingStrictness::Tolerant => std::time::Duration::from_millis(200),
        };
        let started = tokio::time::Instant::now();
        loop {
            let snapshot = self.scheduler.snapshot().await;
            let relevant: Vec<ToolCall> = snapshot.into_iter().filter(|c| c.request_id == request_id).collect();
            if relevant.iter().all(|c| c.status.is_terminal()) || started.elapsed() >= deadline {
                return relevant;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

async fn wait_for_abort(abort: &AbortSignal) {
    loop {
        if abort.is_aborted() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

/// One `role=tool` Content carrying every `function_response` part for a
/// batch, in request order — the same order as the originating
/// `function_call` parts, regardless of completion order.
fn build_tool_response_content(batch_calls: &[ToolCall]) -> Content {
    let parts = batch_calls
        .iter()
        .map(|call| match &call.result {
            Some(result) if call.status == ToolCallStatus::Success => {
                Part::function_response(call.call_id.clone(), call.name.clone(), result.clone())
            }
            _ => synthesize_pending_response(&call.call_id, &call.name),
        })
        .collect();
    Content::tool(parts)
}

/// Used by a UI layer to resolve a parked confirmation; re-exported from
/// `Client` so callers don't need to reach into the scheduler directly.
impl Client {
    pub async fn handle_confirmation(&self, call_id: &str, outcome: ConfirmationOutcome) {
        self.scheduler.handle_confirmation(call_id, outcome).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FunctionTool, ProgressCallback, ToolResult};
    use async_trait::async_trait;
    use dbagent_core::provider::StreamChunk;
    use dbagent_core::tool::{ConfirmationDetails, ParameterProperty, ParametersSchema, ToolSpec};
    use futures::stream::{self, BoxStream, StreamExt};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoReadTool;

    #[async_trait]
    impl FunctionTool for EchoReadTool {
        fn name(&self) -> &str {
            "read_file"
        }
        fn description(&self) -> &str {
            "reads a file"
        }
        fn parameter_schema(&self) -> ParametersSchema {
            ParametersSchema::object().with_property("path", ParameterProperty::string("path"))
        }
        fn validate(&self, _params: &Value) -> Result<(), String> {
            Ok(())
        }
        async fn should_confirm(&self, _params: &Value, _abort: &AbortSignal) -> Option<ConfirmationDetails> {
            None
        }
        async fn execute(&self, params: Value, _abort: &AbortSignal, _progress: Option<ProgressCallback>) -> ToolResult {
            ToolResult::ok("read ok", params)
        }
    }

    struct ScriptedProvider {
        turns: std::sync::Mutex<Vec<Vec<Result<StreamChunk, AgentError>>>>,
        next_speaker_answer: Value,
        calls: AtomicUsize,
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
            _tools: Vec<ToolSpec>,
            _system_instruction: Option<&str>,
        ) -> Result<BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
            let mut turns = self.turns.lock().unwrap();
            let next = turns.remove(0);
            Ok(stream::iter(next).boxed())
        }
        async fn generate_json(&self, _prompt: Vec<Content>, _schema: Value) -> Result<Value, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.next_speaker_answer.clone())
        }
    }

    #[tokio::test]
    async fn simple_text_turn_ends_with_user_as_next_speaker() {
        let provider = Arc::new(ScriptedProvider {
            turns: std::sync::Mutex::new(vec![vec![
                Ok(StreamChunk::Text("hi there".into())),
                Ok(StreamChunk::Done { stop_reason: "end_turn".into() }),
            ]]),
            next_speaker_answer: serde_json::json!({"next_speaker": "user", "reasoning": "done"}),
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(ToolRegistry::new());
        let client = Client::new(registry, provider, ClientConfig::default());

        let abort = AbortSignal::new();
        let mut stream = client.send_message_stream("hello".into(), abort, "s1".into());

        let mut saw_content = false;
        while let Some(event) = stream.next().await {
            if matches!(event, TurnEvent::Content { .. }) {
                saw_content = true;
            }
        }
        assert!(saw_content);
    }

    #[tokio::test]
    async fn tool_call_batch_feeds_response_back_and_continues() {
        let call = ToolCall::new("s1-turn-1", "c1", "read_file", serde_json::json!({"path": "a.txt"}));
        let provider = Arc::new(ScriptedProvider {
            turns: std::sync::Mutex::new(vec![
                vec![
                    Ok(StreamChunk::ToolCallStart { index: 0, call_id: "c1".into(), name: "read_file".into() }),
                    Ok(StreamChunk::ToolCallEnd { index: 0, call }),
                    Ok(StreamChunk::Done { stop_reason: "tool_use".into() }),
                ],
                vec![
                    Ok(StreamChunk::Text("here is the file".into())),
                    Ok(StreamChunk::Done { stop_reason: "end_turn".into() }),
                ],
            ]),
            next_speaker_answer: serde_json::json!({"next_speaker": "user", "reasoning": "done"}),
            calls: AtomicUsize::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoReadTool)).unwrap();
        let client = Client::new(Arc::new(registry), provider, ClientConfig::default());

        let abort = AbortSignal::new();
        let mut stream = client.send_message_stream("read a.txt".into(), abort, "s1".into());

        let mut saw_response = false;
        while let Some(event) = stream.next().await {
            if let TurnEvent::ToolCallResponse { call_id, .. } = event {
                assert_eq!(call_id, "c1");
                saw_response = true;
            }
        }
        assert!(saw_response);
    }
}
