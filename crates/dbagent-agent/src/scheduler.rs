//! Per-call tool state machine with confirmation gating, concurrent
//! same-batch execution, and strict cross-batch ordering.
//!
//! Each call runs validate → confirm → execute → record. Confirmation
//! parks the call in `AwaitingApproval` behind a `tokio::select!` over a
//! oneshot channel and the session abort signal, resumed when the UI calls
//! `handle_confirmation`.

use dbagent_core::events::AbortSignal;
use dbagent_core::tool::{ConfirmationOutcome, ToolCall, ToolCallStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::registry::{FunctionTool, ToolRegistry, ToolResult};

/// One requested call as seen by the scheduler before it becomes a [`ToolCall`].
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Observer callbacks the scheduler fires. A trait rather than raw channels
/// so a `Client` can wire itself in without the scheduler knowing its
/// concrete type — a one-way notification path from scheduler to client
/// with no back-reference cycle. Async so an implementation can take its
/// own lock without resorting to `try_lock`.
#[async_trait::async_trait]
pub trait SchedulerObserver: Send + Sync {
    /// Fired on every state transition of any call.
    async fn on_tool_calls_update(&self, _all_calls: &[ToolCall]) {}

    /// Fired exactly once per batch, when every call in it has reached a
    /// terminal state.
    async fn on_all_tool_calls_complete(&self, _batch_calls: &[ToolCall]) {}
}

/// No-op observer for callers that only care about `schedule`'s return value.
pub struct NullObserver;
impl SchedulerObserver for NullObserver {}

/// Canonical JSON encoding fingerprint for the trusted-tools cache.
fn fingerprint(name: &str, args: &serde_json::Value) -> String {
    format!("{name}:{}", canonical_json(args))
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{:?}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

struct ParkedCall {
    resume: oneshot::Sender<ConfirmationOutcome>,
}

/// A batch is the set of calls sharing one `request_id`.
struct Batch {
    request_id: String,
    call_ids: Vec<String>,
}

/// Central tool-call state machine.
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    observer: Arc<dyn SchedulerObserver>,
    calls: Arc<Mutex<HashMap<String, ToolCall>>>,
    parked: Mutex<HashMap<String, ParkedCall>>,
    trusted: Mutex<std::collections::HashSet<String>>,
    /// Serializes batches: a new `schedule` call awaits this before doing
    /// anything, so batch N+1 never begins until batch N has reached an
    /// all-terminal state.
    batch_gate: Mutex<()>,
}

impl ToolScheduler {
    pub fn new(registry: Arc<ToolRegistry>, observer: Arc<dyn SchedulerObserver>) -> Self {
        Self {
            registry,
            observer,
            calls: Arc::new(Mutex::new(HashMap::new())),
            parked: Mutex::new(HashMap::new()),
            trusted: Mutex::new(std::collections::HashSet::new()),
            batch_gate: Mutex::new(()),
        }
    }

    /// Snapshot of every call the scheduler has ever seen this session.
    pub async fn snapshot(&self) -> Vec<ToolCall> {
        self.calls.lock().await.values().cloned().collect()
    }

    /// Schedule one batch of requests sharing `request_id` and run it to
    /// completion, honoring confirmation gates and `abort`. Returns every
    /// call in the batch in its terminal state, in the order requested —
    /// callers append the resulting `function_response` parts to history in
    /// this same order, regardless of which call actually finished first.
    #[instrument(skip(self, requests, abort), fields(request_id = %request_id, batch_size = requests.len()))]
    pub async fn schedule(
        &self,
        request_id: &str,
        requests: Vec<ToolCallRequest>,
        abort: &AbortSignal,
    ) -> Vec<ToolCall> {
        let _gate = self.batch_gate.lock().await;

        let mut call_ids = Vec::with_capacity(requests.len());
        for req in &requests {
            let call = ToolCall::new(request_id, req.call_id.clone(), req.name.clone(), req.args.clone());
            call_ids.push(req.call_id.clone());
            self.calls.lock().await.insert(req.call_id.clone(), call);
        }
        self.notify_update().await;

        // A batch runs fully concurrently only if every call in it targets a
        // parallel-safe tool; an unknown tool name is treated as unsafe so an
        // `unknown tool` validation error can never smuggle in unwanted
        // concurrency. One non-parallel-safe call (e.g. a shared shell
        // session) forces the whole batch to run sequentially in request
        // order, since a batch-wide ordering guarantee is the only one the
        // scheduler can make without knowing which other calls a tool
        // considers unsafe to run alongside.
        let all_parallel_safe = requests
            .iter()
            .all(|req| self.registry.find(&req.name).map(|t| t.is_parallel_safe()).unwrap_or(false));

        let (tx, mut rx) = mpsc::channel::<(String, ToolCallStatus)>(requests.len().max(1) * 4);

        // Drain status transitions purely for the advisory `on_tool_calls_update`
        // callback; terminal collection happens once every handle resolves.
        let update_task = {
            let calls_map = self.calls.clone();
            let observer = self.observer.clone();
            tokio::spawn(async move {
                while let Some((call_id, status)) = rx.recv().await {
                    debug!(call_id = %call_id, ?status, "tool call transition");
                    let snapshot: Vec<ToolCall> = calls_map.lock().await.values().cloned().collect();
                    observer.on_tool_calls_update(&snapshot).await;
                }
            })
        };

        if all_parallel_safe {
            let mut handles = Vec::with_capacity(requests.len());
            for req in requests {
                let registry = self.registry.clone();
                let trusted = self.trusted_key_if_present(&req.name, &req.args).await;
                let tx = tx.clone();
                handles.push(self.run_one_call(registry, req, trusted, abort.clone(), tx));
            }
            drop(tx);
            futures::future::join_all(handles).await;
        } else {
            debug!(request_id = %request_id, "batch contains a non-parallel-safe tool; running sequentially");
            for req in requests {
                let registry = self.registry.clone();
                let trusted = self.trusted_key_if_present(&req.name, &req.args).await;
                self.run_one_call(registry, req, trusted, abort.clone(), tx.clone()).await;
            }
            drop(tx);
        }
        let _ = update_task.await;

        let batch = Batch { request_id: request_id.to_string(), call_ids };
        let result = self.finalize_batch(&batch).await;
        self.notify_update().await;
        self.observer.on_all_tool_calls_complete(&result).await;
        result
    }

    async fn notify_update(&self) {
        let snapshot: Vec<ToolCall> = self.calls.lock().await.values().cloned().collect();
        self.observer.on_tool_calls_update(&snapshot).await;
    }

    async fn trusted_key_if_present(&self, name: &str, args: &serde_json::Value) -> Option<String> {
        let key = fingerprint(name, args);
        if self.trusted.lock().await.contains(&key) {
            Some(key)
        } else {
            None
        }
    }

    /// Run `validating -> (scheduled|awaiting_approval|error) -> executing ->
    /// terminal` for one call. Confirmation is awaited via a parked oneshot
    /// channel that `handle_confirmation` resolves.
    async fn run_one_call(
        &self,
        registry: Arc<ToolRegistry>,
        req: ToolCallRequest,
        trusted_key: Option<String>,
        abort: AbortSignal,
        status_tx: mpsc::Sender<(String, ToolCallStatus)>,
    ) {
        let call_id = req.call_id.clone();
        let Some(tool) = registry.find(&req.name) else {
            self.fail(&call_id, format!("unknown tool: {}", req.name), &status_tx).await;
            return;
        };

        if let Err(message) = tool.validate(&req.args) {
            self.fail(&call_id, message, &status_tx).await;
            return;
        }

        let needs_confirmation = if trusted_key.is_some() {
            None
        } else {
            tool.should_confirm(&req.args, &abort).await
        };

        if let Some(details) = needs_confirmation {
            self.transition(&call_id, ToolCallStatus::AwaitingApproval, &status_tx).await;
            if let Some(call) = self.calls.lock().await.get_mut(&call_id) {
                call.confirmation = Some(details);
            }

            let (tx, rx) = oneshot::channel();
            self.parked.lock().await.insert(call_id.clone(), ParkedCall { resume: tx });

            let outcome = tokio::select! {
                outcome = rx => outcome.unwrap_or(ConfirmationOutcome::Cancel),
                _ = wait_for_abort(&abort) => ConfirmationOutcome::Cancel,
            };
            self.parked.lock().await.remove(&call_id);

            let args = match outcome {
                ConfirmationOutcome::Cancel => {
                    self.cancel(&call_id, &status_tx).await;
                    return;
                }
                ConfirmationOutcome::ProceedOnce => req.args.clone(),
                ConfirmationOutcome::ProceedAlways => {
                    self.trusted.lock().await.insert(fingerprint(&req.name, &req.args));
                    req.args.clone()
                }
                ConfirmationOutcome::Modify { new_args } => new_args,
            };
            self.execute(&call_id, tool, args, abort, &status_tx).await;
        } else {
            self.transition(&call_id, ToolCallStatus::Scheduled, &status_tx).await;
            self.execute(&call_id, tool, req.args, abort, &status_tx).await;
        }
    }

    async fn execute(
        &self,
        call_id: &str,
        tool: Arc<dyn FunctionTool>,
        args: serde_json::Value,
        abort: AbortSignal,
        status_tx: &mpsc::Sender<(String, ToolCallStatus)>,
    ) {
        if abort.is_aborted() {
            self.cancel(call_id, status_tx).await;
            return;
        }
        self.transition(call_id, ToolCallStatus::Executing, status_tx).await;

        let result: ToolResult = tool.execute(args, &abort, None).await;

        if abort.is_aborted() {
            self.cancel(call_id, status_tx).await;
            return;
        }

        if let Some(error) = &result.error {
            self.fail(call_id, error.clone(), status_tx).await;
        } else {
            if let Some(call) = self.calls.lock().await.get_mut(call_id) {
                call.result = Some(result.llm_content.clone());
                call.return_display = result.return_display.clone();
                call.transition(ToolCallStatus::Success);
            }
            let _ = status_tx.send((call_id.to_string(), ToolCallStatus::Success)).await;
        }
    }

    async fn transition(&self, call_id: &str, next: ToolCallStatus, status_tx: &mpsc::Sender<(String, ToolCallStatus)>) {
        if let Some(call) = self.calls.lock().await.get_mut(call_id) {
            call.transition(next);
        }
        let _ = status_tx.send((call_id.to_string(), next)).await;
    }

    async fn fail(&self, call_id: &str, message: String, status_tx: &mpsc::Sender<(String, ToolCallStatus)>) {
        if let Some(call) = self.calls.lock().await.get_mut(call_id) {
            call.error = Some(message);
            // Validation failures may still be in `Validating`; route through
            // the one legal edge to `Error` from wherever we are.
            if call.status == ToolCallStatus::Validating
                || call.status == ToolCallStatus::Scheduled
                || call.status == ToolCallStatus::Executing
            {
                call.transition(ToolCallStatus::Error);
            }
        }
        let _ = status_tx.send((call_id.to_string(), ToolCallStatus::Error)).await;
    }

    async fn cancel(&self, call_id: &str, status_tx: &mpsc::Sender<(String, ToolCallStatus)>) {
        if let Some(call) = self.calls.lock().await.get_mut(call_id) {
            if call.status == ToolCallStatus::AwaitingApproval || call.status == ToolCallStatus::Executing {
                call.transition(ToolCallStatus::Cancelled);
            }
        }
        let _ = status_tx.send((call_id.to_string(), ToolCallStatus::Cancelled)).await;
    }

    async fn finalize_batch(&self, batch: &Batch) -> Vec<ToolCall> {
        let calls = self.calls.lock().await;
        batch
            .call_ids
            .iter()
            .filter_map(|id| calls.get(id).cloned())
            .inspect(|c| {
                if !c.status.is_terminal() {
                    warn!(call_id = %c.call_id, request_id = %batch.request_id, "batch finalized with non-terminal call");
                }
            })
            .collect()
    }

    /// Resolve a parked confirmation. No-op if `call_id` is not currently
    /// awaiting approval (e.g. it was already cancelled by abort).
    #[instrument(skip(self, outcome))]
    pub async fn handle_confirmation(&self, call_id: &str, outcome: ConfirmationOutcome) {
        if let Some(parked) = self.parked.lock().await.remove(call_id) {
            let _ = parked.resume.send(outcome);
        } else {
            info!(call_id = %call_id, "confirmation arrived for a call no longer parked");
        }
    }

    /// Cancel every currently in-flight call. The per-call `abort` each
    /// `execute`/confirmation-wait observes is the session's signal, so
    /// calling `abort.abort()` before this is what actually unwinds them;
    /// this additionally resolves any parked confirmations as `cancel` so
    /// they do not hang forever.
    pub async fn cancel_all(&self, _abort: &AbortSignal) {
        let parked: Vec<String> = self.parked.lock().await.keys().cloned().collect();
        for call_id in parked {
            self.handle_confirmation(&call_id, ConfirmationOutcome::Cancel).await;
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
