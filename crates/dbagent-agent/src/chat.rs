//! Append-only conversation history with a curated view and AI-summary
//! compression.
//!
//! Compression retries with backoff, then splices a summary back in
//! ("append a compaction prompt, call the provider, splice the result back
//! in"). Once a synthetic summary content exists, everything before it is
//! dead weight that curation/compression never revisits again.

use dbagent_core::content::{synthesize_pending_response, Content, Part, Role};
use dbagent_core::error::AgentError;
use dbagent_core::provider::ModelProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Prefix marking a synthetic compaction summary.
pub const COMPACTION_PREFIX: &str = "[prior-context-summary]";

const COMPACTION_PROMPT: &str = "Summarize the conversation so far objectively: the entities \
involved, decisions made, and any open questions. This summary will replace the older portion \
of the conversation history, so be complete but concise.";

/// How compression decides when and where to cut.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Fraction of `context_budget_tokens` that triggers compression.
    pub threshold_fraction: f64,
    pub context_budget_tokens: usize,
    /// Number of most recent turns (including the current user turn) kept
    /// intact, never summarized (default 6).
    pub keep_recent_turns: usize,
    pub retry: RetryConfig,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_fraction: 0.7,
            context_budget_tokens: 128_000,
            keep_recent_turns: 6,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Pluggable token estimator: no tokenizer is consistent across providers,
/// so the estimator is swappable rather than hardcoded.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
    fn estimate_content(&self, content: &Content) -> usize {
        content.parts.iter().map(|p| self.estimate_part(p)).sum()
    }
    fn estimate_part(&self, part: &Part) -> usize {
        match part {
            Part::Text { text } => self.estimate(text),
            Part::FunctionCall { args, .. } => self.estimate(&args.to_string()),
            Part::FunctionResponse { response, .. } => self.estimate(&response.to_string()),
        }
    }
}

/// `len / 4` heuristic, a reasonable order-of-magnitude default.
pub struct SimpleTokenEstimator;

impl TokenEstimator for SimpleTokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

/// Result of one compression pass, for the `ChatCompressed` event.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Append-only conversation record plus its curated derivative.
pub struct Chat {
    comprehensive: Vec<Content>,
    estimator: Arc<dyn TokenEstimator>,
    /// Index into `comprehensive` of the most recent compaction summary, if
    /// any. Curation and compression both treat everything before it as
    /// already folded in, which is what makes back-to-back compression a
    /// no-op.
    last_compaction_index: Option<usize>,
}

impl Chat {
    pub fn new() -> Self {
        Self {
            comprehensive: Vec::new(),
            estimator: Arc::new(SimpleTokenEstimator),
            last_compaction_index: None,
        }
    }

    pub fn with_estimator(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            comprehensive: Vec::new(),
            estimator,
            last_compaction_index: None,
        }
    }

    pub fn add(&mut self, content: Content) {
        self.comprehensive.push(content);
    }

    pub fn clear(&mut self) {
        self.comprehensive.clear();
        self.last_compaction_index = None;
    }

    pub fn replace(&mut self, new_history: Vec<Content>) {
        self.comprehensive = new_history;
        self.last_compaction_index = None;
    }

    /// Every `Content` ever appended.
    pub fn comprehensive(&self) -> &[Content] {
        &self.comprehensive
    }

    /// Comprehensive minus consecutive invalid model turns, reconciling any
    /// orphaned `function_call` with a synthesized `function_response`.
    /// Idempotent and order-preserving: curation removes, never reorders.
    #[instrument(skip(self))]
    pub fn curated(&self) -> Vec<Content> {
        let effective = self.effective_slice();
        let mut out: Vec<Content> = Vec::with_capacity(effective.len());
        let mut responses: std::collections::HashMap<&str, &serde_json::Value> = std::collections::HashMap::new();

        for content in effective {
            for part in &content.parts {
                if let Part::FunctionResponse { id, response, .. } = part {
                    responses.insert(id.as_str(), response);
                }
            }
        }

        let mut dropped_call_ids: std::collections::HashSet<&str> = std::collections::HashSet::new();

        for content in effective {
            if content.role == Role::Model {
                if content.is_empty() {
                    continue;
                }
                let has_text = content.parts.iter().any(|p| p.as_text().is_some());
                let call_ids: Vec<&str> = content
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::FunctionCall { id, .. } => Some(id.as_str()),
                        _ => None,
                    })
                    .collect();
                let only_calls = !call_ids.is_empty() && !has_text && call_ids.len() == content.parts.len();
                if only_calls && call_ids.iter().all(|id| responses.get(id).is_some_and(|r| is_cancelled_placeholder(r))) {
                    dropped_call_ids.extend(call_ids);
                    continue;
                }
            }
            out.push(content.clone());
        }

        // Drop the now-orphaned placeholder responses that paired with a
        // dropped model turn; a tool turn left with no parts is itself invalid.
        if !dropped_call_ids.is_empty() {
            out.retain_mut(|content| {
                if content.role != Role::Tool {
                    return true;
                }
                content.parts.retain(|p| !matches!(p, Part::FunctionResponse { id, .. } if dropped_call_ids.contains(id.as_str())));
                !content.parts.is_empty()
            });
        }

        // Reconcile any function_call in the curated view with no later
        // function_response: synthesize a placeholder so providers that
        // require strict pairing never see an orphan.
        let mut reconciled = Vec::with_capacity(out.len());
        for (idx, content) in out.iter().enumerate() {
            reconciled.push(content.clone());
            if content.role != Role::Model {
                continue;
            }
            for part in &content.parts {
                if let Part::FunctionCall { id, name, .. } = part {
                    let paired_later = out[idx + 1..].iter().any(|later| {
                        later.parts.iter().any(|p| matches!(p, Part::FunctionResponse { id: rid, .. } if rid == id))
                    });
                    if !paired_later {
                        reconciled.push(Content::tool(vec![synthesize_pending_response(id, name)]));
                    }
                }
            }
        }
        reconciled
    }

    fn effective_slice(&self) -> &[Content] {
        match self.last_compaction_index {
            Some(idx) => &self.comprehensive[idx..],
            None => &self.comprehensive,
        }
    }

    fn estimate_tokens(&self, contents: &[Content]) -> usize {
        contents.iter().map(|c| self.estimator.estimate_content(c)).sum()
    }

    pub fn estimated_curated_tokens(&self) -> usize {
        self.estimate_tokens(&self.curated())
    }

    /// Whether the curated history exceeds `threshold_fraction *
    /// context_budget_tokens` and compression should run.
    pub fn needs_compression(&self, config: &CompressionConfig) -> bool {
        let threshold = (config.context_budget_tokens as f64 * config.threshold_fraction) as usize;
        self.estimated_curated_tokens() > threshold
    }

    /// Run the compression pipeline: split, summarize via `provider`, splice
    /// the summary in as a synthetic `user` content.
    ///
    /// Idempotent for one turn: if the most recent content is already a
    /// compaction summary, this is a no-op — the summary itself is exempt
    /// from re-summarization until a new turn is appended.
    #[instrument(skip(self, provider, config))]
    pub async fn compress(
        &mut self,
        provider: &dyn ModelProvider,
        config: &CompressionConfig,
    ) -> Result<Option<CompressionOutcome>, AgentError> {
        let curated = self.curated();
        if curated.len() <= config.keep_recent_turns {
            debug!("history too short to compress, skipping");
            return Ok(None);
        }
        if curated
            .first()
            .map(|c| c.text().starts_with(COMPACTION_PREFIX))
            .unwrap_or(false)
        {
            debug!("curated view already opens with a compaction summary, skipping (idempotent compression)");
            return Ok(None);
        }

        let tokens_before = self.estimate_tokens(&curated);
        let split_at = curated.len().saturating_sub(config.keep_recent_turns);
        let (old_prefix, recent_suffix) = curated.split_at(split_at);
        if old_prefix.is_empty() {
            return Ok(None);
        }

        let mut summarize_prompt = old_prefix.to_vec();
        summarize_prompt.push(Content::user(COMPACTION_PROMPT));

        let summary = self.call_with_retry(provider, summarize_prompt, &config.retry).await?;

        let mut new_comprehensive = Vec::with_capacity(recent_suffix.len() + 1);
        new_comprehensive.push(Content::user(format!("{COMPACTION_PREFIX} {summary}")));
        new_comprehensive.extend_from_slice(recent_suffix);

        let tokens_after = self.estimate_tokens(&new_comprehensive);
        let summary_index = self.comprehensive.len();
        self.comprehensive.extend(new_comprehensive);
        self.last_compaction_index = Some(summary_index);

        Ok(Some(CompressionOutcome { tokens_before, tokens_after }))
    }

    async fn call_with_retry(
        &self,
        provider: &dyn ModelProvider,
        prompt: Vec<Content>,
        retry: &RetryConfig,
    ) -> Result<String, AgentError> {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "summary": { "type": "string" } },
            "required": ["summary"],
        });

        let mut backoff_ms = retry.initial_backoff_ms;
        let mut last_err = None;
        for attempt in 0..=retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms as f64 * retry.backoff_multiplier) as u64;
            }
            match provider.generate_json(prompt.clone(), schema.clone()).await {
                Ok(value) => {
                    if let Some(summary) = value.get("summary").and_then(|s| s.as_str()) {
                        return Ok(summary.to_string());
                    }
                    return Ok(value.to_string());
                }
                Err(e) => {
                    warn!("compaction summary call failed (attempt {attempt}): {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| AgentError::Internal("compaction failed with no recorded error".into())))
    }
}

impl Default for Chat {
    fn default() -> Self {
        Self::new()
    }
}

/// True if `response` is the placeholder `synthesize_pending_response` shape
/// rather than a real tool result — a cancelled or never-executed call with
/// no useful output.
fn is_cancelled_placeholder(response: &serde_json::Value) -> bool {
    match synthesize_pending_response("", "") {
        Part::FunctionResponse { response: placeholder, .. } => response == &placeholder,
        _ => false,
    }
}
