//! Next-Speaker Arbiter: a small structured JSON call that decides whether
//! the model should keep talking or hand control back to the user. The
//! decision-rule prompt is a short fixed prompt, not a tunable.

use dbagent_core::content::Content;
use dbagent_core::error::AgentError;
use dbagent_core::provider::ModelProvider;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextSpeaker {
    User,
    Model,
}

#[derive(Debug, Clone)]
pub struct NextSpeakerDecision {
    pub next_speaker: NextSpeaker,
    pub reasoning: String,
}

const ARBITER_PROMPT: &str = "Decide who should speak next in this conversation. Respond only with \
the required JSON object. Rules: if the previous assistant message ended mid-plan (e.g. it said \
something like \"next I will...\" without finishing), the next speaker is the model. If the previous \
assistant message asked the user a question, the next speaker is the user. If the task appears \
complete and the assistant is awaiting new input, the next speaker is the user.";

fn schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "next_speaker": { "type": "string", "enum": ["user", "model"] },
            "reasoning": { "type": "string" },
        },
        "required": ["next_speaker", "reasoning"],
    })
}

/// Ask `provider` who should speak next given `history` (typically the
/// curated Chat view). Defaults to `user` on a malformed response rather
/// than looping the model indefinitely on an arbiter parse failure.
pub async fn decide_next_speaker(history: &[Content], provider: &dyn ModelProvider) -> Result<NextSpeakerDecision, AgentError> {
    let mut prompt = history.to_vec();
    prompt.push(Content::user(ARBITER_PROMPT));

    let value = provider.generate_json(prompt, schema()).await?;

    let next_speaker = match value.get("next_speaker").and_then(|v| v.as_str()) {
        Some("model") => NextSpeaker::Model,
        _ => NextSpeaker::User,
    };
    let reasoning = value
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or("no reasoning provided")
        .to_string();

    Ok(NextSpeakerDecision { next_speaker, reasoning })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dbagent_core::provider::StreamChunk;
    use dbagent_core::tool::ToolSpec;
    use futures::stream::BoxStream;
    use serde_json::Value;

    struct StubProvider {
        response: Value,
    }

    #[async_trait]
    impl ModelProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }
        fn model(&self) -> &str {
            "stub-model"
        }
        async fn send_message_stream(
            &self,
            _history: Vec<Content>,
            _tools: Vec<ToolSpec>,
            _system_instruction: Option<&str>,
        ) -> Result<BoxStream<'static, Result<StreamChunk, AgentError>>, AgentError> {
            unimplemented!()
        }
        async fn generate_json(&self, _prompt: Vec<Content>, _schema: Value) -> Result<Value, AgentError> {
            Ok(self.response.clone())
        }
    }

    #[tokio::test]
    async fn model_decision_is_parsed() {
        let provider = StubProvider {
            response: serde_json::json!({"next_speaker": "model", "reasoning": "mid-plan"}),
        };
        let decision = decide_next_speaker(&[Content::user("hi")], &provider).await.unwrap();
        assert_eq!(decision.next_speaker, NextSpeaker::Model);
    }

    #[tokio::test]
    async fn malformed_response_defaults_to_user() {
        let provider = StubProvider {
            response: serde_json::json!({"reasoning": "no next_speaker key"}),
        };
        let decision = decide_next_speaker(&[Content::user("hi")], &provider).await.unwrap();
        assert_eq!(decision.next_speaker, NextSpeaker::User);
    }
}
