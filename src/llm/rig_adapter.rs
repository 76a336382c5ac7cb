//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{Chat, CompletionModel, Message as RigMessage};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role,
};

/// `LlmProvider` backed by any rig completion model.
pub struct RigAdapter<M: CompletionModel> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }

    fn map_error(&self, err: impl std::fmt::Display) -> LlmError {
        classify_error(self.provider, &err.to_string())
    }
}

/// Map a rig error message onto our taxonomy.
///
/// rig surfaces provider failures as strings, so the status is sniffed from
/// the text.
fn classify_error(provider: &str, text: &str) -> LlmError {
    let lower = text.to_lowercase();
    if lower.contains("401") || lower.contains("403") || lower.contains("authentication") {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("overloaded")
    {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: text.to_string(),
        }
    }
}

/// Split a request into (history, prompt). The prompt is the final user turn.
fn split_turns(messages: &[ChatMessage]) -> Option<(Vec<RigMessage>, String)> {
    let mut turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();
    let last = turns.pop()?;
    if last.role != Role::User {
        return None;
    }
    let history = turns
        .into_iter()
        .map(|m| match m.role {
            Role::Assistant => RigMessage::assistant(m.content.clone()),
            _ => RigMessage::user(m.content.clone()),
        })
        .collect();
    Some((history, last.content.clone()))
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Clone + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (history, prompt) =
            split_turns(&request.messages).ok_or_else(|| LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason: "request must end with a user message".to_string(),
            })?;

        let mut builder = AgentBuilder::new(self.model.clone());
        if let Some(system) = request.system_prompt() {
            builder = builder.preamble(&system);
        }
        if let Some(t) = request.temperature {
            builder = builder.temperature(f64::from(t));
        }
        if let Some(n) = request.max_tokens {
            builder = builder.max_tokens(u64::from(n));
        }
        let agent = builder.build();

        let content = agent
            .chat(prompt.as_str(), history)
            .await
            .map_err(|e| self.map_error(e))?;

        Ok(CompletionResponse { content })
    }
}
