//! Semantic classifier: asks an LLM to pick one label for a message.
//!
//! The adapter owns every failure mode of the remote call: it bounds each
//! request with a timeout, retries transient failures with jittered backoff,
//! truncates oversized input, and validates the reply. Callers only ever see a
//! `Classification` or `ClassifierError::Unavailable`.
//!
//! A query may also name parameters for the model to extract from the
//! message (an order number, a due date, a drafted reply). They come back in
//! `Classification::params` and feed reply templates and webhook payloads.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ClassifierError, LlmError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::retry::Backoff;

/// Appended to input that was cut at `max_input_chars`.
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

const CLASSIFY_MAX_TOKENS: u32 = 128;
/// Extracted parameters can hold drafted text, so they get more room.
const EXTRACT_MAX_TOKENS: u32 = 1024;
const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// Result of one classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// One of the requested labels, in the caller's spelling.
    pub label: String,
    /// Model confidence, clamped to [0, 1].
    pub confidence: f32,
    /// `confidence >= threshold` for the threshold the call was made with.
    pub confident: bool,
    /// Values for the requested parameters the model could fill in.
    #[serde(default)]
    pub params: ExtractedParams,
}

/// Parameter name to extracted value.
pub type ExtractedParams = BTreeMap<String, String>;

/// What a semantic predicate asks of the classifier.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyQuery<'a> {
    pub labels: &'a [String],
    pub threshold: f32,
    /// Extra guidance for the model (what each label means for this rule).
    pub instructions: Option<&'a str>,
    /// Parameters to extract, name to description.
    pub extract: &'a BTreeMap<String, String>,
}

impl<'a> ClassifyQuery<'a> {
    pub fn new(labels: &'a [String], threshold: f32) -> Self {
        static NONE: BTreeMap<String, String> = BTreeMap::new();
        Self {
            labels,
            threshold,
            instructions: None,
            extract: &NONE,
        }
    }
}

impl Classification {
    /// Whether this result selects `expected` at `threshold`.
    pub fn selects(&self, expected: &str, threshold: f32) -> bool {
        self.label.eq_ignore_ascii_case(expected) && self.confidence >= threshold
    }
}

/// Something that can label text.
#[async_trait]
pub trait SemanticClassifier: Send + Sync {
    /// Pick one of `query.labels` for `text` and extract `query.extract`.
    async fn classify(
        &self,
        text: &str,
        query: &ClassifyQuery<'_>,
    ) -> Result<Classification, ClassifierError>;
}

/// Classifier tuning.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub request_timeout: Duration,
    /// Retry schedule; `max_attempts` counts the first call.
    pub backoff: Backoff,
    pub max_input_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 4),
            max_input_chars: 8000,
        }
    }
}

impl ClassifierConfig {
    /// Build from a retry count (attempts after the first).
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.backoff.max_attempts = max_retries + 1;
        self
    }
}

/// `SemanticClassifier` backed by an `LlmProvider`.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
    config: ClassifierConfig,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, config: ClassifierConfig) -> Self {
        Self { llm, config }
    }
}

#[async_trait]
impl SemanticClassifier for LlmClassifier {
    async fn classify(
        &self,
        text: &str,
        query: &ClassifyQuery<'_>,
    ) -> Result<Classification, ClassifierError> {
        if query.labels.is_empty() {
            return Err(ClassifierError::NoLabels);
        }

        let input = truncate_input(text, self.config.max_input_chars);
        let max_tokens = if query.extract.is_empty() {
            CLASSIFY_MAX_TOKENS
        } else {
            EXTRACT_MAX_TOKENS
        };
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt(query)),
            ChatMessage::user(input),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(max_tokens);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let (reason, retryable) = match tokio::time::timeout(
                self.config.request_timeout,
                self.llm.complete(request.clone()),
            )
            .await
            {
                Ok(Ok(response)) => match parse_classification(&response.content, query) {
                    Ok(classification) => {
                        debug!(
                            model = %self.llm.model_name(),
                            label = %classification.label,
                            confidence = classification.confidence,
                            params = classification.params.len(),
                            attempt,
                            "Classified message"
                        );
                        return Ok(classification);
                    }
                    Err(e) => {
                        warn!(raw_response = %response.content, error = %e, "Invalid classifier reply");
                        (format!("invalid reply: {e}"), true)
                    }
                },
                Ok(Err(e)) => {
                    let retryable = e.is_transient();
                    (e.to_string(), retryable)
                }
                Err(_) => (
                    LlmError::Timeout {
                        provider: self.llm.model_name().to_string(),
                        timeout: self.config.request_timeout,
                    }
                    .to_string(),
                    true,
                ),
            };

            if !retryable || !self.config.backoff.should_retry(attempt) {
                return Err(ClassifierError::Unavailable {
                    attempts: attempt,
                    reason,
                });
            }

            let delay = self.config.backoff.delay(attempt);
            warn!(attempt, ?delay, error = %reason, "Classifier call failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_input(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

fn build_system_prompt(query: &ClassifyQuery<'_>) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str(
        "You are an email classifier. Read the message and choose exactly one label \
         from the list below.\n\nLabels:\n",
    );
    for label in query.labels {
        prompt.push_str(&format!("- {label}\n"));
    }
    if let Some(extra) = query.instructions.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("\nGuidance:\n{extra}\n"));
    }

    if query.extract.is_empty() {
        prompt.push_str(
            "\nRespond with ONLY a JSON object:\n\
             {\"label\": \"...\", \"confidence\": 0.0}\n",
        );
    } else {
        prompt.push_str("\nAlso extract these parameters from the message:\n");
        for (name, description) in query.extract {
            prompt.push_str(&format!("- {name}: {description}\n"));
        }
        prompt.push_str(
            "A parameter may ask you to write text, such as a reply; write it. \
             Use an empty string for a parameter the message does not provide.\n\
             \nRespond with ONLY a JSON object:\n\
             {\"label\": \"...\", \"confidence\": 0.0, \"params\": {\"name\": \"value\"}}\n",
        );
    }
    prompt.push_str(
        "\nconfidence is your certainty between 0.0 and 1.0. \
         The label must be copied exactly from the list.",
    );
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassifierReply {
    label: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    params: BTreeMap<String, serde_json::Value>,
}

fn parse_classification(raw: &str, query: &ClassifyQuery<'_>) -> Result<Classification, String> {
    let json_str = extract_json_object(raw);
    let reply: ClassifierReply =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let label = query
        .labels
        .iter()
        .find(|l| l.eq_ignore_ascii_case(reply.label.trim()))
        .ok_or_else(|| format!("label '{}' is not one of the requested labels", reply.label))?;

    let confidence = if reply.confidence.is_nan() {
        0.0
    } else {
        reply.confidence.clamp(0.0, 1.0)
    };

    Ok(Classification {
        label: label.clone(),
        confidence,
        confident: confidence >= query.threshold,
        params: requested_params(reply.params, query.extract),
    })
}

/// Keep only requested, non-empty parameters, rendering non-string values as
/// JSON text.
fn requested_params(
    reply: BTreeMap<String, serde_json::Value>,
    requested: &BTreeMap<String, String>,
) -> ExtractedParams {
    reply
        .into_iter()
        .filter(|(name, _)| requested.contains_key(name))
        .filter_map(|(name, value)| {
            let value = match value {
                serde_json::Value::Null => return None,
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            let value = value.trim().to_string();
            (!value.is_empty()).then_some((name, value))
        })
        .collect()
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
