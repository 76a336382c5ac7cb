//! Error types for mail-trigger.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ledger storage errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mailbox (IMAP) errors.
///
/// `Auth` is fatal for the mailbox session. `Transport` is retryable.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Authentication failed for mailbox {mailbox}: {reason}")]
    Auth { mailbox: String, reason: String },

    #[error("Transport error on mailbox {mailbox}: {reason}")]
    Transport { mailbox: String, reason: String },

    #[error("Server rejected {command} on mailbox {mailbox}: {reason}")]
    Rejected {
        mailbox: String,
        command: String,
        reason: String,
    },

    #[error("Message {uid} in mailbox {mailbox} could not be parsed")]
    Unparseable { mailbox: String, uid: u32 },

    /// The caller stopped waiting; the session is intact.
    #[error("Operation on mailbox {mailbox} was abandoned")]
    Cancelled { mailbox: String },
}

impl MailboxError {
    /// Whether reconnecting may fix this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

impl LlmError {
    /// Transient failures are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::Timeout { .. }
        )
    }
}

/// Semantic classifier errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("Classifier called with an empty label set")]
    NoLabels,
}

/// A single action's failure.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Action {kind} failed: {reason}")]
    Failed { kind: String, reason: String },

    #[error("Action {kind} timed out after {timeout:?}")]
    Timeout { kind: String, timeout: Duration },

    #[error("Action {kind} is not supported by this dispatcher")]
    Unsupported { kind: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_error_classification() {
        let auth = MailboxError::Auth {
            mailbox: "INBOX".into(),
            reason: "bad password".into(),
        };
        let transport = MailboxError::Transport {
            mailbox: "INBOX".into(),
            reason: "reset by peer".into(),
        };
        assert!(auth.is_fatal());
        assert!(!auth.is_retryable());
        assert!(transport.is_retryable());
        assert!(!transport.is_fatal());
    }

    #[test]
    fn llm_error_transience() {
        assert!(
            LlmError::RateLimited {
                provider: "anthropic".into(),
                retry_after: None,
            }
            .is_transient()
        );
        assert!(
            !LlmError::AuthFailed {
                provider: "anthropic".into(),
            }
            .is_transient()
        );
    }

    #[test]
    fn top_level_wraps_subsystems() {
        let err: Error = ClassifierError::NoLabels.into();
        assert!(err.to_string().starts_with("Classifier error"));
    }
}
