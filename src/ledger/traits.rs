//! `Ledger` trait: the engine's only persistent state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::llm::ExtractedParams;
use crate::mailbox::{Message, MessageId, Watermark};

/// Rule id used for dead letters of messages that could not be read at all.
pub const UNREADABLE_RULE: &str = "*";

/// One failed dispatch of a (message, rule) pair, as handed to the ledger.
#[derive(Debug, Clone, Copy)]
pub struct FailedDispatch<'a> {
    /// The message as it was matched. Kept so a retry works after a `Move`.
    pub message: &'a Message,
    pub rule_id: &'a str,
    pub label: Option<&'a str>,
    pub params: &'a ExtractedParams,
    /// Action indexes that have succeeded across every attempt so far.
    pub completed: &'a [usize],
    pub error: &'a str,
}

/// A (message, rule) pair that failed and will be retried.
#[derive(Debug, Clone)]
pub struct PendingRetry {
    pub message_id: MessageId,
    pub rule_id: String,
    pub attempts: u32,
    pub last_error: String,
    /// Semantic label that selected the rule when it first matched.
    pub label: Option<String>,
    pub params: ExtractedParams,
    /// Actions not to run again.
    pub completed: Vec<usize>,
    /// Snapshot taken when the pair first failed.
    pub message: Option<Message>,
}

/// A (message, rule) pair that was given up on.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub mailbox: String,
    pub message_id: MessageId,
    pub rule_id: String,
    pub reason: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Durable dedup, retry and watermark store, partitioned by mailbox name.
#[async_trait]
pub trait Ledger: Send + Sync {
    // ── Match records ───────────────────────────────────────────────

    /// Whether the rule already fired for the message.
    async fn has_fired(
        &self,
        mailbox: &str,
        message_id: MessageId,
        rule_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// Record a successful firing. Idempotent: a second call is a no-op.
    async fn record(
        &self,
        mailbox: &str,
        message_id: MessageId,
        rule_id: &str,
    ) -> Result<(), DatabaseError>;

    // ── Attempts & dead letters ─────────────────────────────────────

    /// Count a failed dispatch and return the attempt total so far.
    ///
    /// The snapshot, label and params of the first failure are kept; the
    /// completed set and error are replaced by the latest.
    async fn record_failure(
        &self,
        mailbox: &str,
        failure: &FailedDispatch<'_>,
    ) -> Result<u32, DatabaseError>;

    /// Forget the attempt counter for a pair.
    async fn clear_attempts(
        &self,
        mailbox: &str,
        message_id: MessageId,
        rule_id: &str,
    ) -> Result<(), DatabaseError>;

    /// Failed pairs awaiting retry, oldest message first.
    async fn pending_retries(&self, mailbox: &str) -> Result<Vec<PendingRetry>, DatabaseError>;

    /// Give up on a pair. Clears its attempt counter. Idempotent.
    async fn dead_letter(
        &self,
        mailbox: &str,
        message_id: MessageId,
        rule_id: &str,
        reason: &str,
    ) -> Result<(), DatabaseError>;

    async fn is_dead_lettered(
        &self,
        mailbox: &str,
        message_id: MessageId,
        rule_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// Dead letters, optionally for one mailbox, newest first.
    async fn list_dead_letters(&self, mailbox: Option<&str>)
    -> Result<Vec<DeadLetter>, DatabaseError>;

    // ── Watermarks ──────────────────────────────────────────────────

    async fn load_watermark(&self, mailbox: &str) -> Result<Option<Watermark>, DatabaseError>;

    async fn save_watermark(&self, mailbox: &str, watermark: Watermark)
    -> Result<(), DatabaseError>;
}
