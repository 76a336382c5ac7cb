//! Mailbox watcher: surfaces new messages of one folder in UID order.
//!
//! The watcher holds no global "last seen" state: the caller passes the
//! current `Watermark` into `poll` and advances it as messages are handled.
//! The watermark itself is persisted in the ledger store, so a reconnect or
//! restart resumes exactly after the last handled UID.

use tracing::{debug, info, warn};

use crate::error::MailboxError;
use crate::mailbox::types::{Message, MessageId, Watermark};
use crate::mailbox::{MailboxClient, MailboxOps, SelectInfo, WaitOutcome};
use crate::retry::Backoff;

/// Default maximum number of messages fetched per poll.
const DEFAULT_BATCH_SIZE: usize = 50;

/// Watcher behaviour knobs.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// On first run, process existing mail instead of only new arrivals.
    pub backfill: bool,
    /// Maximum messages fetched per poll; the rest come on the next poll.
    pub batch_size: usize,
    /// Reconnect schedule; `max_attempts` bounds consecutive failures.
    pub reconnect: Backoff,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            backfill: false,
            batch_size: DEFAULT_BATCH_SIZE,
            reconnect: Backoff::new(
                std::time::Duration::from_secs(2),
                std::time::Duration::from_secs(300),
                8,
            ),
        }
    }
}

/// One entry of a poll batch.
#[derive(Debug, Clone)]
pub enum Polled {
    Message(Message),
    /// Listed by the server but could not be fetched or decoded.
    Unreadable { id: MessageId, reason: String },
    /// Expunged between the UID listing and the fetch.
    Vanished { id: MessageId },
}

impl Polled {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Message(m) => m.id,
            Self::Unreadable { id, .. } | Self::Vanished { id } => *id,
        }
    }
}

/// Pick the starting watermark after SELECT.
///
/// A stored watermark is only trusted when its UIDVALIDITY still matches.
pub fn resolve_watermark(
    mailbox: &str,
    stored: Option<Watermark>,
    info: SelectInfo,
    backfill: bool,
) -> Watermark {
    let fresh_start = Watermark::new(info.uid_validity, info.uid_next.saturating_sub(1));
    match stored {
        Some(wm) if wm.uid_validity == info.uid_validity => wm,
        Some(wm) => {
            warn!(
                mailbox = %mailbox,
                old_validity = wm.uid_validity,
                new_validity = info.uid_validity,
                "UIDVALIDITY changed; restarting from the current end of the mailbox"
            );
            fresh_start
        }
        None if backfill => Watermark::new(info.uid_validity, 0),
        None => fresh_start,
    }
}

/// Watches one mailbox folder.
pub struct MailboxWatcher {
    client: Box<dyn MailboxClient>,
    config: WatcherConfig,
    connected: bool,
}

impl MailboxWatcher {
    pub fn new(client: Box<dyn MailboxClient>, config: WatcherConfig) -> Self {
        Self {
            client,
            config,
            connected: false,
        }
    }

    pub fn mailbox(&self) -> &str {
        self.client.mailbox()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn reconnect_backoff(&self) -> Backoff {
        self.config.reconnect
    }

    /// Connect and decide where to resume.
    pub async fn connect(&mut self, stored: Option<Watermark>) -> Result<Watermark, MailboxError> {
        self.connected = false;
        let info = self.client.connect().await?;
        self.connected = true;
        let wm = resolve_watermark(self.client.mailbox(), stored, info, self.config.backfill);
        info!(
            mailbox = %self.client.mailbox(),
            uid_validity = wm.uid_validity,
            last_uid = wm.last_uid,
            "Watching mailbox"
        );
        Ok(wm)
    }

    /// Fetch messages with UID above the watermark, ascending, at most one batch.
    pub async fn poll(&mut self, watermark: Watermark) -> Result<Vec<Polled>, MailboxError> {
        let result = self.poll_inner(watermark).await;
        self.note_result(&result);
        result
    }

    async fn poll_inner(&mut self, watermark: Watermark) -> Result<Vec<Polled>, MailboxError> {
        let mut uids = self.client.uids_after(watermark.last_uid).await?;
        uids.truncate(self.config.batch_size);
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        debug!(mailbox = %self.client.mailbox(), count = uids.len(), "New UIDs listed");

        let mut batch = Vec::with_capacity(uids.len());
        for uid in uids {
            let id = MessageId::new(watermark.uid_validity, uid);
            match self.client.fetch(uid).await {
                Ok(Some(message)) => batch.push(Polled::Message(message)),
                Ok(None) => {
                    info!(mailbox = %self.client.mailbox(), uid, "Message expunged before fetch");
                    batch.push(Polled::Vanished { id });
                }
                Err(e @ MailboxError::Transport { .. }) | Err(e @ MailboxError::Auth { .. }) => {
                    return Err(e);
                }
                Err(e) => batch.push(Polled::Unreadable {
                    id,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(batch)
    }

    /// Whether a poll that returned `len` entries may have left more behind.
    pub fn batch_was_full(&self, len: usize) -> bool {
        len >= self.config.batch_size
    }

    /// Re-fetch a single message (used for retrying failed rules).
    pub async fn fetch(&mut self, uid: u32) -> Result<Option<Message>, MailboxError> {
        let result = self.client.fetch(uid).await;
        self.note_result(&result);
        result
    }

    /// Suspend until new mail or timeout.
    pub async fn wait(&mut self) -> Result<WaitOutcome, MailboxError> {
        let result = self.client.wait_for_change().await;
        self.note_result(&result);
        result
    }

    pub fn ops(&mut self) -> &mut dyn MailboxOps {
        self.client.ops()
    }

    pub async fn disconnect(&mut self) {
        self.client.disconnect().await;
        self.connected = false;
    }

    fn note_result<T>(&mut self, result: &Result<T, MailboxError>) {
        if let Err(e) = result
            && (e.is_retryable() || e.is_fatal())
        {
            self.connected = false;
        }
    }
}
