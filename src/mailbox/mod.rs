//! Mailbox access: the IMAP client, the message model, and the watcher
//! that turns a folder into an ordered stream of new messages.

pub mod imap;
pub mod types;
pub mod watcher;

pub use imap::{ImapCredentials, ImapMailbox, ImapTimeouts};
pub use types::{Message, MessageId, Watermark};
pub use watcher::{MailboxWatcher, Polled, WatcherConfig};

use async_trait::async_trait;

use crate::error::MailboxError;

/// Folder state reported by SELECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectInfo {
    pub uid_validity: u32,
    pub uid_next: u32,
}

/// Result of waiting for mailbox activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The server reported new messages.
    Changed,
    /// The wait elapsed with no news. Not an error.
    Timeout,
}

/// Mailbox-side mutations used by `Move` and `Tag` actions.
#[async_trait]
pub trait MailboxOps: Send {
    /// Move a message to another folder. Already-moved counts as success.
    async fn move_message(&mut self, uid: u32, folder: &str) -> Result<(), MailboxError>;

    /// Add a keyword flag to a message. Idempotent.
    async fn add_keyword(&mut self, uid: u32, keyword: &str) -> Result<(), MailboxError>;
}

/// An ordered message source for one folder.
///
/// Implemented by `ImapMailbox`; tests provide in-memory fakes.
#[async_trait]
pub trait MailboxClient: MailboxOps {
    /// Folder name this client is bound to.
    fn mailbox(&self) -> &str;

    /// (Re)establish the session and select the folder.
    ///
    /// Fails with `MailboxError::Auth` on rejected credentials and
    /// `MailboxError::Transport` on network failure.
    async fn connect(&mut self) -> Result<SelectInfo, MailboxError>;

    /// UIDs strictly greater than `after_uid`, ascending.
    async fn uids_after(&mut self, after_uid: u32) -> Result<Vec<u32>, MailboxError>;

    /// Fetch one message. `Ok(None)` if it vanished since it was listed.
    async fn fetch(&mut self, uid: u32) -> Result<Option<types::Message>, MailboxError>;

    /// Suspend until new mail arrives or the wait interval elapses.
    async fn wait_for_change(&mut self) -> Result<WaitOutcome, MailboxError>;

    async fn disconnect(&mut self);

    /// Mailbox mutations on the same session.
    fn ops(&mut self) -> &mut dyn MailboxOps;
}
