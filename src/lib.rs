//! Mail Trigger: watches IMAP mailboxes and fires actions when rules match.

pub mod actions;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod llm;
pub mod mailbox;
pub mod retry;
pub mod rules;
