//! Dedup ledger: durable record of which rules fired for which messages.
//!
//! The ledger is the sole authority for "has this (message, rule) pair been
//! handled". It also stores per-pair retry counters, dead letters and the
//! per-mailbox watermark, all partitioned by mailbox name so each engine task
//! is the single writer of its partition.
//!
//! # Crash window
//!
//! Actions are dispatched *before* the match is recorded. A crash between a
//! successful dispatch and the `record` call means the pair is not in the
//! ledger on restart, so its actions run again. Dispatch is therefore
//! at-least-once across crashes and exactly-once otherwise. Webhook
//! receivers can close the gap with the `Idempotency-Key` header; `Move` and
//! `Tag` are naturally idempotent.
//!
//! A failed attempt stores the message snapshot and the indexes of the
//! actions that did succeed, so a retry re-runs only what failed and still
//! works after the rule moved the message out of the folder.

mod libsql_backend;
mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use traits::{DeadLetter, FailedDispatch, Ledger, PendingRetry, UNREADABLE_RULE};
