//! Engine loop: drives one mailbox through watch, match, dispatch and record.
//!
//! Each cycle:
//! 1. Retry (message, rule) pairs that failed in earlier cycles
//! 2. Poll messages above the watermark
//! 3. Per message: match, then per matched rule check the ledger, dispatch,
//!    and record the success, the failed attempt, or the dead letter
//! 4. Save the watermark after every handled message
//!
//! The shutdown signal is observed at wait points and between rules. A
//! dispatch that has started always runs to its ledger write.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionDispatcher, DispatchContext};
use crate::engine::state::EngineState;
use crate::error::{Error, MailboxError, Result};
use crate::ledger::{FailedDispatch, Ledger, UNREADABLE_RULE};
use crate::llm::ExtractedParams;
use crate::mailbox::{MailboxWatcher, Message, MessageId, Polled, WaitOutcome, Watermark};
use crate::rules::{Rule, RuleMatcher, RuleSet};

/// Default number of failed dispatches before a pair is dead-lettered.
const DEFAULT_MAX_RULE_ATTEMPTS: u32 = 3;

/// Per-engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Failed dispatches per (message, rule) before giving up.
    pub max_rule_attempts: u32,
    /// Our own outgoing address; mail from it is never matched.
    pub self_address: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rule_attempts: DEFAULT_MAX_RULE_ATTEMPTS,
            self_address: None,
        }
    }
}

/// Components shared by every mailbox engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub rules: Arc<RuleSet>,
    pub matcher: Arc<RuleMatcher>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub ledger: Arc<dyn Ledger>,
}

/// Counters reported when an engine stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub messages: u64,
    pub fired: u64,
    pub failed_attempts: u64,
    pub dead_lettered: u64,
    pub skipped_self: u64,
}

enum Handled {
    Done,
    /// Shutdown arrived between rules; the message must be seen again.
    Interrupted,
}

/// Match details a dispatch carries, fresh or restored from the ledger.
#[derive(Clone, Copy)]
struct MatchDetails<'a> {
    label: Option<&'a str>,
    params: &'a ExtractedParams,
    completed: &'a [usize],
}

enum Woken {
    Mailbox(std::result::Result<WaitOutcome, MailboxError>),
    /// Stop requested; `true` if the sender side is gone.
    Stop(bool),
}

/// The trigger engine for one mailbox folder.
pub struct Engine {
    mailbox: String,
    watcher: MailboxWatcher,
    deps: EngineDeps,
    config: EngineConfig,
    state: EngineState,
    watermark: Option<Watermark>,
    shutdown: watch::Receiver<bool>,
    /// Set when the shutdown sender was dropped.
    orphaned: bool,
    stats: EngineStats,
}

impl Engine {
    pub fn new(
        watcher: MailboxWatcher,
        deps: EngineDeps,
        config: EngineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            mailbox: watcher.mailbox().to_string(),
            watcher,
            deps,
            config,
            state: EngineState::Idle,
            watermark: None,
            shutdown,
            orphaned: false,
            stats: EngineStats::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Run until shutdown or a fatal error.
    ///
    /// Returns the counters on a requested stop, and the error on an
    /// authentication failure, an exhausted reconnect budget or a ledger
    /// failure.
    pub async fn run(mut self) -> Result<EngineStats> {
        info!(
            mailbox = %self.mailbox,
            rules = self.deps.rules.len(),
            "Engine started"
        );

        let result = self.run_loop().await;
        self.watcher.disconnect().await;
        self.transition(EngineState::Shutdown);

        match &result {
            Ok(()) => info!(mailbox = %self.mailbox, stats = ?self.stats, "Engine stopped"),
            Err(e) => error!(
                mailbox = %self.mailbox,
                error = %e,
                stats = ?self.stats,
                "Engine halted"
            ),
        }
        result.map(|()| self.stats)
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            if self.stop_requested() {
                info!(mailbox = %self.mailbox, state = %self.state, "Shutdown requested");
                return Ok(());
            }

            match self.state {
                EngineState::Idle if !self.watcher.is_connected() => {
                    self.transition(EngineState::Reconnecting);
                }
                EngineState::Idle => self.wait().await?,
                EngineState::Reconnecting => self.reconnect().await?,
                EngineState::Polling => match self.cycle().await {
                    Ok(()) => {}
                    Err(Error::Mailbox(e)) if e.is_retryable() => {
                        warn!(mailbox = %self.mailbox, error = %e, "Mailbox session lost");
                        self.transition(EngineState::Reconnecting);
                    }
                    Err(e) => return Err(e),
                },
                other => {
                    error!(
                        mailbox = %self.mailbox,
                        state = %other,
                        "Engine loop left in an intermediate state"
                    );
                    return Ok(());
                }
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.orphaned || *self.shutdown.borrow()
    }

    /// Move to `to` if the transition table allows it.
    fn transition(&mut self, to: EngineState) -> bool {
        if !self.state.can_transition_to(to) {
            error!(
                mailbox = %self.mailbox,
                from = %self.state,
                to = %to,
                "Invalid engine state transition refused"
            );
            return false;
        }
        debug!(mailbox = %self.mailbox, from = %self.state, to = %to, "Engine state");
        self.state = to;
        true
    }

    // ── Idle / Reconnecting ─────────────────────────────────────────

    async fn wait(&mut self) -> Result<()> {
        let woken = tokio::select! {
            outcome = self.watcher.wait() => Woken::Mailbox(outcome),
            changed = self.shutdown.changed() => Woken::Stop(changed.is_err()),
        };

        match woken {
            Woken::Stop(orphaned) => {
                self.orphaned |= orphaned;
                Ok(())
            }
            Woken::Mailbox(Ok(outcome)) => {
                if outcome == WaitOutcome::Changed {
                    debug!(mailbox = %self.mailbox, "Mailbox reported new mail");
                }
                self.transition(EngineState::Polling);
                Ok(())
            }
            Woken::Mailbox(Err(e)) if e.is_fatal() => Err(e.into()),
            Woken::Mailbox(Err(e)) => {
                warn!(mailbox = %self.mailbox, error = %e, "Wait failed");
                self.transition(EngineState::Reconnecting);
                Ok(())
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let backoff = self.watcher.reconnect_backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let stored = match self.watermark {
                Some(wm) => Some(wm),
                None => self.deps.ledger.load_watermark(&self.mailbox).await?,
            };

            let err = match self.watcher.connect(stored).await {
                Ok(wm) => {
                    if stored != Some(wm) {
                        self.deps.ledger.save_watermark(&self.mailbox, wm).await?;
                    }
                    self.watermark = Some(wm);
                    self.transition(EngineState::Polling);
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => return Err(e.into()),
                Err(e) => e,
            };

            if !backoff.should_retry(attempt) {
                error!(
                    mailbox = %self.mailbox,
                    attempts = attempt,
                    error = %err,
                    "Reconnect attempts exhausted"
                );
                return Err(err.into());
            }

            let delay = backoff.delay(attempt);
            warn!(
                mailbox = %self.mailbox,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Connect failed, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    self.orphaned |= changed.is_err();
                    return Ok(());
                }
            }
            if self.stop_requested() {
                return Ok(());
            }
        }
    }

    // ── Polling ─────────────────────────────────────────────────────

    async fn cycle(&mut self) -> Result<()> {
        let Some(mut watermark) = self.watermark else {
            self.transition(EngineState::Reconnecting);
            return Ok(());
        };

        self.retry_pending(watermark).await?;
        if self.stop_requested() {
            return Ok(());
        }

        let batch = self.watcher.poll(watermark).await?;
        if batch.is_empty() {
            self.transition(EngineState::Idle);
            return Ok(());
        }
        let more = self.watcher.batch_was_full(batch.len());
        debug!(mailbox = %self.mailbox, count = batch.len(), more, "Handling batch");

        for item in batch {
            let id = item.id();
            self.transition(EngineState::Matching);
            if let Handled::Interrupted = self.handle(item).await? {
                info!(
                    mailbox = %self.mailbox,
                    message = %id,
                    "Stopping mid-message; it will be seen again on restart"
                );
                return Ok(());
            }

            watermark = watermark.advanced_to(id.uid);
            self.deps.ledger.save_watermark(&self.mailbox, watermark).await?;
            self.watermark = Some(watermark);

            if self.stop_requested() {
                return Ok(());
            }
        }

        self.transition(if more {
            EngineState::Polling
        } else {
            EngineState::Idle
        });
        Ok(())
    }

    /// Re-dispatch pairs whose earlier attempts failed.
    async fn retry_pending(&mut self, watermark: Watermark) -> Result<()> {
        let ledger = Arc::clone(&self.deps.ledger);
        let pending = ledger.pending_retries(&self.mailbox).await?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!(mailbox = %self.mailbox, count = pending.len(), "Retrying failed rules");

        let rules = Arc::clone(&self.deps.rules);
        for retry in pending {
            if self.stop_requested() {
                break;
            }
            let id = retry.message_id;

            if id.uid_validity != watermark.uid_validity {
                self.give_up(id, &retry.rule_id, "UIDVALIDITY changed before retry")
                    .await?;
                continue;
            }
            // Not yet behind the watermark: the poll will pick it up.
            if id.uid > watermark.last_uid {
                continue;
            }
            let Some(rule) = rules.get(&retry.rule_id) else {
                info!(
                    mailbox = %self.mailbox,
                    message = %id,
                    rule = %retry.rule_id,
                    "Dropping retry for a rule that is no longer configured"
                );
                ledger.clear_attempts(&self.mailbox, id, &retry.rule_id).await?;
                continue;
            };

            // The live copy also tells whether the message is still in the
            // folder; the snapshot covers one moved away by an earlier action.
            let (message, gone) = match self.watcher.fetch(id.uid).await {
                Ok(Some(message)) => (message, None),
                Ok(None) => match retry.message.clone() {
                    Some(snapshot) => (
                        snapshot,
                        Some(format!("is no longer in {}", self.mailbox)),
                    ),
                    None => {
                        self.give_up(id, &rule.id, "message no longer in mailbox").await?;
                        continue;
                    }
                },
                Err(e) if e.is_retryable() || e.is_fatal() => return Err(e.into()),
                Err(e) => match retry.message.clone() {
                    Some(snapshot) => (snapshot, None),
                    None => {
                        self.give_up(id, &rule.id, &e.to_string()).await?;
                        continue;
                    }
                },
            };

            debug!(
                mailbox = %self.mailbox,
                message = %id,
                rule = %rule.id,
                previous_attempts = retry.attempts,
                completed = ?retry.completed,
                last_error = %retry.last_error,
                "Retrying rule"
            );
            let details = MatchDetails {
                label: retry.label.as_deref(),
                params: &retry.params,
                completed: &retry.completed,
            };
            self.fire(&message, rule, details, gone).await?;
            if self.state == EngineState::Recording {
                self.transition(EngineState::Polling);
            }
        }
        Ok(())
    }

    // ── Matching / Dispatching / Recording ──────────────────────────

    async fn handle(&mut self, item: Polled) -> Result<Handled> {
        match item {
            Polled::Message(message) => self.handle_message(&message).await,
            Polled::Vanished { .. } => Ok(Handled::Done),
            Polled::Unreadable { id, reason } => {
                self.transition(EngineState::Recording);
                self.give_up(id, UNREADABLE_RULE, &reason).await?;
                Ok(Handled::Done)
            }
        }
    }

    async fn handle_message(&mut self, message: &Message) -> Result<Handled> {
        self.stats.messages += 1;

        if self.is_self_sent(message) {
            debug!(
                mailbox = %self.mailbox,
                message = %message.id,
                sender = %message.sender,
                "Skipping self-sent message"
            );
            self.stats.skipped_self += 1;
            return Ok(Handled::Done);
        }

        let rules = Arc::clone(&self.deps.rules);
        let matcher = Arc::clone(&self.deps.matcher);
        let matched = matcher.evaluate(message, rules.rules()).await;
        if matched.is_empty() {
            debug!(mailbox = %self.mailbox, message = %message.id, "No rules matched");
            return Ok(Handled::Done);
        }

        // A `Move` in one rule takes the message out of the folder for the
        // rules after it.
        let mut gone = None;
        for m in matched {
            if self.stop_requested() {
                return Ok(Handled::Interrupted);
            }
            let details = MatchDetails {
                label: m.label.as_deref(),
                params: &m.params,
                completed: &[],
            };
            if let Some(moved) = self.fire(message, m.rule, details, gone.clone()).await? {
                gone = Some(moved);
            }
        }
        Ok(Handled::Done)
    }

    fn is_self_sent(&self, message: &Message) -> bool {
        self.config
            .self_address
            .as_deref()
            .is_some_and(|addr| message.sender.eq_ignore_ascii_case(addr))
    }

    /// Dispatch one matched rule unless the ledger says it is settled.
    ///
    /// Returns where the message went if this dispatch moved it.
    async fn fire(
        &mut self,
        message: &Message,
        rule: &Rule,
        details: MatchDetails<'_>,
        gone: Option<String>,
    ) -> Result<Option<String>> {
        let ledger = Arc::clone(&self.deps.ledger);
        if ledger.has_fired(&self.mailbox, message.id, &rule.id).await? {
            debug!(
                mailbox = %self.mailbox,
                message = %message.id,
                rule = %rule.id,
                "Rule already fired for message"
            );
            return Ok(None);
        }
        if ledger
            .is_dead_lettered(&self.mailbox, message.id, &rule.id)
            .await?
        {
            debug!(
                mailbox = %self.mailbox,
                message = %message.id,
                rule = %rule.id,
                "Rule dead-lettered for message"
            );
            return Ok(None);
        }

        self.transition(EngineState::Dispatching);
        let dispatcher = Arc::clone(&self.deps.dispatcher);
        let already_gone = gone.is_some();
        let (result, gone) = {
            let mut ctx = DispatchContext {
                completed: details.completed,
                gone,
                ..DispatchContext::new(&rule.id, details.label, details.params, self.watcher.ops())
            };
            let result = dispatcher.dispatch(&mut ctx, message, &rule.actions).await;
            (result, ctx.gone)
        };
        self.transition(EngineState::Recording);
        let moved = if already_gone { None } else { gone };

        if result.is_success() {
            ledger.record(&self.mailbox, message.id, &rule.id).await?;
            ledger
                .clear_attempts(&self.mailbox, message.id, &rule.id)
                .await?;
            self.stats.fired += 1;
            info!(
                mailbox = %self.mailbox,
                message = %message.id,
                rule = %rule.id,
                actions = rule.actions.len(),
                "Rule fired"
            );
            return Ok(moved);
        }

        let reason = result.failure_summary();
        let completed = result.completed();
        let failure = FailedDispatch {
            message,
            rule_id: &rule.id,
            label: details.label,
            params: details.params,
            completed: &completed,
            error: &reason,
        };
        let attempts = ledger.record_failure(&self.mailbox, &failure).await?;
        self.stats.failed_attempts += 1;

        if attempts >= self.config.max_rule_attempts {
            let reason = format!("gave up after {attempts} attempt(s): {reason}");
            self.give_up(message.id, &rule.id, &reason).await?;
        } else {
            warn!(
                mailbox = %self.mailbox,
                message = %message.id,
                rule = %rule.id,
                attempts,
                max_attempts = self.config.max_rule_attempts,
                reason = %reason,
                "Rule failed; retrying next cycle"
            );
        }
        Ok(moved)
    }

    async fn give_up(&mut self, id: MessageId, rule_id: &str, reason: &str) -> Result<()> {
        self.deps
            .ledger
            .dead_letter(&self.mailbox, id, rule_id, reason)
            .await?;
        self.stats.dead_lettered += 1;
        error!(
            mailbox = %self.mailbox,
            message = %id,
            rule = %rule_id,
            reason = %reason,
            "Dead-lettered"
        );
        Ok(())
    }
}

/// Spawn an engine on the runtime.
pub fn spawn_engine(engine: Engine) -> JoinHandle<Result<EngineStats>> {
    tokio::spawn(engine.run())
}
