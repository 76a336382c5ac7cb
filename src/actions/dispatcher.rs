//! Action dispatcher: runs a rule's actions in order with per-action
//! failure isolation.
//!
//! Every action runs even if an earlier one failed, and each gets its own
//! outcome. Whether the rule as a whole succeeded is decided by the caller
//! through `DispatchResult::is_success`, which ignores best-effort actions.
//!
//! On a retry the caller passes the indexes that already succeeded; those
//! are not run again. Once a `Move` succeeds the UID no longer names the
//! message in the watched folder, so later `Move`/`Tag` actions fail instead
//! of silently touching nothing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::actions::model::{Action, ActionSpec, TemplateVars, render_template};
use crate::actions::smtp::{MailSender, OutgoingEmail};
use crate::actions::webhook::{WebhookClient, WebhookPayload, WebhookRequest};
use crate::error::ActionError;
use crate::llm::ExtractedParams;
use crate::mailbox::{MailboxOps, Message};

/// Per-dispatch inputs that are not part of the message.
pub struct DispatchContext<'a> {
    pub rule_id: &'a str,
    /// Semantic label that selected the rule, for templates and webhooks.
    pub label: Option<&'a str>,
    /// Extracted parameters, for templates and webhooks.
    pub params: &'a ExtractedParams,
    /// Action indexes that succeeded on an earlier attempt.
    pub completed: &'a [usize],
    /// Where the message went, once it has left the watched folder. Set by a
    /// successful `Move`.
    pub gone: Option<String>,
    /// Session used for `Move` and `Tag`.
    pub mailbox: &'a mut dyn MailboxOps,
}

impl<'a> DispatchContext<'a> {
    /// Context for a first attempt.
    pub fn new(
        rule_id: &'a str,
        label: Option<&'a str>,
        params: &'a ExtractedParams,
        mailbox: &'a mut dyn MailboxOps,
    ) -> Self {
        Self {
            rule_id,
            label,
            params,
            completed: &[],
            gone: None,
            mailbox,
        }
    }
}

/// Result of one action.
#[derive(Debug)]
pub struct ActionOutcome {
    pub index: usize,
    pub kind: &'static str,
    pub best_effort: bool,
    pub result: Result<(), ActionError>,
}

impl ActionOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcomes of a whole rule's actions, in order.
#[derive(Debug, Default)]
pub struct DispatchResult {
    pub outcomes: Vec<ActionOutcome>,
}

impl DispatchResult {
    /// True iff every non-best-effort action succeeded.
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.best_effort || o.succeeded())
    }

    /// Failed outcomes, best-effort ones included.
    pub fn failures(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    /// Indexes of actions that have succeeded, on this or an earlier attempt.
    pub fn completed(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|o| o.succeeded())
            .map(|o| o.index)
            .collect()
    }

    /// One-line description of the mandatory failures, for the ledger.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .filter(|o| !o.best_effort)
            .map(|o| match &o.result {
                Err(e) => format!("#{} {}: {e}", o.index, o.kind),
                Ok(()) => String::new(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Executes actions against their targets.
pub struct ActionDispatcher {
    mailer: Option<Arc<dyn MailSender>>,
    webhooks: Arc<dyn WebhookClient>,
    action_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(
        mailer: Option<Arc<dyn MailSender>>,
        webhooks: Arc<dyn WebhookClient>,
        action_timeout: Duration,
    ) -> Self {
        Self {
            mailer,
            webhooks,
            action_timeout,
        }
    }

    /// Run `actions` for `message` in order.
    pub async fn dispatch(
        &self,
        ctx: &mut DispatchContext<'_>,
        message: &Message,
        actions: &[ActionSpec],
    ) -> DispatchResult {
        let mut result = DispatchResult::default();

        for (index, spec) in actions.iter().enumerate() {
            let kind = spec.kind();
            if ctx.completed.contains(&index) {
                debug!(
                    rule = %ctx.rule_id,
                    message = %message.id,
                    action = kind,
                    index,
                    "Action already done on an earlier attempt"
                );
                result.outcomes.push(ActionOutcome {
                    index,
                    kind,
                    best_effort: spec.best_effort,
                    result: Ok(()),
                });
                continue;
            }

            let outcome =
                match tokio::time::timeout(self.action_timeout, self.run(ctx, message, index, &spec.action))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(ActionError::Timeout {
                        kind: kind.to_string(),
                        timeout: self.action_timeout,
                    }),
                };

            match &outcome {
                Ok(()) => info!(
                    rule = %ctx.rule_id,
                    message = %message.id,
                    action = kind,
                    index,
                    "Action succeeded"
                ),
                Err(e) => warn!(
                    rule = %ctx.rule_id,
                    message = %message.id,
                    action = kind,
                    index,
                    best_effort = spec.best_effort,
                    error = %e,
                    "Action failed"
                ),
            }

            result.outcomes.push(ActionOutcome {
                index,
                kind,
                best_effort: spec.best_effort,
                result: outcome,
            });
        }

        result
    }

    async fn run(
        &self,
        ctx: &mut DispatchContext<'_>,
        message: &Message,
        index: usize,
        action: &Action,
    ) -> Result<(), ActionError> {
        let mailbox_failed = |e: crate::error::MailboxError| ActionError::Failed {
            kind: action.kind().to_string(),
            reason: e.to_string(),
        };
        if let (Action::Move { .. } | Action::Tag { .. }, Some(gone)) = (action, &ctx.gone) {
            return Err(ActionError::Failed {
                kind: action.kind().to_string(),
                reason: format!("message {gone}"),
            });
        }

        match action {
            Action::Forward { to } => {
                self.mailer(action)?
                    .send(OutgoingEmail::forward(message, to))
                    .await
            }
            Action::Reply { body, subject } => {
                let vars = TemplateVars::new(message, ctx.rule_id, ctx.label, ctx.params);
                let email = OutgoingEmail::reply(
                    message,
                    subject.as_deref().map(|s| render_template(s, &vars)),
                    render_template(body, &vars),
                );
                self.mailer(action)?.send(email).await
            }
            Action::Move { folder } => {
                ctx.mailbox
                    .move_message(message.id.uid, folder)
                    .await
                    .map_err(mailbox_failed)?;
                ctx.gone = Some(format!("was moved to {folder}"));
                Ok(())
            }
            Action::Tag { keyword } => ctx
                .mailbox
                .add_keyword(message.id.uid, keyword)
                .await
                .map_err(mailbox_failed),
            Action::Webhook { url } => {
                let request = WebhookRequest {
                    url: url.clone(),
                    idempotency_key: idempotency_key(message, ctx.rule_id, index),
                    payload: WebhookPayload::new(message, ctx.rule_id, ctx.label, ctx.params),
                };
                self.webhooks.post(&request).await
            }
        }
    }

    fn mailer(&self, action: &Action) -> Result<&Arc<dyn MailSender>, ActionError> {
        self.mailer.as_ref().ok_or_else(|| ActionError::Unsupported {
            kind: action.kind().to_string(),
        })
    }
}

/// `"{message_id}:{rule_id}:{action_index}"` with the message id qualified by
/// its mailbox. Stable across retries.
pub fn idempotency_key(message: &Message, rule_id: &str, index: usize) -> String {
    format!("{}/{}:{rule_id}:{index}", message.mailbox, message.id)
}
