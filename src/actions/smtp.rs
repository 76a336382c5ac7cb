//! Outbound mail for `Forward` and `Reply` actions, via lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message as Email, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::cancel::{CancelFlag, CancelOnDrop};
use crate::error::ActionError;
use crate::mailbox::Message;

/// A fully rendered outgoing email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message-ID of the mail being answered, for threading.
    pub in_reply_to: Option<String>,
}

impl OutgoingEmail {
    /// A forward of `original` to `to`.
    pub fn forward(original: &Message, to: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: prefixed_subject("Fwd:", &original.subject),
            body: format!(
                "---------- Forwarded message ----------\n\
                 From: {}\n\
                 Date: {}\n\
                 Subject: {}\n\n{}",
                original.sender,
                original.received_at.to_rfc2822(),
                original.subject,
                original.body
            ),
            in_reply_to: None,
        }
    }

    /// A reply to the sender of `original`.
    pub fn reply(original: &Message, subject: Option<String>, body: String) -> Self {
        Self {
            to: original.sender.clone(),
            subject: subject.unwrap_or_else(|| prefixed_subject("Re:", &original.subject)),
            body,
            in_reply_to: original.message_id_header().map(str::to_string),
        }
    }
}

/// Add `prefix` unless the subject already starts with it.
fn prefixed_subject(prefix: &str, subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    {
        trimmed.to_string()
    } else {
        format!("{prefix} {trimmed}")
    }
}

/// Sends email.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<(), ActionError>;
}

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Bound on each network step of a send. Kept below the dispatcher's
    /// action timeout so a send gives up before the action is retried.
    pub timeout: Duration,
}

/// `MailSender` over a blocking lettre SMTP transport.
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

fn failed(reason: String) -> ActionError {
    ActionError::Failed {
        kind: "smtp".into(),
        reason,
    }
}

fn build_email(from: &str, email: &OutgoingEmail) -> Result<Email, ActionError> {
    let mut builder = Email::builder()
        .from(
            from.parse()
                .map_err(|e| failed(format!("Invalid from address: {e}")))?,
        )
        .to(email
            .to
            .parse()
            .map_err(|e| failed(format!("Invalid to address: {e}")))?)
        .subject(email.subject.clone())
        .header(ContentType::TEXT_PLAIN);
    if let Some(id) = &email.in_reply_to {
        builder = builder.in_reply_to(id.clone()).references(id.clone());
    }
    builder
        .body(email.body.clone())
        .map_err(|e| failed(format!("Failed to build email: {e}")))
}

fn send_blocking(
    config: &SmtpConfig,
    email: &OutgoingEmail,
    cancel: &CancelFlag,
) -> Result<(), ActionError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.host)
        .map_err(|e| failed(format!("SMTP relay error: {e}")))?
        .port(config.port)
        .credentials(creds)
        .timeout(Some(config.timeout))
        .build();

    let message = build_email(&config.from_address, email)?;
    if cancel.is_cancelled() {
        tracing::warn!(to = %email.to, "Send abandoned before it started");
        return Err(failed("send abandoned by the dispatcher".into()));
    }
    transport
        .send(&message)
        .map_err(|e| failed(format!("SMTP send failed: {e}")))?;

    tracing::info!(to = %email.to, subject = %email.subject, "Email sent");
    Ok(())
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), ActionError> {
        let config = self.config.clone();
        let guard = CancelOnDrop::new();
        let cancel = guard.flag();
        let sent = tokio::task::spawn_blocking(move || send_blocking(&config, &email, &cancel))
            .await
            .map_err(|e| failed(format!("SMTP task panicked: {e}")))?;
        drop(guard);
        sent
    }
}
