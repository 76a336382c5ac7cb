//! Rule actions: the model, the dispatcher, and the outbound transports
//! (SMTP and webhooks) it drives.

pub mod dispatcher;
pub mod model;
pub mod smtp;
pub mod webhook;

pub use dispatcher::{ActionDispatcher, ActionOutcome, DispatchContext, DispatchResult};
pub use model::{Action, ActionSpec};
pub use smtp::{MailSender, OutgoingEmail, SmtpConfig, SmtpMailer};
pub use webhook::{HttpWebhookClient, WebhookClient, WebhookRequest};
