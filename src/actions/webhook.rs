//! Webhook action transport.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ActionError;
use crate::llm::ExtractedParams;
use crate::mailbox::Message;

/// Header carrying the per-(message, rule, action) idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// JSON body posted to webhook targets.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub rule: String,
    pub mailbox: String,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Parameters the classifier extracted for this rule.
    #[serde(skip_serializing_if = "ExtractedParams::is_empty")]
    pub params: ExtractedParams,
}

impl WebhookPayload {
    pub fn new(
        message: &Message,
        rule_id: &str,
        label: Option<&str>,
        params: &ExtractedParams,
    ) -> Self {
        Self {
            rule: rule_id.to_string(),
            mailbox: message.mailbox.clone(),
            message_id: message.id.to_string(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            received_at: message.received_at.to_rfc3339(),
            label: label.map(str::to_string),
            params: params.clone(),
        }
    }
}

/// A webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub idempotency_key: String,
    pub payload: WebhookPayload,
}

/// Posts webhook deliveries.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post(&self, request: &WebhookRequest) -> Result<(), ActionError>;
}

/// `WebhookClient` over reqwest.
pub struct HttpWebhookClient {
    client: reqwest::Client,
}

impl HttpWebhookClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpWebhookClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn post(&self, request: &WebhookRequest) -> Result<(), ActionError> {
        let resp = self
            .client
            .post(&request.url)
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| ActionError::Failed {
                kind: "webhook".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ActionError::Failed {
                kind: "webhook".into(),
                reason: format!("{} returned {status}: {}", request.url, body.trim()),
            });
        }
        tracing::debug!(url = %request.url, key = %request.idempotency_key, "Webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MessageId;
    use chrono::Utc;

    #[test]
    fn payload_serialization() {
        let message = Message {
            id: MessageId::new(9, 77),
            mailbox: "INBOX".into(),
            sender: "a@b.com".into(),
            subject: "s".into(),
            body: "body is not sent".into(),
            received_at: Utc::now(),
            headers: Default::default(),
        };
        let none = ExtractedParams::new();
        let json = serde_json::to_value(WebhookPayload::new(&message, "r1", None, &none)).unwrap();
        assert_eq!(json["message_id"], "9:77");
        assert_eq!(json["rule"], "r1");
        assert!(json.get("label").is_none());
        assert!(json.get("params").is_none());
        assert!(json.get("body").is_none());

        let params = ExtractedParams::from([("amount".to_string(), "42.50".to_string())]);
        let json =
            serde_json::to_value(WebhookPayload::new(&message, "r1", Some("invoice"), &params))
                .unwrap();
        assert_eq!(json["label"], "invoice");
        assert_eq!(json["params"]["amount"], "42.50");
    }
}
