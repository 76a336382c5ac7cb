//! Mailbox message model: the immutable `Message` snapshot, its identifier,
//! the per-mailbox watermark, and RFC 822 decoding helpers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

/// Server-assigned identity of a message inside one mailbox folder.
///
/// A UID is only meaningful together with the folder's UIDVALIDITY, so both
/// are part of the identity. Rendered as `"{uid_validity}:{uid}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub uid_validity: u32,
    pub uid: u32,
}

impl MessageId {
    pub fn new(uid_validity: u32, uid: u32) -> Self {
        Self { uid_validity, uid }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid_validity, self.uid)
    }
}

impl FromStr for MessageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (validity, uid) = s
            .split_once(':')
            .ok_or_else(|| format!("malformed message id: {s}"))?;
        Ok(Self {
            uid_validity: validity
                .parse()
                .map_err(|e| format!("bad uid validity in {s}: {e}"))?,
            uid: uid.parse().map_err(|e| format!("bad uid in {s}: {e}"))?,
        })
    }
}

/// How far a mailbox has been consumed.
///
/// Passed into and returned from every poll; persisted in the ledger store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub uid_validity: u32,
    /// Highest UID fully handed to the engine. Zero means "nothing seen yet".
    pub last_uid: u32,
}

impl Watermark {
    pub fn new(uid_validity: u32, last_uid: u32) -> Self {
        Self {
            uid_validity,
            last_uid,
        }
    }

    /// Advance past `uid`. Never moves backwards.
    pub fn advanced_to(self, uid: u32) -> Self {
        Self {
            last_uid: self.last_uid.max(uid),
            ..self
        }
    }
}

/// Immutable snapshot of a mailbox entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Folder the message was observed in.
    pub mailbox: String,
    /// Sender email address.
    pub sender: String,
    pub subject: String,
    /// Plain-text body (HTML stripped when no text part exists).
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Header map keyed by lower-cased name. Repeated headers are joined by `", "`.
    pub headers: BTreeMap<String, String>,
}

impl Message {
    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// RFC 5322 Message-ID, if the sender supplied one.
    pub fn message_id_header(&self) -> Option<&str> {
        self.header("message-id")
    }

    /// Canonical text block handed to the classifier.
    pub fn display(&self) -> String {
        format!(
            "Message Details:\n\
             ----------------\n\
             From: {}\n\
             Source: email\n\
             Date: {}\n\
             Subject: {}\n\
             ----------------\n\
             Body:\n{}",
            self.sender,
            self.received_at.format("%Y-%m-%d %H:%M:%S"),
            self.subject,
            self.body
        )
        .trim()
        .to_string()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message from {} with subject: {}", self.sender, self.subject)
    }
}

// ── Decoding ────────────────────────────────────────────────────────

/// Decode a raw RFC 822 message into a `Message`.
///
/// `internal_date` is the server's INTERNALDATE; when absent the `Date:`
/// header is used, then the current time. Returns `None` if the bytes are not
/// a parseable message.
pub fn decode_message(
    mailbox: &str,
    id: MessageId,
    raw: &[u8],
    internal_date: Option<DateTime<Utc>>,
) -> Option<Message> {
    let parsed = MessageParser::default().parse(raw)?;

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in parsed.headers_raw() {
        let key = name.to_ascii_lowercase();
        let value = unfold_header(value);
        headers
            .entry(key)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let received_at = internal_date
        .or_else(|| {
            parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        })
        .unwrap_or_else(Utc::now);

    Some(Message {
        id,
        mailbox: mailbox.to_string(),
        sender: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or("").to_string(),
        body: extract_text(&parsed),
        received_at,
        headers,
    })
}

/// Collapse folded header whitespace into single spaces.
fn unfold_header(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse an IMAP INTERNALDATE (`"17-Jul-1996 02:44:25 -0700"`).
pub fn parse_internal_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: ap@example.com\r\n\
Subject: Invoice #42\r\n\
Message-ID: <inv-42@example.com>\r\n\
X-Priority: 1\r\n\
Received: from a\r\n\
Received: from b\r\n\
Date: Mon, 2 Feb 2026 10:00:00 +0000\r\n\
\r\n\
Please find the invoice attached.\r\n";

    #[test]
    fn message_id_roundtrips_through_display() {
        let id = MessageId::new(7, 1234);
        assert_eq!(id.to_string(), "7:1234");
        assert_eq!("7:1234".parse::<MessageId>().unwrap(), id);
        assert!("1234".parse::<MessageId>().is_err());
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let wm = Watermark::new(3, 10);
        assert_eq!(wm.advanced_to(12).last_uid, 12);
        assert_eq!(wm.advanced_to(4).last_uid, 10);
    }

    #[test]
    fn decode_plain_message() {
        let msg = decode_message("INBOX", MessageId::new(1, 5), RAW, None).unwrap();
        assert_eq!(msg.sender, "alice@example.com");
        assert_eq!(msg.subject, "Invoice #42");
        assert!(msg.body.contains("invoice attached"));
        assert_eq!(msg.header("X-PRIORITY"), Some("1"));
        assert_eq!(msg.message_id_header(), Some("<inv-42@example.com>"));
        assert_eq!(msg.header("received"), Some("from a, from b"));
        assert_eq!(msg.received_at.to_rfc3339(), "2026-02-02T10:00:00+00:00");
    }

    #[test]
    fn internal_date_wins_over_date_header() {
        let internal = parse_internal_date("17-Jul-1996 02:44:25 -0700").unwrap();
        let msg = decode_message("INBOX", MessageId::new(1, 5), RAW, Some(internal)).unwrap();
        assert_eq!(msg.received_at.to_rfc3339(), "1996-07-17T09:44:25+00:00");
    }

    #[test]
    fn display_contains_canonical_fields() {
        let msg = decode_message("INBOX", MessageId::new(1, 5), RAW, None).unwrap();
        let text = msg.display();
        assert!(text.starts_with("Message Details:"));
        assert!(text.contains("From: alice@example.com"));
        assert!(text.contains("Subject: Invoice #42"));
        assert!(text.ends_with("Please find the invoice attached."));
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
        assert_eq!(strip_html(""), "");
    }
}
