//! Action model: what a matched rule does to a message.

use serde::{Deserialize, Serialize};

use crate::llm::ExtractedParams;
use crate::mailbox::Message;

/// One side effect of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Re-send the message to another address.
    Forward { to: String },
    /// Reply to the sender. `body`/`subject` are templates.
    Reply {
        body: String,
        #[serde(default)]
        subject: Option<String>,
    },
    /// Move the message to another folder.
    Move { folder: String },
    /// Add a keyword flag.
    Tag { keyword: String },
    /// POST a JSON summary of the message.
    Webhook { url: String },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Forward { .. } => "forward",
            Self::Reply { .. } => "reply",
            Self::Move { .. } => "move",
            Self::Tag { .. } => "tag",
            Self::Webhook { .. } => "webhook",
        }
    }

    /// Structural sanity check at rule-load time.
    pub fn validate(&self) -> Result<(), String> {
        let check = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(format!("{} action needs a non-empty {field}", self.kind()))
            } else {
                Ok(())
            }
        };
        match self {
            Self::Forward { to } => {
                check("to", to)?;
                if !to.contains('@') {
                    return Err(format!("forward target '{to}' is not an email address"));
                }
                Ok(())
            }
            Self::Reply { body, .. } => check("body", body),
            Self::Move { folder } => check("folder", folder),
            Self::Tag { keyword } => check("keyword", keyword),
            Self::Webhook { url } => {
                check("url", url)?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(format!("webhook url '{url}' must be http(s)"));
                }
                Ok(())
            }
        }
    }
}

/// An action plus its failure policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(flatten)]
    pub action: Action,
    /// A best-effort action's failure does not fail the rule.
    #[serde(default)]
    pub best_effort: bool,
}

impl ActionSpec {
    pub fn required(action: Action) -> Self {
        Self {
            action,
            best_effort: false,
        }
    }

    pub fn best_effort(action: Action) -> Self {
        Self {
            action,
            best_effort: true,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.action.kind()
    }
}

/// Values available to `{{...}}` placeholders in reply templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    pub sender: String,
    pub subject: String,
    pub rule: String,
    pub label: String,
    pub params: ExtractedParams,
}

impl TemplateVars {
    pub fn new(
        message: &Message,
        rule_id: &str,
        label: Option<&str>,
        params: &ExtractedParams,
    ) -> Self {
        Self {
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            rule: rule_id.to_string(),
            label: label.unwrap_or_default().to_string(),
            params: params.clone(),
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "sender" => Some(self.sender.as_str()),
            "subject" => Some(self.subject.as_str()),
            "rule" => Some(self.rule.as_str()),
            "label" => Some(self.label.as_str()),
            _ => name
                .strip_prefix("param.")
                .map(|p| self.params.get(p).map_or("", String::as_str)),
        }
    }
}

/// Substitute `{{sender}}`, `{{subject}}`, `{{rule}}`, `{{label}}` and
/// `{{param.<name>}}` in one pass over the template.
///
/// Substituted values are never rescanned. Unknown placeholders are left
/// as-is; a parameter the classifier did not extract renders empty.
pub fn render_template(template: &str, vars: &TemplateVars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        match vars.lookup(after[..end].trim()) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}
