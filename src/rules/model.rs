//! Rule model and rule-file loading.
//!
//! Rules are loaded once per run from a JSON file of the form
//! `{"rules": [ {"id": ..., "when": <predicate>, "actions": [...]}, ... ]}`
//! and are immutable afterwards. Regexes are compiled at load time so a bad
//! pattern is a startup error rather than a per-message one.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::actions::ActionSpec;
use crate::error::ConfigError;

/// Default confidence threshold for semantic predicates.
pub const DEFAULT_THRESHOLD: f32 = 0.7;

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

/// Which part of a message a structural predicate inspects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Sender,
    Subject,
    Body,
    /// A header by (case-insensitive) name.
    Header(String),
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sender => write!(f, "sender"),
            Self::Subject => write!(f, "subject"),
            Self::Body => write!(f, "body"),
            Self::Header(name) => write!(f, "header({name})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Contains,
    Equals,
    StartsWith,
    EndsWith,
    Regex,
    /// Header present (or, for other fields, non-empty).
    Exists,
}

/// Boolean condition over a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// True when every child is true. Empty is true.
    All { of: Vec<Predicate> },
    /// True when any child is true. Empty is false.
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
    Structural {
        field: Field,
        op: Operator,
        #[serde(default)]
        value: String,
        #[serde(default)]
        case_sensitive: bool,
        #[serde(skip)]
        compiled: Option<Regex>,
    },
    Semantic {
        labels: Vec<String>,
        expect: String,
        #[serde(default = "default_threshold")]
        threshold: f32,
        #[serde(default)]
        instructions: Option<String>,
        /// Parameters for the model to extract when classifying, name to
        /// description. Available as `{{param.<name>}}` in reply templates
        /// and under `params` in webhook payloads.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        extract: BTreeMap<String, String>,
    },
}

impl Predicate {
    pub fn structural(field: Field, op: Operator, value: impl Into<String>) -> Self {
        Self::Structural {
            field,
            op,
            value: value.into(),
            case_sensitive: false,
            compiled: None,
        }
    }

    pub fn semantic(labels: &[&str], expect: &str, threshold: f32) -> Self {
        Self::Semantic {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            expect: expect.to_string(),
            threshold,
            instructions: None,
            extract: BTreeMap::new(),
        }
    }

    /// Whether any node in the tree needs the classifier.
    pub fn is_semantic(&self) -> bool {
        match self {
            Self::All { of } | Self::Any { of } => of.iter().any(Predicate::is_semantic),
            Self::Not { predicate } => predicate.is_semantic(),
            Self::Structural { .. } => false,
            Self::Semantic { .. } => true,
        }
    }

    /// Validate and compile regexes in place.
    fn compile(&mut self) -> Result<(), String> {
        match self {
            Self::All { of } | Self::Any { of } => {
                of.iter_mut().try_for_each(Predicate::compile)
            }
            Self::Not { predicate } => predicate.compile(),
            Self::Structural {
                field,
                op,
                value,
                case_sensitive,
                compiled,
            } => {
                if let Field::Header(name) = field
                    && name.trim().is_empty()
                {
                    return Err("header field needs a name".to_string());
                }
                match op {
                    Operator::Regex => {
                        let re = RegexBuilder::new(value)
                            .case_insensitive(!*case_sensitive)
                            .build()
                            .map_err(|e| format!("invalid regex '{value}': {e}"))?;
                        *compiled = Some(re);
                    }
                    Operator::Exists => {}
                    _ if value.is_empty() => {
                        return Err(format!("{field} predicate needs a value"));
                    }
                    _ => {}
                }
                Ok(())
            }
            Self::Semantic {
                labels,
                expect,
                threshold,
                extract,
                ..
            } => {
                if labels.is_empty() {
                    return Err("semantic predicate needs at least one label".to_string());
                }
                if !labels.iter().any(|l| l.eq_ignore_ascii_case(expect)) {
                    return Err(format!("expected label '{expect}' is not in labels"));
                }
                if !(0.0..=1.0).contains(threshold) {
                    return Err(format!("threshold {threshold} outside [0, 1]"));
                }
                if let Some(name) = extract.keys().find(|n| !is_param_name(n)) {
                    return Err(format!(
                        "parameter name '{name}' must be non-empty ASCII letters, digits or '_'"
                    ));
                }
                Ok(())
            }
        }
    }
}

fn is_param_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A trigger rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier. Part of the ledger key, so renaming re-fires.
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub when: Predicate,
    pub actions: Vec<ActionSpec>,
    /// When this rule matches, later rules are not evaluated.
    #[serde(default)]
    pub stop_after_match: bool,
}

impl Rule {
    pub fn new(id: &str, when: Predicate, actions: Vec<ActionSpec>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            when,
            actions,
            stop_after_match: false,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Validate and compile. Must be called before evaluation.
    pub fn compile(&mut self) -> Result<(), ConfigError> {
        let id = self.id.clone();
        let invalid = |reason: String| ConfigError::InvalidRule {
            rule: id.clone(),
            reason,
        };
        if self.id.trim().is_empty() {
            return Err(invalid("rule id must not be empty".to_string()));
        }
        if self.id == "*" {
            return Err(invalid("rule id '*' is reserved".to_string()));
        }
        if self.actions.is_empty() {
            return Err(invalid("rule has no actions".to_string()));
        }
        for spec in &self.actions {
            spec.action.validate().map_err(invalid)?;
        }
        self.when.compile().map_err(invalid)
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<Rule>,
}

/// The loaded, validated rule list. Declaration order is evaluation order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Validate and compile a list of rules.
    pub fn new(mut rules: Vec<Rule>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for rule in &mut rules {
            if !seen.insert(rule.id.clone()) {
                return Err(ConfigError::InvalidRule {
                    rule: rule.id.clone(),
                    reason: "duplicate rule id".to_string(),
                });
            }
            rule.compile()?;
        }
        Ok(Self { rules })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: RuleFile = serde_json::from_str(json)
            .map_err(|e| ConfigError::ParseError(format!("rule file: {e}")))?;
        Self::new(file.rules)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn has_semantic(&self) -> bool {
        self.rules.iter().any(|r| r.when.is_semantic())
    }
}
