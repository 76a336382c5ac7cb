//! Configuration loaded from `MAIL_TRIGGER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::actions::SmtpConfig;
use crate::engine::EngineConfig;
use crate::error::ConfigError;
use crate::llm::{ClassifierConfig, LlmBackend, LlmConfig};
use crate::mailbox::{ImapCredentials, ImapTimeouts, WatcherConfig};

const PREFIX: &str = "MAIL_TRIGGER_";

/// Everything the binary needs to start the engines.
#[derive(Debug, Clone)]
pub struct Config {
    pub imap: ImapCredentials,
    /// Folders to watch, one engine each.
    pub mailboxes: Vec<String>,
    pub timeouts: ImapTimeouts,
    pub watcher: WatcherConfig,
    /// Outgoing mail; `Forward` and `Reply` fail without it.
    pub smtp: Option<SmtpConfig>,
    pub from_address: String,
    pub rules_path: PathBuf,
    pub db_path: PathBuf,
    pub engine: EngineConfig,
    pub action_timeout: Duration,
    pub classifier: ClassifierConfig,
    pub llm: LlmSettings,
    /// Directory for a daily-rolling log file in addition to stderr.
    pub log_dir: Option<PathBuf>,
}

/// LLM selection. The key is only required once a rule needs the classifier.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub backend: LlmBackend,
    pub model: String,
    pub api_key: Option<SecretString>,
}

impl LlmSettings {
    /// Provider config, failing if the backend's API key is missing.
    pub fn provider_config(&self) -> Result<LlmConfig, ConfigError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::MissingEnvVar(self.backend.api_key_var().to_string()))?;
        Ok(LlmConfig {
            backend: self.backend,
            api_key,
            model: self.model.clone(),
        })
    }
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let imap_host = env.required("IMAP_HOST")?;
        let username = env.required("USERNAME")?;
        let password = SecretString::from(env.required("PASSWORD")?);
        let imap = ImapCredentials {
            host: imap_host,
            port: env.parse("IMAP_PORT", 993)?,
            username: username.clone(),
            password: password.clone(),
        };

        let mailboxes: Vec<String> = env
            .optional("MAILBOXES")
            .unwrap_or_else(|| "INBOX".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if mailboxes.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}MAILBOXES"),
                message: "at least one mailbox is required".to_string(),
            });
        }

        let timeouts = ImapTimeouts {
            poll_interval: Duration::from_secs(env.parse("POLL_INTERVAL_SECS", 60)?),
            idle: Duration::from_secs(env.parse("IDLE_TIMEOUT_SECS", 15 * 60)?),
            ..ImapTimeouts::default()
        };

        let mut watcher = WatcherConfig {
            backfill: env.flag("BACKFILL")?,
            ..WatcherConfig::default()
        };
        watcher.reconnect.max_attempts = env.parse("MAX_RECONNECT_ATTEMPTS", 8)?;

        let from_address = env
            .optional("FROM_ADDRESS")
            .unwrap_or_else(|| username.clone());

        let action_timeout = Duration::from_secs(env.parse("ACTION_TIMEOUT_SECS", 30)?);
        if action_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}ACTION_TIMEOUT_SECS"),
                message: "must be at least 1".to_string(),
            });
        }

        let smtp = match env.optional("SMTP_HOST") {
            Some(host) => {
                let default_secs = (action_timeout.as_secs() / 3).max(1);
                let timeout = Duration::from_secs(env.parse("SMTP_TIMEOUT_SECS", default_secs)?);
                if timeout.is_zero() || timeout >= action_timeout {
                    return Err(ConfigError::InvalidValue {
                        key: format!("{PREFIX}SMTP_TIMEOUT_SECS"),
                        message: format!(
                            "must be between 1 and {} (below ACTION_TIMEOUT_SECS)",
                            action_timeout.as_secs().saturating_sub(1)
                        ),
                    });
                }
                Some(SmtpConfig {
                    host,
                    port: env.parse("SMTP_PORT", 587)?,
                    username,
                    password,
                    from_address: from_address.clone(),
                    timeout,
                })
            }
            None => None,
        };

        let engine = EngineConfig {
            max_rule_attempts: env.parse("MAX_RULE_ATTEMPTS", 3)?,
            self_address: (!from_address.is_empty()).then(|| from_address.clone()),
        };
        if engine.max_rule_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}MAX_RULE_ATTEMPTS"),
                message: "must be at least 1".to_string(),
            });
        }

        let classifier = ClassifierConfig {
            request_timeout: Duration::from_secs(env.parse("CLASSIFIER_TIMEOUT_SECS", 30)?),
            max_input_chars: env.parse("CLASSIFIER_MAX_INPUT_CHARS", 8000)?,
            ..ClassifierConfig::default()
        }
        .with_retries(env.parse("CLASSIFIER_MAX_RETRIES", 3)?);

        let backend: LlmBackend = match env.optional("LLM_BACKEND") {
            Some(value) => value.parse()?,
            None => LlmBackend::Anthropic,
        };
        let llm = LlmSettings {
            backend,
            model: env
                .optional("MODEL")
                .unwrap_or_else(|| backend.default_model().to_string()),
            api_key: (env.lookup)(backend.api_key_var())
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        };

        Ok(Self {
            imap,
            mailboxes,
            timeouts,
            watcher,
            smtp,
            from_address,
            rules_path: env
                .optional("RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./rules.json")),
            db_path: env
                .optional("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/mail-trigger.db")),
            engine,
            action_timeout,
            classifier,
            llm,
            log_dir: env.optional("LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Prefixed variable access.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{name}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.optional(name)
            .ok_or_else(|| ConfigError::MissingEnvVar(format!("{PREFIX}{name}")))
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: format!("{PREFIX}{name}"),
                message: format!("'{raw}': {e}"),
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str) -> Result<bool, ConfigError> {
        match self.optional(name).map(|v| v.to_lowercase()).as_deref() {
            None => Ok(false),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::InvalidValue {
                key: format!("{PREFIX}{name}"),
                message: format!("'{other}' is not a boolean"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    const MINIMAL: [(&str, &str); 3] = [
        ("MAIL_TRIGGER_IMAP_HOST", "imap.example.com"),
        ("MAIL_TRIGGER_USERNAME", "bot@example.com"),
        ("MAIL_TRIGGER_PASSWORD", "hunter2"),
    ];

    #[test]
    fn minimal_config_uses_defaults() {
        let config = load(&MINIMAL).unwrap();
        assert_eq!(config.imap.port, 993);
        assert_eq!(config.mailboxes, vec!["INBOX"]);
        assert_eq!(config.timeouts.poll_interval, Duration::from_secs(60));
        assert_eq!(config.timeouts.idle, Duration::from_secs(900));
        assert!(!config.watcher.backfill);
        assert_eq!(config.watcher.reconnect.max_attempts, 8);
        assert!(config.smtp.is_none());
        assert_eq!(config.from_address, "bot@example.com");
        assert_eq!(config.engine.self_address.as_deref(), Some("bot@example.com"));
        assert_eq!(config.engine.max_rule_attempts, 3);
        assert_eq!(config.action_timeout, Duration::from_secs(30));
        assert_eq!(config.classifier.backoff.max_attempts, 4);
        assert_eq!(config.classifier.max_input_chars, 8000);
        assert_eq!(config.rules_path, PathBuf::from("./rules.json"));
        assert_eq!(config.llm.backend, LlmBackend::Anthropic);
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn missing_host_is_reported() {
        let err = load(&MINIMAL[1..]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "MAIL_TRIGGER_IMAP_HOST"));
    }

    #[test]
    fn invalid_number_is_reported_with_key() {
        let mut vars = MINIMAL.to_vec();
        vars.push(("MAIL_TRIGGER_IMAP_PORT", "imaps"));
        match load(&vars).unwrap_err() {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "MAIL_TRIGGER_IMAP_PORT"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mailbox_list_and_smtp() {
        let mut vars = MINIMAL.to_vec();
        vars.extend([
            ("MAIL_TRIGGER_MAILBOXES", "INBOX, Support ,,Billing"),
            ("MAIL_TRIGGER_SMTP_HOST", "smtp.example.com"),
            ("MAIL_TRIGGER_FROM_ADDRESS", "alerts@example.com"),
            ("MAIL_TRIGGER_BACKFILL", "yes"),
        ]);
        let config = load(&vars).unwrap();
        assert_eq!(config.mailboxes, vec!["INBOX", "Support", "Billing"]);
        let smtp = config.smtp.unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.from_address, "alerts@example.com");
        assert_eq!(smtp.timeout, Duration::from_secs(10));
        assert!(config.watcher.backfill);
        assert_eq!(config.engine.self_address.as_deref(), Some("alerts@example.com"));
    }

    #[test]
    fn smtp_timeout_must_stay_below_action_timeout() {
        let mut vars = MINIMAL.to_vec();
        vars.extend([
            ("MAIL_TRIGGER_SMTP_HOST", "smtp.example.com"),
            ("MAIL_TRIGGER_ACTION_TIMEOUT_SECS", "20"),
            ("MAIL_TRIGGER_SMTP_TIMEOUT_SECS", "20"),
        ]);
        match load(&vars).unwrap_err() {
            ConfigError::InvalidValue { key, .. } => {
                assert_eq!(key, "MAIL_TRIGGER_SMTP_TIMEOUT_SECS")
            }
            other => panic!("unexpected error: {other}"),
        }

        vars.pop();
        vars.push(("MAIL_TRIGGER_SMTP_TIMEOUT_SECS", "5"));
        assert_eq!(load(&vars).unwrap().smtp.unwrap().timeout, Duration::from_secs(5));
    }

    #[test]
    fn bad_flag_is_rejected() {
        let mut vars = MINIMAL.to_vec();
        vars.push(("MAIL_TRIGGER_BACKFILL", "sometimes"));
        assert!(matches!(load(&vars), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn zero_rule_attempts_is_rejected() {
        let mut vars = MINIMAL.to_vec();
        vars.push(("MAIL_TRIGGER_MAX_RULE_ATTEMPTS", "0"));
        assert!(load(&vars).is_err());
    }

    #[test]
    fn llm_backend_and_key() {
        let mut vars = MINIMAL.to_vec();
        vars.extend([
            ("MAIL_TRIGGER_LLM_BACKEND", "openai"),
            ("OPENAI_API_KEY", "sk-test"),
            ("MAIL_TRIGGER_CLASSIFIER_MAX_RETRIES", "1"),
        ]);
        let config = load(&vars).unwrap();
        assert_eq!(config.llm.backend, LlmBackend::OpenAi);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.classifier.backoff.max_attempts, 2);
        let provider = config.llm.provider_config().unwrap();
        assert_eq!(provider.api_key.expose_secret(), "sk-test");
    }

    #[test]
    fn provider_config_requires_key() {
        let config = load(&MINIMAL).unwrap();
        match config.llm.provider_config().unwrap_err() {
            ConfigError::MissingEnvVar(var) => assert_eq!(var, "ANTHROPIC_API_KEY"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
