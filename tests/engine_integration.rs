//! Integration tests for the mailbox engine.
//!
//! Each test runs a real `Engine` against an in-memory mailbox fake, a
//! keyword-driven classifier, recording action sinks and an in-memory
//! ledger, then stops it through the shutdown signal.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use mail_trigger::actions::{ActionDispatcher, MailSender, OutgoingEmail, WebhookClient, WebhookRequest};
use mail_trigger::engine::{Engine, EngineConfig, EngineDeps, EngineStats, spawn_engine};
use mail_trigger::error::{
    ActionError, ClassifierError, Error, MailboxError, Result as EngineResult,
};
use mail_trigger::ledger::{Ledger, LibSqlLedger, UNREADABLE_RULE};
use mail_trigger::llm::{Classification, ClassifyQuery, SemanticClassifier};
use mail_trigger::mailbox::{
    MailboxClient, MailboxOps, MailboxWatcher, Message, MessageId, SelectInfo, WaitOutcome,
    WatcherConfig, Watermark,
};
use mail_trigger::retry::Backoff;
use mail_trigger::rules::{RuleMatcher, RuleSet};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const VALIDITY: u32 = 7;

// ── Mailbox fake ────────────────────────────────────────────────────

enum Entry {
    Readable(Message),
    Unreadable,
}

#[derive(Default)]
struct FakeState {
    entries: BTreeMap<u32, Entry>,
    connected: bool,
    connects: usize,
    waits: usize,
    reject_login: bool,
    /// Drop the connection when this UID is fetched (once).
    drop_on_fetch: Option<u32>,
    keywords: Vec<(u32, String)>,
    moves: Vec<(u32, String)>,
}

impl FakeState {
    fn add(&mut self, sender: &str, subject: &str, body: &str) -> u32 {
        let uid = self.entries.keys().next_back().copied().unwrap_or(0) + 1;
        let mut headers = BTreeMap::new();
        headers.insert("message-id".to_string(), format!("<{uid}@example.com>"));
        self.entries.insert(
            uid,
            Entry::Readable(Message {
                id: MessageId::new(VALIDITY, uid),
                mailbox: "INBOX".to_string(),
                sender: sender.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
                received_at: Utc::now(),
                headers,
            }),
        );
        uid
    }

    fn add_unreadable(&mut self) -> u32 {
        let uid = self.entries.keys().next_back().copied().unwrap_or(0) + 1;
        self.entries.insert(uid, Entry::Unreadable);
        uid
    }
}

struct FakeMailbox {
    state: Arc<Mutex<FakeState>>,
}

fn lost() -> MailboxError {
    MailboxError::Transport {
        mailbox: "INBOX".into(),
        reason: "connection reset".into(),
    }
}

#[async_trait]
impl MailboxOps for FakeMailbox {
    async fn move_message(&mut self, uid: u32, folder: &str) -> Result<(), MailboxError> {
        let mut state = self.state.lock().unwrap();
        state.moves.push((uid, folder.to_string()));
        state.entries.remove(&uid);
        Ok(())
    }

    async fn add_keyword(&mut self, uid: u32, keyword: &str) -> Result<(), MailboxError> {
        self.state
            .lock()
            .unwrap()
            .keywords
            .push((uid, keyword.to_string()));
        Ok(())
    }
}

#[async_trait]
impl MailboxClient for FakeMailbox {
    fn mailbox(&self) -> &str {
        "INBOX"
    }

    async fn connect(&mut self) -> Result<SelectInfo, MailboxError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_login {
            return Err(MailboxError::Auth {
                mailbox: "INBOX".into(),
                reason: "LOGIN rejected".into(),
            });
        }
        state.connected = true;
        state.connects += 1;
        let last = state.entries.keys().next_back().copied().unwrap_or(0);
        Ok(SelectInfo {
            uid_validity: VALIDITY,
            uid_next: last + 1,
        })
    }

    async fn uids_after(&mut self, after_uid: u32) -> Result<Vec<u32>, MailboxError> {
        let state = self.state.lock().unwrap();
        if !state.connected {
            return Err(lost());
        }
        Ok(state.entries.range(after_uid + 1..).map(|(uid, _)| *uid).collect())
    }

    async fn fetch(&mut self, uid: u32) -> Result<Option<Message>, MailboxError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(lost());
        }
        if state.drop_on_fetch == Some(uid) {
            state.drop_on_fetch = None;
            state.connected = false;
            return Err(lost());
        }
        match state.entries.get(&uid) {
            Some(Entry::Readable(message)) => Ok(Some(message.clone())),
            Some(Entry::Unreadable) => Err(MailboxError::Unparseable {
                mailbox: "INBOX".into(),
                uid,
            }),
            None => Ok(None),
        }
    }

    async fn wait_for_change(&mut self) -> Result<WaitOutcome, MailboxError> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(lost());
            }
            state.waits += 1;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(WaitOutcome::Timeout)
    }

    async fn disconnect(&mut self) {
        self.state.lock().unwrap().connected = false;
    }

    fn ops(&mut self) -> &mut dyn MailboxOps {
        self
    }
}

// ── Classifier & action sinks ───────────────────────────────────────

/// Picks the first label that appears in the text. Each requested parameter
/// comes back as `"<name>:<label>"`.
#[derive(Default)]
struct KeywordClassifier {
    down: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl SemanticClassifier for KeywordClassifier {
    async fn classify(
        &self,
        text: &str,
        query: &ClassifyQuery<'_>,
    ) -> Result<Classification, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down {
            return Err(ClassifierError::Unavailable {
                attempts: 4,
                reason: "rate limited".into(),
            });
        }
        let lower = text.to_lowercase();
        let labels = query.labels;
        let (label, confidence) = match labels.iter().find(|l| lower.contains(&l.to_lowercase())) {
            Some(label) => (label.clone(), 0.95),
            None => (labels[labels.len() - 1].clone(), 0.55),
        };
        let params = query
            .extract
            .keys()
            .map(|name| (name.clone(), format!("{name}:{label}")))
            .collect();
        Ok(Classification {
            label,
            confidence,
            confident: confidence >= query.threshold,
            params,
        })
    }
}

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
}

#[async_trait]
impl MailSender for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), ActionError> {
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingWebhooks {
    keys: Mutex<Vec<String>>,
    failing: bool,
}

#[async_trait]
impl WebhookClient for RecordingWebhooks {
    async fn post(&self, request: &WebhookRequest) -> Result<(), ActionError> {
        self.keys.lock().unwrap().push(request.idempotency_key.clone());
        if self.failing {
            return Err(ActionError::Failed {
                kind: "webhook".into(),
                reason: "HTTP 503".into(),
            });
        }
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    mailbox: Arc<Mutex<FakeState>>,
    ledger: Arc<LibSqlLedger>,
    mailer: Arc<RecordingMailer>,
    webhooks: Arc<RecordingWebhooks>,
    classifier: Arc<KeywordClassifier>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<EngineResult<EngineStats>>,
}

impl Harness {
    async fn new(classifier: KeywordClassifier, webhooks: RecordingWebhooks) -> Self {
        Self {
            mailbox: Arc::new(Mutex::new(FakeState::default())),
            ledger: Arc::new(LibSqlLedger::new_memory().await.unwrap()),
            mailer: Arc::new(RecordingMailer::default()),
            webhooks: Arc::new(webhooks),
            classifier: Arc::new(classifier),
        }
    }

    fn start(&self, rules_json: &str) -> Running {
        let rules = Arc::new(RuleSet::from_json(rules_json).unwrap());
        let deps = EngineDeps {
            rules,
            matcher: Arc::new(RuleMatcher::new(self.classifier.clone())),
            dispatcher: Arc::new(ActionDispatcher::new(
                Some(self.mailer.clone() as Arc<dyn MailSender>),
                self.webhooks.clone(),
                Duration::from_secs(1),
            )),
            ledger: self.ledger.clone(),
        };
        let watcher = MailboxWatcher::new(
            Box::new(FakeMailbox {
                state: Arc::clone(&self.mailbox),
            }),
            WatcherConfig {
                backfill: true,
                batch_size: 50,
                reconnect: Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 3),
            },
        );
        let config = EngineConfig {
            max_rule_attempts: 3,
            self_address: Some("bot@example.com".to_string()),
        };
        let (shutdown, rx) = watch::channel(false);
        let handle = spawn_engine(Engine::new(watcher, deps, config, rx));
        Running { shutdown, handle }
    }

    fn waits(&self) -> usize {
        self.mailbox.lock().unwrap().waits
    }

    /// Let the engine go idle a few more times so late duplicates would show.
    async fn settle(&self) {
        let target = self.waits() + 3;
        eventually("engine to settle", || self.waits() >= target).await;
    }

    fn sent(&self) -> Vec<OutgoingEmail> {
        self.mailer.sent.lock().unwrap().clone()
    }

    fn webhook_keys(&self) -> Vec<String> {
        self.webhooks.keys.lock().unwrap().clone()
    }
}

impl Running {
    async fn stop(self) -> EngineStats {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(TEST_TIMEOUT, self.handle)
            .await
            .expect("engine did not stop")
            .expect("engine task panicked")
            .expect("engine returned an error")
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

const INVOICE_RULES: &str = r#"{
    "rules": [
        {
            "id": "invoices",
            "when": {"type": "semantic", "labels": ["invoice", "other"], "expect": "invoice"},
            "actions": [
                {"type": "tag", "keyword": "invoice"},
                {"type": "forward", "to": "accounting@example.com"}
            ]
        }
    ]
}"#;

const ALERT_WEBHOOK_RULES: &str = r#"{
    "rules": [
        {
            "id": "alerts",
            "when": {"type": "structural", "field": "subject", "op": "contains", "value": "alert"},
            "actions": [{"type": "webhook", "url": "https://hooks.example.com/alerts"}]
        }
    ]
}"#;

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn invoice_is_tagged_and_forwarded_exactly_once() {
    let h = Harness::new(KeywordClassifier::default(), RecordingWebhooks::default()).await;
    let (invoice, lunch) = {
        let mut mb = h.mailbox.lock().unwrap();
        (
            mb.add("billing@vendor.com", "Invoice #4411", "Please find the invoice attached."),
            mb.add("friend@example.com", "Lunch?", "Tacos on Friday?"),
        )
    };

    let run = h.start(INVOICE_RULES);
    eventually("the forward", || h.sent().len() == 1).await;
    h.settle().await;
    let stats = run.stop().await;

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "accounting@example.com");
    assert_eq!(sent[0].subject, "Fwd: Invoice #4411");
    assert_eq!(
        h.mailbox.lock().unwrap().keywords,
        vec![(invoice, "invoice".to_string())]
    );

    let ledger: &dyn Ledger = h.ledger.as_ref();
    assert!(ledger.has_fired("INBOX", MessageId::new(VALIDITY, invoice), "invoices").await.unwrap());
    assert!(!ledger.has_fired("INBOX", MessageId::new(VALIDITY, lunch), "invoices").await.unwrap());
    assert_eq!(
        ledger.load_watermark("INBOX").await.unwrap(),
        Some(Watermark::new(VALIDITY, lunch))
    );
    assert_eq!(stats.fired, 1);
    assert_eq!(stats.messages, 2);
}

#[tokio::test]
async fn new_mail_after_start_is_picked_up() {
    let h = Harness::new(KeywordClassifier::default(), RecordingWebhooks::default()).await;
    let run = h.start(INVOICE_RULES);
    eventually("first idle", || h.waits() > 0).await;

    h.mailbox
        .lock()
        .unwrap()
        .add("billing@vendor.com", "Your invoice", "Invoice for March.");
    eventually("the forward", || h.sent().len() == 1).await;
    run.stop().await;
}

#[tokio::test]
async fn replaying_the_stream_dispatches_nothing_twice() {
    let h = Harness::new(KeywordClassifier::default(), RecordingWebhooks::default()).await;
    {
        let mut mb = h.mailbox.lock().unwrap();
        mb.add("billing@vendor.com", "Invoice 1", "invoice");
        mb.add("billing@vendor.com", "Invoice 2", "invoice");
        mb.add("noc@example.com", "alert: disk", "disk full");
    }

    let rules = r#"{
        "rules": [
            {
                "id": "invoices",
                "when": {"type": "semantic", "labels": ["invoice", "other"], "expect": "invoice"},
                "actions": [{"type": "forward", "to": "accounting@example.com"}]
            },
            {
                "id": "alerts",
                "when": {"type": "structural", "field": "subject", "op": "starts_with", "value": "ALERT"},
                "actions": [{"type": "webhook", "url": "https://hooks.example.com/alerts"}]
            }
        ]
    }"#;

    let run = h.start(rules);
    eventually("all dispatches", || h.sent().len() == 2 && h.webhook_keys().len() == 1).await;
    run.stop().await;

    // Rewind the watermark so the same messages are surfaced again.
    h.ledger
        .save_watermark("INBOX", Watermark::new(VALIDITY, 0))
        .await
        .unwrap();
    let run = h.start(rules);
    eventually("replay to reach the end", || {
        h.mailbox.lock().unwrap().connects >= 2
    })
    .await;
    h.settle().await;
    let stats = run.stop().await;

    assert_eq!(h.sent().len(), 2);
    assert_eq!(h.webhook_keys().len(), 1);
    assert_eq!(stats.fired, 0);
    assert_eq!(stats.messages, 3);
}

#[tokio::test]
async fn disconnect_mid_poll_resumes_without_loss_or_duplication() {
    let h = Harness::new(KeywordClassifier::default(), RecordingWebhooks::default()).await;
    {
        let mut mb = h.mailbox.lock().unwrap();
        mb.add("noc@example.com", "alert 1", "");
        let second = mb.add("noc@example.com", "alert 2", "");
        mb.add("noc@example.com", "alert 3", "");
        mb.drop_on_fetch = Some(second);
    }

    let run = h.start(ALERT_WEBHOOK_RULES);
    eventually("three webhooks", || h.webhook_keys().len() >= 3).await;
    h.settle().await;
    run.stop().await;

    let keys = h.webhook_keys();
    assert_eq!(keys.len(), 3, "got {keys:?}");
    let distinct: HashSet<&String> = keys.iter().collect();
    assert_eq!(distinct.len(), 3, "duplicate deliveries: {keys:?}");
    assert!(h.mailbox.lock().unwrap().connects >= 2);
}

#[tokio::test]
async fn classifier_outage_never_fires_semantic_rules() {
    let h = Harness::new(
        KeywordClassifier {
            down: true,
            ..Default::default()
        },
        RecordingWebhooks::default(),
    )
    .await;
    let uid = h
        .mailbox
        .lock()
        .unwrap()
        .add("billing@vendor.com", "alert: invoice overdue", "invoice");

    let rules = r#"{
        "rules": [
            {
                "id": "invoices",
                "when": {"type": "semantic", "labels": ["invoice", "other"], "expect": "invoice"},
                "actions": [{"type": "forward", "to": "accounting@example.com"}]
            },
            {
                "id": "not-spam",
                "when": {"type": "not", "predicate":
                    {"type": "semantic", "labels": ["spam", "ham"], "expect": "spam"}},
                "actions": [{"type": "tag", "keyword": "ham"}]
            },
            {
                "id": "alerts",
                "when": {"type": "structural", "field": "subject", "op": "contains", "value": "alert"},
                "actions": [{"type": "webhook", "url": "https://hooks.example.com/alerts"}]
            }
        ]
    }"#;

    let run = h.start(rules);
    eventually("the structural rule", || h.webhook_keys().len() == 1).await;
    h.settle().await;
    run.stop().await;

    assert!(h.sent().is_empty());
    assert!(h.mailbox.lock().unwrap().keywords.is_empty());
    assert!(h.classifier.calls.load(Ordering::SeqCst) >= 1);
    let ledger: &dyn Ledger = h.ledger.as_ref();
    let id = MessageId::new(VALIDITY, uid);
    assert!(ledger.has_fired("INBOX", id, "alerts").await.unwrap());
    assert!(!ledger.has_fired("INBOX", id, "invoices").await.unwrap());
    assert!(!ledger.has_fired("INBOX", id, "not-spam").await.unwrap());
}

#[tokio::test]
async fn failing_rule_is_dead_lettered_after_the_cap() {
    let h = Harness::new(
        KeywordClassifier::default(),
        RecordingWebhooks {
            failing: true,
            ..Default::default()
        },
    )
    .await;
    let uid = h
        .mailbox
        .lock()
        .unwrap()
        .add("noc@example.com", "alert: db down", "");

    let run = h.start(ALERT_WEBHOOK_RULES);
    eventually("three attempts", || h.webhook_keys().len() >= 3).await;
    h.settle().await;
    let stats = run.stop().await;

    // Same key on every attempt, and no fourth attempt.
    let keys = h.webhook_keys();
    assert_eq!(keys.len(), 3);
    assert!(keys.iter().all(|k| k == &keys[0]));
    assert_eq!(stats.failed_attempts, 3);
    assert_eq!(stats.dead_lettered, 1);

    let ledger: &dyn Ledger = h.ledger.as_ref();
    let id = MessageId::new(VALIDITY, uid);
    assert!(ledger.is_dead_lettered("INBOX", id, "alerts").await.unwrap());
    assert!(!ledger.has_fired("INBOX", id, "alerts").await.unwrap());
    assert!(ledger.pending_retries("INBOX").await.unwrap().is_empty());
    let dead = ledger.list_dead_letters(Some("INBOX")).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert!(dead[0].reason.contains("HTTP 503"), "reason: {}", dead[0].reason);
}

#[tokio::test]
async fn unreadable_message_is_dead_lettered_and_skipped() {
    let h = Harness::new(KeywordClassifier::default(), RecordingWebhooks::default()).await;
    let (broken, fine) = {
        let mut mb = h.mailbox.lock().unwrap();
        (mb.add_unreadable(), mb.add("noc@example.com", "alert: fan", ""))
    };

    let run = h.start(ALERT_WEBHOOK_RULES);
    eventually("the webhook", || h.webhook_keys().len() == 1).await;
    h.settle().await;
    run.stop().await;

    let ledger: &dyn Ledger = h.ledger.as_ref();
    assert!(
        ledger
            .is_dead_lettered("INBOX", MessageId::new(VALIDITY, broken), UNREADABLE_RULE)
            .await
            .unwrap()
    );
    assert_eq!(
        ledger.load_watermark("INBOX").await.unwrap(),
        Some(Watermark::new(VALIDITY, fine))
    );
}

#[tokio::test]
async fn self_sent_mail_is_ignored() {
    let h = Harness::new(KeywordClassifier::default(), RecordingWebhooks::default()).await;
    h.mailbox
        .lock()
        .unwrap()
        .add("BOT@example.com", "alert: loop", "");

    let run = h.start(ALERT_WEBHOOK_RULES);
    eventually("first idle", || h.waits() > 0).await;
    h.settle().await;
    let stats = run.stop().await;

    assert!(h.webhook_keys().is_empty());
    assert_eq!(stats.skipped_self, 1);
}

#[tokio::test]
async fn rejected_login_halts_the_engine() {
    let h = Harness::new(KeywordClassifier::default(), RecordingWebhooks::default()).await;
    h.mailbox.lock().unwrap().reject_login = true;

    let run = h.start(ALERT_WEBHOOK_RULES);
    let result = tokio::time::timeout(TEST_TIMEOUT, run.handle)
        .await
        .expect("engine did not stop")
        .expect("engine task panicked");
    assert!(matches!(
        result,
        Err(Error::Mailbox(MailboxError::Auth { .. }))
    ));
}

#[tokio::test]
async fn move_action_removes_message_from_folder() {
    let h = Harness::new(KeywordClassifier::default(), RecordingWebhooks::default()).await;
    let uid = h
        .mailbox
        .lock()
        .unwrap()
        .add("noc@example.com", "alert: archive me", "");

    let rules = r#"{
        "rules": [
            {
                "id": "archive",
                "when": {"type": "structural", "field": "sender", "op": "ends_with", "value": "@example.com"},
                "actions": [{"type": "move", "folder": "Archive"}]
            }
        ]
    }"#;
    let run = h.start(rules);
    eventually("the move", || !h.mailbox.lock().unwrap().moves.is_empty()).await;
    h.settle().await;
    run.stop().await;

    assert_eq!(
        h.mailbox.lock().unwrap().moves,
        vec![(uid, "Archive".to_string())]
    );
}

#[tokio::test]
async fn rule_that_moved_the_message_is_retried_up_to_the_cap() {
    let h = Harness::new(
        KeywordClassifier::default(),
        RecordingWebhooks {
            failing: true,
            ..Default::default()
        },
    )
    .await;
    let uid = h
        .mailbox
        .lock()
        .unwrap()
        .add("noc@example.com", "alert: archive and notify", "");

    let rules = r#"{
        "rules": [
            {
                "id": "archive-and-notify",
                "when": {"type": "structural", "field": "subject", "op": "contains", "value": "alert"},
                "actions": [
                    {"type": "move", "folder": "Archive"},
                    {"type": "webhook", "url": "https://hooks.example.com/alerts"}
                ]
            }
        ]
    }"#;
    let run = h.start(rules);
    eventually("three webhook attempts", || h.webhook_keys().len() >= 3).await;
    h.settle().await;
    let stats = run.stop().await;

    // The move ran once; only the failed webhook was retried.
    assert_eq!(
        h.mailbox.lock().unwrap().moves,
        vec![(uid, "Archive".to_string())]
    );
    assert_eq!(h.webhook_keys().len(), 3);
    assert_eq!(stats.failed_attempts, 3);

    let ledger: &dyn Ledger = h.ledger.as_ref();
    let dead = ledger.list_dead_letters(Some("INBOX")).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert!(dead[0].reason.contains("HTTP 503"), "reason: {}", dead[0].reason);
}

#[tokio::test]
async fn later_rule_does_not_tag_a_moved_message() {
    let h = Harness::new(KeywordClassifier::default(), RecordingWebhooks::default()).await;
    let uid = h
        .mailbox
        .lock()
        .unwrap()
        .add("noc@example.com", "alert: archive me", "");

    let rules = r#"{
        "rules": [
            {
                "id": "archive",
                "when": {"type": "structural", "field": "subject", "op": "contains", "value": "archive"},
                "actions": [{"type": "move", "folder": "Archive"}]
            },
            {
                "id": "tagger",
                "when": {"type": "structural", "field": "subject", "op": "contains", "value": "alert"},
                "actions": [{"type": "tag", "keyword": "alert"}]
            }
        ]
    }"#;
    let run = h.start(rules);
    let ledger: &dyn Ledger = h.ledger.as_ref();
    let id = MessageId::new(VALIDITY, uid);
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !ledger.is_dead_lettered("INBOX", id, "tagger").await.unwrap() {
        assert!(Instant::now() < deadline, "tagger was never dead-lettered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    run.stop().await;

    assert!(h.mailbox.lock().unwrap().keywords.is_empty());
    assert!(ledger.has_fired("INBOX", id, "archive").await.unwrap());
    let dead = ledger.list_dead_letters(Some("INBOX")).await.unwrap();
    assert_eq!(dead[0].rule_id, "tagger");
    assert!(dead[0].reason.contains("tag"), "reason: {}", dead[0].reason);
}

#[tokio::test]
async fn extracted_params_fill_the_reply() {
    let h = Harness::new(KeywordClassifier::default(), RecordingWebhooks::default()).await;
    h.mailbox
        .lock()
        .unwrap()
        .add("billing@vendor.com", "Invoice #7", "Please pay the invoice.");

    let rules = r#"{
        "rules": [
            {
                "id": "ack",
                "when": {"type": "semantic", "labels": ["invoice", "other"], "expect": "invoice",
                         "extract": {"reply": "a one-line acknowledgement"}},
                "actions": [{"type": "reply", "body": "{{param.reply}} ({{subject}})"}]
            }
        ]
    }"#;
    let run = h.start(rules);
    eventually("the reply", || h.sent().len() == 1).await;
    run.stop().await;

    let sent = h.sent();
    assert_eq!(sent[0].to, "billing@vendor.com");
    assert_eq!(sent[0].body, "reply:invoice (Invoice #7)");
}
