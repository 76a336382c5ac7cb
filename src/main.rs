use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use mail_trigger::actions::{ActionDispatcher, HttpWebhookClient, MailSender, SmtpMailer};
use mail_trigger::config::Config;
use mail_trigger::engine::{Engine, EngineDeps, spawn_engine};
use mail_trigger::ledger::{Ledger, LibSqlLedger};
use mail_trigger::llm::{LlmClassifier, create_provider};
use mail_trigger::mailbox::{ImapMailbox, MailboxWatcher};
use mail_trigger::rules::{RuleMatcher, RuleSet};

/// Stderr logging, plus a daily-rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "mail-trigger.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export MAIL_TRIGGER_IMAP_HOST=imap.example.com");
        eprintln!("  export MAIL_TRIGGER_USERNAME=bot@example.com");
        eprintln!("  export MAIL_TRIGGER_PASSWORD=...");
        std::process::exit(1);
    });
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📬 Mail Trigger v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   IMAP: {}:{}", config.imap.host, config.imap.port);
    eprintln!("   Mailboxes: {}", config.mailboxes.join(", "));

    // ── Rules ───────────────────────────────────────────────────────────
    let rules = Arc::new(RuleSet::load(&config.rules_path).with_context(|| {
        format!("Failed to load rules from {}", config.rules_path.display())
    })?);
    eprintln!(
        "   Rules: {} from {}",
        rules.len(),
        config.rules_path.display()
    );

    // ── Ledger ──────────────────────────────────────────────────────────
    let ledger: Arc<dyn Ledger> = Arc::new(
        LibSqlLedger::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open ledger at {}", config.db_path.display()))?,
    );
    eprintln!("   Ledger: {}", config.db_path.display());

    // ── Classifier (only when a rule asks for one) ──────────────────────
    let matcher = if rules.has_semantic() {
        let llm = create_provider(&config.llm.provider_config()?)?;
        eprintln!(
            "   Classifier: {:?} ({})",
            config.llm.backend,
            llm.model_name()
        );
        Arc::new(RuleMatcher::new(Arc::new(LlmClassifier::new(
            llm,
            config.classifier.clone(),
        ))))
    } else {
        eprintln!("   Classifier: not needed");
        Arc::new(RuleMatcher::structural_only())
    };

    // ── Actions ─────────────────────────────────────────────────────────
    let mailer: Option<Arc<dyn MailSender>> = match &config.smtp {
        Some(smtp) => {
            eprintln!("   SMTP: {}:{} as {}", smtp.host, smtp.port, smtp.from_address);
            Some(Arc::new(SmtpMailer::new(smtp.clone())))
        }
        None => {
            eprintln!("   SMTP: disabled (Forward/Reply actions will fail)");
            None
        }
    };
    let dispatcher = Arc::new(ActionDispatcher::new(
        mailer,
        Arc::new(HttpWebhookClient::new()),
        config.action_timeout,
    ));

    // ── Engines ─────────────────────────────────────────────────────────
    let deps = EngineDeps {
        rules,
        matcher,
        dispatcher,
        ledger: Arc::clone(&ledger),
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(config.mailboxes.len());
    for mailbox in &config.mailboxes {
        let client = ImapMailbox::new(config.imap.clone(), mailbox.clone(), config.timeouts);
        let watcher = MailboxWatcher::new(Box::new(client), config.watcher.clone());
        let engine = Engine::new(
            watcher,
            deps.clone(),
            config.engine.clone(),
            shutdown_rx.clone(),
        );
        handles.push((mailbox.clone(), spawn_engine(engine)));
    }
    drop(shutdown_rx);
    eprintln!("   Engines: {} running. Ctrl-C to stop.\n", handles.len());

    let signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, stopping engines"),
            Err(e) => {
                error!(error = %e, "Cannot listen for interrupts");
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let mut failed = 0;
    for (mailbox, handle) in handles {
        match handle.await {
            Ok(Ok(stats)) => info!(
                mailbox = %mailbox,
                messages = stats.messages,
                fired = stats.fired,
                dead_lettered = stats.dead_lettered,
                "Engine finished"
            ),
            Ok(Err(e)) => {
                error!(mailbox = %mailbox, error = %e, "Engine failed");
                failed += 1;
            }
            Err(e) => {
                error!(mailbox = %mailbox, error = %e, "Engine task panicked");
                failed += 1;
            }
        }
    }
    signal.abort();

    let dead = ledger.list_dead_letters(None).await?;
    if !dead.is_empty() {
        warn!(count = dead.len(), "Dead letters awaiting attention");
        for letter in dead.iter().take(10) {
            warn!(
                mailbox = %letter.mailbox,
                message = %letter.message_id,
                rule = %letter.rule_id,
                reason = %letter.reason,
                "Dead letter"
            );
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} engine(s) stopped with an error");
    }
    Ok(())
}
