//! libSQL backend for the `Ledger` trait. Supports local file and in-memory
//! databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::ledger::migrations;
use crate::ledger::traits::{DeadLetter, FailedDispatch, Ledger, PendingRetry};
use crate::mailbox::{Message, MessageId, Watermark};

/// libSQL ledger.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let ledger = Self::from_database(db).await?;
        ledger.configure_durability().await?;
        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&ledger.conn).await?;
        Ok(ledger)
    }

    /// WAL journal with full fsync on commit: a recorded firing survives a
    /// power loss.
    async fn configure_durability(&self) -> Result<(), DatabaseError> {
        // journal_mode returns a row, so it goes through query().
        self.conn
            .query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;
        self.conn
            .execute("PRAGMA synchronous=FULL", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set synchronous=FULL: {e}")))?;
        Ok(())
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn exists(&self, sql: &str, mailbox: &str, message_id: MessageId, rule_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![mailbox, message_id.to_string(), rule_id])
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(row.is_some())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_message_id(s: &str) -> Result<MessageId, DatabaseError> {
    s.parse()
        .map_err(|e: String| DatabaseError::Query(format!("corrupt message id in ledger: {e}")))
}

fn col_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("Failed to read column: {e}"))
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("Failed to read row: {e}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Query(format!("Failed to encode ledger column: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Query(format!("corrupt {column} in ledger: {e}")))
}

#[async_trait]
impl Ledger for LibSqlLedger {
    async fn has_fired(
        &self,
        mailbox: &str,
        message_id: MessageId,
        rule_id: &str,
    ) -> Result<bool, DatabaseError> {
        self.exists(
            "SELECT 1 FROM match_records WHERE mailbox = ?1 AND message_id = ?2 AND rule_id = ?3",
            mailbox,
            message_id,
            rule_id,
        )
        .await
    }

    async fn record(
        &self,
        mailbox: &str,
        message_id: MessageId,
        rule_id: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO match_records (mailbox, message_id, rule_id, fired_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![mailbox, message_id.to_string(), rule_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        if inserted == 0 {
            debug!(mailbox, message = %message_id, rule = rule_id, "Match already recorded");
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        mailbox: &str,
        failure: &FailedDispatch<'_>,
    ) -> Result<u32, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let message_id = failure.message.id;
        let label = failure.label.map(str::to_string);
        let mut completed = failure.completed.to_vec();
        completed.sort_unstable();
        completed.dedup();

        self.conn()
            .execute(
                "INSERT INTO attempts
                    (mailbox, message_id, uid_validity, uid, rule_id, label, attempts, last_error,
                     updated_at, params, completed, message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (mailbox, message_id, rule_id) DO UPDATE SET
                    attempts = attempts + 1,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at,
                    completed = excluded.completed,
                    message = COALESCE(attempts.message, excluded.message)",
                params![
                    mailbox,
                    message_id.to_string(),
                    i64::from(message_id.uid_validity),
                    i64::from(message_id.uid),
                    failure.rule_id,
                    label,
                    failure.error,
                    now,
                    to_json(failure.params)?,
                    to_json(&completed)?,
                    to_json(failure.message)?
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut rows = self
            .conn()
            .query(
                "SELECT attempts FROM attempts WHERE mailbox = ?1 AND message_id = ?2 AND rule_id = ?3",
                params![mailbox, message_id.to_string(), failure.rule_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows.next().await.map_err(row_err)? {
            Some(row) => {
                let attempts: i64 = row.get(0).map_err(col_err)?;
                Ok(attempts as u32)
            }
            None => Err(DatabaseError::Query("attempt row vanished".to_string())),
        }
    }

    async fn clear_attempts(
        &self,
        mailbox: &str,
        message_id: MessageId,
        rule_id: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM attempts WHERE mailbox = ?1 AND message_id = ?2 AND rule_id = ?3",
                params![mailbox, message_id.to_string(), rule_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn pending_retries(&self, mailbox: &str) -> Result<Vec<PendingRetry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, rule_id, attempts, last_error, label, params, completed, message
                 FROM attempts
                 WHERE mailbox = ?1
                 ORDER BY uid_validity ASC, uid ASC, rule_id ASC",
                params![mailbox],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut pending = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err)? {
            let message_id: String = row.get(0).map_err(col_err)?;
            let attempts: i64 = row.get(2).map_err(col_err)?;
            let params: String = row.get(5).map_err(col_err)?;
            let completed: String = row.get(6).map_err(col_err)?;
            let message = match row.get::<Option<String>>(7).map_err(col_err)? {
                Some(json) => Some(from_json::<Message>("message snapshot", &json)?),
                None => None,
            };
            pending.push(PendingRetry {
                message_id: parse_message_id(&message_id)?,
                rule_id: row.get(1).map_err(col_err)?,
                attempts: attempts as u32,
                last_error: row.get(3).map_err(col_err)?,
                label: row.get::<Option<String>>(4).map_err(col_err)?,
                params: from_json("params", &params)?,
                completed: from_json("completed actions", &completed)?,
                message,
            });
        }
        Ok(pending)
    }

    async fn dead_letter(
        &self,
        mailbox: &str,
        message_id: MessageId,
        rule_id: &str,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to begin transaction: {e}")))?;

        tx.execute(
            "INSERT OR IGNORE INTO dead_letters (mailbox, message_id, rule_id, reason, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4,
                     COALESCE((SELECT attempts FROM attempts
                               WHERE mailbox = ?1 AND message_id = ?2 AND rule_id = ?3), 0),
                     ?5)",
            params![mailbox, message_id.to_string(), rule_id, reason, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

        tx.execute(
            "DELETE FROM attempts WHERE mailbox = ?1 AND message_id = ?2 AND rule_id = ?3",
            params![mailbox, message_id.to_string(), rule_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to commit dead letter: {e}")))?;
        Ok(())
    }

    async fn is_dead_lettered(
        &self,
        mailbox: &str,
        message_id: MessageId,
        rule_id: &str,
    ) -> Result<bool, DatabaseError> {
        self.exists(
            "SELECT 1 FROM dead_letters WHERE mailbox = ?1 AND message_id = ?2 AND rule_id = ?3",
            mailbox,
            message_id,
            rule_id,
        )
        .await
    }

    async fn list_dead_letters(
        &self,
        mailbox: Option<&str>,
    ) -> Result<Vec<DeadLetter>, DatabaseError> {
        let mut rows = match mailbox {
            Some(mailbox) => {
                self.conn()
                    .query(
                        "SELECT mailbox, message_id, rule_id, reason, attempts, created_at
                         FROM dead_letters WHERE mailbox = ?1 ORDER BY created_at DESC",
                        params![mailbox],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(
                        "SELECT mailbox, message_id, rule_id, reason, attempts, created_at
                         FROM dead_letters ORDER BY created_at DESC",
                        (),
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut letters = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err)? {
            let message_id: String = row.get(1).map_err(col_err)?;
            let attempts: i64 = row.get(4).map_err(col_err)?;
            let created_at: String = row.get(5).map_err(col_err)?;
            letters.push(DeadLetter {
                mailbox: row.get(0).map_err(col_err)?,
                message_id: parse_message_id(&message_id)?,
                rule_id: row.get(2).map_err(col_err)?,
                reason: row.get(3).map_err(col_err)?,
                attempts: attempts as u32,
                created_at: parse_datetime(&created_at),
            });
        }
        Ok(letters)
    }

    async fn load_watermark(&self, mailbox: &str) -> Result<Option<Watermark>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT uid_validity, last_uid FROM watermarks WHERE mailbox = ?1",
                params![mailbox],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        match rows.next().await.map_err(row_err)? {
            Some(row) => {
                let validity: i64 = row.get(0).map_err(col_err)?;
                let last_uid: i64 = row.get(1).map_err(col_err)?;
                Ok(Some(Watermark::new(validity as u32, last_uid as u32)))
            }
            None => Ok(None),
        }
    }

    async fn save_watermark(
        &self,
        mailbox: &str,
        watermark: Watermark,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO watermarks (mailbox, uid_validity, last_uid, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (mailbox) DO UPDATE SET
                    uid_validity = excluded.uid_validity,
                    last_uid = excluded.last_uid,
                    updated_at = excluded.updated_at",
                params![
                    mailbox,
                    i64::from(watermark.uid_validity),
                    i64::from(watermark.last_uid),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }
}
