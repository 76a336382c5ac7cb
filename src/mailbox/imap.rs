//! IMAP over TLS: a small blocking session plus the async `ImapMailbox`
//! adapter that runs it on the blocking pool.
//!
//! Only the commands the engine needs are implemented: LOGIN, SELECT,
//! CAPABILITY, UID SEARCH, UID FETCH, IDLE, UID MOVE (or COPY + STORE),
//! UID STORE, NOOP and LOGOUT.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::cancel::{CancelFlag, CancelOnDrop};
use crate::error::MailboxError;
use crate::mailbox::types::{Message, MessageId, decode_message, parse_internal_date};
use crate::mailbox::{MailboxClient, MailboxOps, SelectInfo, WaitOutcome};

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// How long one IDLE read blocks before checking for cancellation.
const IDLE_SLICE: Duration = Duration::from_secs(1);

static FETCH_UID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bUID (\d+)").expect("static regex"));
static FETCH_INTERNALDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"INTERNALDATE "([^"]+)""#).expect("static regex"));

/// Where and how to log in.
#[derive(Debug, Clone)]
pub struct ImapCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

/// Time bounds for every IMAP suspension point.
#[derive(Debug, Clone, Copy)]
pub struct ImapTimeouts {
    /// Socket read/write timeout for ordinary commands.
    pub io: Duration,
    /// Maximum length of a single IDLE before it is renewed.
    pub idle: Duration,
    /// Sleep between polls when the server lacks IDLE.
    pub poll_interval: Duration,
}

impl Default for ImapTimeouts {
    fn default() -> Self {
        Self {
            io: Duration::from_secs(30),
            idle: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(60),
        }
    }
}

// ── Response model ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// One logical response line with any literals it carried.
#[derive(Debug, Default)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct TaggedResponse {
    untagged: Vec<ResponseLine>,
    status: Status,
    text: String,
}

/// Length of a trailing `{n}` literal marker, if present.
fn literal_len(line: &str) -> Option<usize> {
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].trim_end_matches('+').parse().ok()
}

/// Quote an IMAP string argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Parse `[KEY n]` out of a response text.
fn bracket_number(text: &str, key: &str) -> Option<u32> {
    let start = text.find(&format!("[{key} "))? + key.len() + 2;
    let rest = &text[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

fn parse_search(untagged: &[ResponseLine]) -> Vec<u32> {
    let mut uids: Vec<u32> = untagged
        .iter()
        .filter_map(|l| l.text.strip_prefix("* SEARCH"))
        .flat_map(|rest| {
            rest.split_whitespace()
                .filter_map(|n| n.parse().ok())
                .collect::<Vec<u32>>()
        })
        .collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Keywords must be IMAP atoms; system flags may carry a leading backslash.
fn is_valid_keyword(keyword: &str) -> bool {
    let atom = keyword.strip_prefix('\\').unwrap_or(keyword);
    !atom.is_empty()
        && atom
            .chars()
            .all(|c| c.is_ascii_graphic() && !"(){%*\"\\]".contains(c))
}

// ── Blocking session ────────────────────────────────────────────────

/// An authenticated IMAP session with one folder selected.
pub struct ImapSession {
    reader: BufReader<TlsStream>,
    next_tag: u32,
    mailbox: String,
    capabilities: Vec<String>,
    io_timeout: Duration,
    /// Bytes of a line cut short by a read timeout.
    partial: Vec<u8>,
    cancel: CancelFlag,
}

impl ImapSession {
    /// Connect, log in and select `mailbox`.
    pub fn connect(
        creds: &ImapCredentials,
        mailbox: &str,
        io_timeout: Duration,
    ) -> Result<(Self, SelectInfo), MailboxError> {
        let transport = |reason: String| MailboxError::Transport {
            mailbox: mailbox.to_string(),
            reason,
        };

        let addr = (creds.host.as_str(), creds.port)
            .to_socket_addrs()
            .map_err(|e| transport(format!("resolve {}: {e}", creds.host)))?
            .next()
            .ok_or_else(|| transport(format!("no address for {}", creds.host)))?;
        let tcp = TcpStream::connect_timeout(&addr, io_timeout)
            .map_err(|e| transport(format!("connect {addr}: {e}")))?;
        tcp.set_read_timeout(Some(io_timeout))
            .and_then(|_| tcp.set_write_timeout(Some(io_timeout)))
            .map_err(|e| transport(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(creds.host.clone())
            .map_err(|e| transport(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| transport(format!("TLS setup: {e}")))?;

        let mut session = Self {
            reader: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
            mailbox: mailbox.to_string(),
            capabilities: Vec::new(),
            io_timeout,
            partial: Vec::new(),
            cancel: CancelFlag::default(),
        };

        let greeting = session
            .read_response_line()
            .map_err(|e| transport(format!("greeting: {e}")))?;
        if greeting.text.starts_with("* BYE") {
            return Err(transport(format!("server refused: {}", greeting.text)));
        }

        let login = session.command(&format!(
            "LOGIN {} {}",
            quote(&creds.username),
            quote(creds.password.expose_secret())
        ))?;
        if login.status != Status::Ok {
            return Err(MailboxError::Auth {
                mailbox: mailbox.to_string(),
                reason: login.text,
            });
        }

        let caps = session.command("CAPABILITY")?;
        session.capabilities = caps
            .untagged
            .iter()
            .filter_map(|l| l.text.strip_prefix("* CAPABILITY"))
            .flat_map(|rest| rest.split_whitespace().map(str::to_ascii_uppercase))
            .collect();

        let info = session.select()?;
        info!(
            mailbox = %mailbox,
            uid_validity = info.uid_validity,
            uid_next = info.uid_next,
            idle = session.has_capability("IDLE"),
            "IMAP session established"
        );
        Ok((session, info))
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(cap))
    }

    fn transport(&self, reason: impl std::fmt::Display) -> MailboxError {
        MailboxError::Transport {
            mailbox: self.mailbox.clone(),
            reason: reason.to_string(),
        }
    }

    fn check(&self, command: &str, resp: TaggedResponse) -> Result<TaggedResponse, MailboxError> {
        match resp.status {
            Status::Ok => Ok(resp),
            Status::No | Status::Bad => Err(MailboxError::Rejected {
                mailbox: self.mailbox.clone(),
                command: command.to_string(),
                reason: resp.text,
            }),
        }
    }

    fn read_raw_line(&mut self) -> std::io::Result<Vec<u8>> {
        let n = self.reader.read_until(b'\n', &mut self.partial)?;
        if n == 0 && self.partial.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "IMAP connection closed",
            ));
        }
        Ok(std::mem::take(&mut self.partial))
    }

    fn read_response_line(&mut self) -> std::io::Result<ResponseLine> {
        let mut line = ResponseLine::default();
        loop {
            let raw = self.read_raw_line()?;
            let chunk = String::from_utf8_lossy(&raw);
            let chunk = chunk.trim_end_matches(['\r', '\n']);
            line.text.push_str(chunk);
            match literal_len(chunk) {
                Some(len) => {
                    let mut literal = vec![0u8; len];
                    self.reader.read_exact(&mut literal)?;
                    line.literals.push(literal);
                }
                None => return Ok(line),
            }
        }
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()
    }

    fn next_tag(&mut self) -> String {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    fn cancelled(&self) -> MailboxError {
        MailboxError::Cancelled {
            mailbox: self.mailbox.clone(),
        }
    }

    /// Send a command and collect responses up to its tagged completion.
    ///
    /// Nothing is sent once the caller has abandoned the operation.
    fn command(&mut self, cmd: &str) -> Result<TaggedResponse, MailboxError> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        let tag = self.next_tag();
        self.write_line(&format!("{tag} {cmd}"))
            .map_err(|e| self.transport(e))?;
        self.read_until_tagged(&tag)
    }

    fn read_until_tagged(&mut self, tag: &str) -> Result<TaggedResponse, MailboxError> {
        let prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let line = self.read_response_line().map_err(|e| self.transport(e))?;
            if let Some(rest) = line.text.strip_prefix(&prefix) {
                let (status, text) = match rest.split_once(' ') {
                    Some(("OK", t)) => (Status::Ok, t),
                    Some(("NO", t)) => (Status::No, t),
                    Some((_, t)) => (Status::Bad, t),
                    None if rest == "OK" => (Status::Ok, ""),
                    None => (Status::Bad, rest),
                };
                return Ok(TaggedResponse {
                    untagged,
                    status,
                    text: text.to_string(),
                });
            }
            if line.text.starts_with("* BYE") {
                return Err(self.transport(format!("server closed session: {}", line.text)));
            }
            untagged.push(line);
        }
    }

    fn select(&mut self) -> Result<SelectInfo, MailboxError> {
        let cmd = format!("SELECT {}", quote(&self.mailbox));
        let resp = self.command(&cmd)?;
        let resp = self.check("SELECT", resp)?;

        let uid_validity = resp
            .untagged
            .iter()
            .find_map(|l| bracket_number(&l.text, "UIDVALIDITY"))
            .ok_or_else(|| self.transport("SELECT response lacks UIDVALIDITY"))?;
        let uid_next = match resp
            .untagged
            .iter()
            .find_map(|l| bracket_number(&l.text, "UIDNEXT"))
        {
            Some(n) => n,
            None => self.search("UID SEARCH ALL")?.last().map_or(1, |max| max + 1),
        };

        Ok(SelectInfo {
            uid_validity,
            uid_next,
        })
    }

    fn search(&mut self, cmd: &str) -> Result<Vec<u32>, MailboxError> {
        let resp = self.command(cmd)?;
        let resp = self.check("UID SEARCH", resp)?;
        Ok(parse_search(&resp.untagged))
    }

    /// UIDs strictly greater than `after_uid`, ascending.
    pub fn uids_after(&mut self, after_uid: u32) -> Result<Vec<u32>, MailboxError> {
        let from = after_uid.saturating_add(1);
        // `n:*` always includes the highest UID, even when it is below n.
        let uids = self.search(&format!("UID SEARCH UID {from}:*"))?;
        Ok(uids.into_iter().filter(|&u| u > after_uid).collect())
    }

    fn uid_exists(&mut self, uid: u32) -> Result<bool, MailboxError> {
        Ok(self.search(&format!("UID SEARCH UID {uid}"))?.contains(&uid))
    }

    /// Fetch the raw message and INTERNALDATE without setting `\Seen`.
    pub fn fetch_raw(
        &mut self,
        uid: u32,
    ) -> Result<Option<(Vec<u8>, Option<chrono::DateTime<chrono::Utc>>)>, MailboxError> {
        let resp = self.command(&format!("UID FETCH {uid} (UID INTERNALDATE BODY.PEEK[])"))?;
        let resp = self.check("UID FETCH", resp)?;

        for mut line in resp.untagged {
            if !line.text.contains("FETCH") || line.literals.is_empty() {
                continue;
            }
            let line_uid = FETCH_UID
                .captures(&line.text)
                .and_then(|c| c[1].parse::<u32>().ok());
            if line_uid.is_some_and(|u| u != uid) {
                continue;
            }
            let internal = FETCH_INTERNALDATE
                .captures(&line.text)
                .and_then(|c| parse_internal_date(&c[1]));
            return Ok(Some((line.literals.swap_remove(0), internal)));
        }
        Ok(None)
    }

    /// Wait for new mail with IDLE, at most `timeout`.
    ///
    /// Reads in short slices so an abandoned wait ends IDLE with DONE
    /// within about a second instead of holding the socket until `timeout`.
    pub fn idle(&mut self, timeout: Duration) -> Result<WaitOutcome, MailboxError> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        let tag = self.next_tag();
        self.write_line(&format!("{tag} IDLE"))
            .map_err(|e| self.transport(e))?;

        let first = self.read_response_line().map_err(|e| self.transport(e))?;
        if !first.text.starts_with('+') {
            return Err(MailboxError::Rejected {
                mailbox: self.mailbox.clone(),
                command: "IDLE".into(),
                reason: first.text,
            });
        }

        let deadline = Instant::now() + timeout;
        let mut outcome = WaitOutcome::Timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if self.cancel.is_cancelled() {
                debug!(mailbox = %self.mailbox, "IDLE abandoned, ending it");
                break;
            }
            self.reader
                .get_ref()
                .sock
                .set_read_timeout(Some(remaining.min(IDLE_SLICE)))
                .map_err(|e| self.transport(e))?;
            match self.read_response_line() {
                Ok(line) if line.text.ends_with(" EXISTS") => {
                    debug!(mailbox = %self.mailbox, response = %line.text, "IDLE saw new mail");
                    outcome = WaitOutcome::Changed;
                    break;
                }
                Ok(line) if line.text.starts_with("* BYE") => {
                    return Err(self.transport(format!("server closed session: {}", line.text)));
                }
                Ok(_) => {}
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(self.transport(e)),
            }
        }

        self.reader
            .get_ref()
            .sock
            .set_read_timeout(Some(self.io_timeout))
            .map_err(|e| self.transport(e))?;
        self.write_line("DONE").map_err(|e| self.transport(e))?;
        let done = self.read_until_tagged(&tag)?;
        if done.untagged.iter().any(|l| l.text.ends_with(" EXISTS")) {
            outcome = WaitOutcome::Changed;
        }
        Ok(outcome)
    }

    /// Move `uid` to `folder`. A UID that is already gone counts as moved.
    pub fn uid_move(&mut self, uid: u32, folder: &str) -> Result<(), MailboxError> {
        if !self.uid_exists(uid)? {
            debug!(mailbox = %self.mailbox, uid, folder, "Message already moved");
            return Ok(());
        }
        if self.has_capability("MOVE") {
            let resp = self.command(&format!("UID MOVE {uid} {}", quote(folder)))?;
            self.check("UID MOVE", resp)?;
            return Ok(());
        }

        let resp = self.command(&format!("UID COPY {uid} {}", quote(folder)))?;
        self.check("UID COPY", resp)?;
        let resp = self.command(&format!("UID STORE {uid} +FLAGS.SILENT (\\Deleted)"))?;
        self.check("UID STORE", resp)?;
        if self.has_capability("UIDPLUS") {
            let resp = self.command(&format!("UID EXPUNGE {uid}"))?;
            self.check("UID EXPUNGE", resp)?;
        } else {
            warn!(
                mailbox = %self.mailbox,
                uid,
                "Server lacks MOVE and UIDPLUS; original left flagged \\Deleted"
            );
        }
        Ok(())
    }

    /// Add a keyword flag. `+FLAGS` on an already-flagged message is a no-op.
    pub fn uid_add_keyword(&mut self, uid: u32, keyword: &str) -> Result<(), MailboxError> {
        if !is_valid_keyword(keyword) {
            return Err(MailboxError::Rejected {
                mailbox: self.mailbox.clone(),
                command: "UID STORE".into(),
                reason: format!("invalid keyword {keyword:?}"),
            });
        }
        let resp = self.command(&format!("UID STORE {uid} +FLAGS.SILENT ({keyword})"))?;
        self.check("UID STORE", resp)?;
        Ok(())
    }

    pub fn logout(mut self) {
        self.cancel = CancelFlag::default();
        let _ = self.command("LOGOUT");
    }
}

// ── Async adapter ───────────────────────────────────────────────────

/// A mailbox folder reached over IMAP.
///
/// The blocking session lives in a shared slot that each operation locks
/// on the blocking pool. An operation whose caller gave up still owns the
/// lock until it stops at its next command, so the session is never lost
/// and the next operation waits for it. A transport failure empties the
/// slot so the next `connect` starts clean.
pub struct ImapMailbox {
    creds: ImapCredentials,
    mailbox: String,
    timeouts: ImapTimeouts,
    session: Arc<Mutex<Option<ImapSession>>>,
    /// IDLE support of the current session; `None` while disconnected.
    supports_idle: Option<bool>,
    uid_validity: Option<u32>,
}

impl ImapMailbox {
    pub fn new(creds: ImapCredentials, mailbox: impl Into<String>, timeouts: ImapTimeouts) -> Self {
        Self {
            creds,
            mailbox: mailbox.into(),
            timeouts,
            session: Arc::new(Mutex::new(None)),
            supports_idle: None,
            uid_validity: None,
        }
    }

    fn not_connected(&self) -> MailboxError {
        MailboxError::Transport {
            mailbox: self.mailbox.clone(),
            reason: "not connected".into(),
        }
    }

    async fn with_session<T, F>(&mut self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, MailboxError> + Send + 'static,
    {
        let slot = Arc::clone(&self.session);
        let mailbox = self.mailbox.clone();
        let guard = CancelOnDrop::new();
        let cancel = guard.flag();
        let joined = tokio::task::spawn_blocking(move || {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(session) = slot.as_mut() else {
                return Err(MailboxError::Transport {
                    mailbox,
                    reason: "not connected".into(),
                });
            };
            session.cancel = cancel;
            let result = op(session);
            if matches!(result, Err(MailboxError::Transport { .. })) {
                *slot = None;
            }
            result
        })
        .await;
        drop(guard);

        joined.unwrap_or_else(|e| {
            Err(MailboxError::Transport {
                mailbox: self.mailbox.clone(),
                reason: format!("IMAP task panicked: {e}"),
            })
        })
    }
}

#[async_trait]
impl MailboxOps for ImapMailbox {
    async fn move_message(&mut self, uid: u32, folder: &str) -> Result<(), MailboxError> {
        let folder = folder.to_string();
        self.with_session(move |s| s.uid_move(uid, &folder)).await
    }

    async fn add_keyword(&mut self, uid: u32, keyword: &str) -> Result<(), MailboxError> {
        let keyword = keyword.to_string();
        self.with_session(move |s| s.uid_add_keyword(uid, &keyword))
            .await
    }
}

#[async_trait]
impl MailboxClient for ImapMailbox {
    fn mailbox(&self) -> &str {
        &self.mailbox
    }

    async fn connect(&mut self) -> Result<SelectInfo, MailboxError> {
        self.disconnect().await;
        let creds = self.creds.clone();
        let mailbox = self.mailbox.clone();
        let io = self.timeouts.io;
        let slot = Arc::clone(&self.session);
        let (info, supports_idle) = tokio::task::spawn_blocking(move || {
            let (session, info) = ImapSession::connect(&creds, &mailbox, io)?;
            let supports_idle = session.has_capability("IDLE");
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
            Ok::<_, MailboxError>((info, supports_idle))
        })
        .await
        .map_err(|e| MailboxError::Transport {
            mailbox: self.mailbox.clone(),
            reason: format!("IMAP connect task panicked: {e}"),
        })??;
        self.supports_idle = Some(supports_idle);
        self.uid_validity = Some(info.uid_validity);
        Ok(info)
    }

    async fn uids_after(&mut self, after_uid: u32) -> Result<Vec<u32>, MailboxError> {
        self.with_session(move |s| s.uids_after(after_uid)).await
    }

    async fn fetch(&mut self, uid: u32) -> Result<Option<Message>, MailboxError> {
        let uid_validity = self.uid_validity.ok_or_else(|| self.not_connected())?;
        let mailbox = self.mailbox.clone();
        let raw = self.with_session(move |s| s.fetch_raw(uid)).await?;
        let Some((raw, internal_date)) = raw else {
            return Ok(None);
        };
        decode_message(&mailbox, MessageId::new(uid_validity, uid), &raw, internal_date)
            .map(Some)
            .ok_or(MailboxError::Unparseable { mailbox, uid })
    }

    async fn wait_for_change(&mut self) -> Result<WaitOutcome, MailboxError> {
        let supports_idle = self.supports_idle.ok_or_else(|| self.not_connected())?;
        if supports_idle {
            let timeout = self.timeouts.idle;
            self.with_session(move |s| s.idle(timeout)).await
        } else {
            tokio::time::sleep(self.timeouts.poll_interval).await;
            Ok(WaitOutcome::Timeout)
        }
    }

    /// Waits for any abandoned operation to release the session, then logs out.
    async fn disconnect(&mut self) {
        self.supports_idle = None;
        let slot = Arc::clone(&self.session);
        let _ = tokio::task::spawn_blocking(move || {
            let session = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(session) = session {
                session.logout();
            }
        })
        .await;
    }

    fn ops(&mut self) -> &mut dyn MailboxOps {
        self
    }
}
