//! Hand-rolled IMAP-over-TLS mailbox.
//!
//! Uses rustls directly and speaks the handful of IMAP commands the relay
//! needs: LOGIN, SELECT, UID SEARCH UNSEEN, UID FETCH BODY.PEEK[], and
//! UID STORE +FLAGS (\Seen). BODY.PEEK keeps the fetch from setting \Seen
//! implicitly; the flag is only written by `acknowledge`.
//!
//! All socket work is blocking and runs inside `spawn_blocking`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mail_parser::MessageParser;
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::config::MailboxConfig;
use crate::error::MailboxError;
use crate::mailbox::{Mailbox, NewMessage};

pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn poll(&self) -> Result<Vec<NewMessage>, MailboxError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || fetch_unseen(&config))
            .await
            .map_err(|e| MailboxError::Protocol(format!("poll task panicked: {e}")))?
    }

    async fn acknowledge(&self, uid: u32) -> Result<(), MailboxError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || mark_seen(&config, uid))
            .await
            .map_err(|e| MailboxError::Protocol(format!("acknowledge task panicked: {e}")))?
    }
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// A logged-in IMAP session with INBOX selected.
struct Session {
    tls: TlsStream,
    tag_counter: u32,
}

impl Session {
    fn open(config: &MailboxConfig) -> Result<Self, MailboxError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port)).map_err(|e| {
            MailboxError::Connect {
                host: config.imap_host.clone(),
                port: config.imap_port,
                reason: e.to_string(),
            }
        })?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| MailboxError::Tls(format!("invalid server name: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Tls(e.to_string()))?;
        let tls = rustls::StreamOwned::new(conn, tcp);

        let mut session = Self { tls, tag_counter: 1 };

        let _greeting = session.read_line()?;

        let login = session.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ))?;
        if !login.last().is_some_and(|l| l.contains("OK")) {
            return Err(MailboxError::LoginFailed {
                username: config.username.clone(),
            });
        }

        session.command("SELECT \"INBOX\"")?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(MailboxError::Protocol("connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(MailboxError::Io(e)),
            }
        }
    }

    /// Send one tagged command and read until the tagged completion line.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailboxError> {
        let tag = format!("A{}", self.tag_counter);
        self.tag_counter += 1;

        let full = format!("{tag} {cmd}\r\n");
        self.tls.write_all(full.as_bytes())?;
        self.tls.flush()?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(lines)
    }

    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Fetch all unseen messages without touching their flags.
fn fetch_unseen(config: &MailboxConfig) -> Result<Vec<NewMessage>, MailboxError> {
    let mut session = Session::open(config)?;

    let search = session.command("UID SEARCH UNSEEN")?;
    let mut uids: Vec<u32> = Vec::new();
    for line in &search {
        if line.starts_with("* SEARCH") {
            uids.extend(
                line.split_whitespace()
                    .skip(2)
                    .filter_map(|s| s.parse::<u32>().ok()),
            );
        }
    }

    let mut results = Vec::new();
    for uid in uids {
        let fetch = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;

        // Drop the untagged FETCH header and the trailing ")" + tagged OK.
        let raw: String = fetch
            .iter()
            .skip(1)
            .take(fetch.len().saturating_sub(3))
            .cloned()
            .collect();

        if let Some(parsed) = MessageParser::default().parse(raw.as_bytes()) {
            let sender = parsed
                .from()
                .and_then(|addr| addr.first())
                .and_then(|a| a.address())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".into());
            let subject = parsed.subject().unwrap_or("(no subject)").to_string();
            let text = parsed
                .body_text(0)
                .map(|t| t.to_string())
                .unwrap_or_default();
            let html = parsed
                .body_html(0)
                .map(|h| h.to_string())
                .unwrap_or_default();
            let message_id = parsed
                .message_id()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

            results.push(NewMessage {
                uid,
                message_id,
                sender,
                subject,
                text,
                html,
            });
        }
    }

    session.logout();
    Ok(results)
}

/// Mark one message seen.
fn mark_seen(config: &MailboxConfig, uid: u32) -> Result<(), MailboxError> {
    let mut session = Session::open(config)?;
    let resp = session.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
    session.logout();

    if resp.last().is_some_and(|l| l.contains("OK")) {
        Ok(())
    } else {
        Err(MailboxError::Protocol(format!(
            "STORE rejected for uid {uid}"
        )))
    }
}
