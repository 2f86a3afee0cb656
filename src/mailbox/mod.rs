//! Mailbox collaborator — IMAP polling for vendor purchase emails.
//!
//! The boundary is intentionally thin: `poll()` returns normalized unseen
//! messages without touching their flags, `acknowledge(uid)` marks one
//! message seen. The pipeline acknowledges only after the order has been
//! durably upserted (or the parser definitively rejected the email), so a
//! crash between fetch and persist re-delivers on the next poll.

pub mod imap;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::MailboxError;

pub use imap::ImapMailbox;

/// One unseen message, normalized for the parser.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub uid: u32,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Inbound mail source. `poll` must not change message flags; `acknowledge`
/// marks one message seen so it stops appearing in later polls.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn poll(&self) -> Result<Vec<NewMessage>, MailboxError>;
    async fn acknowledge(&self, uid: u32) -> Result<(), MailboxError>;
}

/// Check if a sender email is in the allowlist.
///
/// - Empty list → deny all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

/// Spawn the poll loop: fetch unseen messages on an interval, filter by
/// sender allowlist, dedup by message id, and forward over the channel.
///
/// The loop ends when the receiving side is dropped.
pub fn spawn_poll_loop(
    mailbox: Arc<dyn Mailbox>,
    poll_interval_secs: u64,
    allowed_senders: Vec<String>,
    tx: UnboundedSender<NewMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = poll_interval_secs, "Mailbox poll loop started");
        let mut tick = tokio::time::interval(Duration::from_secs(poll_interval_secs));
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            tick.tick().await;

            match mailbox.poll().await {
                Ok(messages) => {
                    prune_seen(&mut seen, &messages);
                    for msg in messages {
                        if seen.contains(&msg.message_id) {
                            continue;
                        }
                        if !is_sender_allowed(&allowed_senders, &msg.sender) {
                            warn!(sender = %msg.sender, "Blocked email from unlisted sender");
                            continue;
                        }
                        seen.insert(msg.message_id.clone());
                        if tx.send(msg).is_err() {
                            info!("Mailbox consumer closed, poll loop exiting");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Mailbox poll failed");
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            }
        }
    })
}

/// Drop dedup entries for messages that no longer show up as unseen.
/// Acknowledged mail leaves the unseen listing, so without this the set
/// grows for the life of the worker.
fn prune_seen(seen: &mut HashSet<String>, messages: &[NewMessage]) {
    let current: HashSet<&str> = messages.iter().map(|m| m.message_id.as_str()).collect();
    seen.retain(|id| current.contains(id.as_str()));
}
