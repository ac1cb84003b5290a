//! Transactional multi-recipient delivery pipeline (C4):
//! `Start → AddRcpt* → Body → Commit/Abort`.
//!
//! Modeled as a single struct with `Result`-returning methods rather than a
//! type-state machine — the flow has exactly one suspension point (the body
//! read) and no branching worth encoding in the type system.

use mail_types::error::{MailError, Result};
use mail_types::normalize::DeliveryNormalize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::blob::HeaderList;
use crate::mailbox::MailboxAttribute;
use crate::store::Store;

/// Per-transaction metadata carried from `Start` through to fan-out.
#[derive(Debug, Clone, Default)]
pub struct DeliveryMetadata {
    /// Redirects delivery to the recipient's configured junk mailbox
    /// instead of INBOX.
    pub quarantine: bool,
}

/// One accepted recipient's installed reference, reported back to the
/// caller after a successful `Body`.
#[derive(Debug, Clone)]
pub struct DeliveredRecipient {
    pub account: String,
    pub mailbox: String,
    pub uid: u32,
}

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub content_hash: crate::blob::ContentHash,
    pub size_bytes: u64,
    pub delivered: Vec<DeliveredRecipient>,
}

/// A single inbound-message transaction.
pub struct Delivery<'s> {
    store: &'s Store,
    sender: String,
    metadata: DeliveryMetadata,
    recipients: Vec<String>,
    body_done: bool,
}

impl<'s> Delivery<'s> {
    pub fn start(store: &'s Store, sender: impl Into<String>, metadata: DeliveryMetadata) -> Self {
        Self {
            store,
            sender: sender.into(),
            metadata,
            recipients: Vec::new(),
            body_done: false,
        }
    }

    /// Normalizes `address`; creates the account on demand if
    /// `auto_create` is configured, otherwise rejects with
    /// [`MailError::UserDoesNotExist`]. Adding the same address twice is a
    /// no-op.
    pub fn add_rcpt(&mut self, address: &str, normalize: &dyn DeliveryNormalize) -> Result<()> {
        let normalized = normalize.normalize(address);

        if self.recipients.contains(&normalized) {
            return Ok(());
        }

        if self.store.get_account(&normalized).is_none() {
            if self.store.config().auto_create {
                self.store.get_or_create_account(&normalized);
            } else {
                return Err(MailError::UserDoesNotExist);
            }
        }

        self.recipients.push(normalized);
        Ok(())
    }

    /// Pass 1 (quota validation) then pass 2 (single intern, per-recipient
    /// fan-out). Recipients over quota are dropped silently (logged, not
    /// surfaced) per the delivery error-handling rule; the transaction as a
    /// whole never fails on their account.
    pub async fn body(
        &mut self,
        parsed_headers: &HeaderList,
        body_source: &[u8],
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt> {
        if cancel.is_cancelled() {
            return Ok(DeliveryReceipt {
                content_hash: String::new(),
                size_bytes: 0,
                delivered: Vec::new(),
            });
        }

        let size_bytes = body_source.len() as u64;
        let config = self.store.config();

        // Pass 1: quota validation. `appendlimit_bytes`/`MessageTooLarge` is
        // an IMAP-APPEND-only concern (spec.md §7) — delivery never hard-fails
        // the whole transaction on size, only drops individual recipients
        // who are over their own quota.
        let mut accepted = Vec::with_capacity(self.recipients.len());
        for username in &self.recipients {
            let Some(account) = self.store.get_account(username) else {
                continue;
            };
            let quota = account.get_quota(config.default_quota_bytes, self.store.global_default_quota_bytes());
            if quota.max_bytes > 0 && quota.used_bytes + size_bytes > quota.max_bytes {
                warn!(%username, "recipient over quota, dropping from delivery");
                continue;
            }
            accepted.push(username.clone());
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(DeliveryReceipt { content_hash: String::new(), size_bytes: 0, delivered: Vec::new() });
            }
            _ = tokio::task::yield_now() => {}
        }

        // Pass 2: fan-out. Return-Path is added to a copy; the caller's
        // headers are never mutated.
        let mut headers_with_return_path = parsed_headers.clone();
        headers_with_return_path.insert(0, ("Return-Path".to_string(), format!("<{}>", self.sender)));

        let content_hash = self.store.blob_pool().intern(
            &headers_with_return_path,
            body_source,
            accepted.len() as u64,
            mail_types::time::now_unix_secs(),
        )?;

        let mut delivered = Vec::with_capacity(accepted.len());
        for username in accepted {
            let Some(account) = self.store.get_account(&username) else {
                // Concurrently deleted between pass 1 and pass 2: the
                // up-front reference must still be released.
                self.store.blob_pool().release(&content_hash);
                continue;
            };

            let mailbox = if self.metadata.quarantine {
                account.get_or_create_mailbox(&config.junk_mailbox, Some(MailboxAttribute::Junk))
            } else {
                account.get_mailbox("INBOX").expect("INBOX is always provisioned")
            };

            let uid = {
                let mut internal_flags = vec!["Recent".to_string()];
                internal_flags.dedup();
                mailbox.install_delivered_ref(content_hash.clone(), internal_flags)
            };
            account.adjust_quota_used(size_bytes as i64);

            delivered.push(DeliveredRecipient {
                account: username,
                mailbox: mailbox.name(),
                uid,
            });
        }

        self.body_done = true;
        Ok(DeliveryReceipt {
            content_hash,
            size_bytes,
            delivered,
        })
    }

    /// Always succeeds after a completed `Body`.
    pub fn commit(self) -> Result<()> {
        Ok(())
    }

    /// No side effects before `Body`. If `Body` already ran, the installed
    /// references are kept — the simpler no-rollback model, chosen over the
    /// stricter two-phase alternative spec left optional.
    pub fn abort(self) {
        let _ = self.body_done;
    }
}
