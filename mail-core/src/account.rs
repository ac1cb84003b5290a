//! Per-account mailbox collection, quota accounting, and default-mailbox
//! provisioning (C3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use mail_types::config::EngineConfig;
use mail_types::error::{MailError, Result};
use mail_types::time::{now_unix_secs, FIRST_LOGIN_UNSET};
use parking_lot::RwLock;
use tracing::debug;

use crate::blob::{BlobPool, HeaderList};
use crate::mailbox::{Flag, Mailbox, MailboxAttribute, StatusItem, StatusResult};

/// Canonicalizes a mailbox name for lookup: `INBOX` compares
/// case-insensitively, every other name compares exactly.
fn lookup_key(name: &str) -> String {
    if name.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_string()
    } else {
        name.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaInfo {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub is_default: bool,
}

#[derive(Debug, Clone)]
pub struct MailboxListEntry {
    pub name: String,
    pub subscribed: bool,
    pub attributes: Vec<MailboxAttribute>,
    pub has_children: bool,
}

struct AccountMailboxes {
    by_name: HashMap<String, Arc<Mailbox>>,
}

/// An account: a user's mailbox collection plus quota state.
pub struct Account {
    username: String,
    mailboxes: RwLock<AccountMailboxes>,
    quota_used_bytes: AtomicI64,
    quota_max_bytes: AtomicU64,
    created_at: u64,
    first_login_at: AtomicU64,
    uid_validity_counter: Arc<AtomicU64>,
}

impl Account {
    pub(crate) fn new(username: String, junk_mailbox_name: &str, uid_validity_counter: Arc<AtomicU64>) -> Self {
        let account = Self {
            username,
            mailboxes: RwLock::new(AccountMailboxes { by_name: HashMap::new() }),
            quota_used_bytes: AtomicI64::new(0),
            quota_max_bytes: AtomicU64::new(0),
            created_at: now_unix_secs(),
            first_login_at: AtomicU64::new(FIRST_LOGIN_UNSET),
            uid_validity_counter,
        };

        for (name, attr) in [
            ("INBOX", None),
            ("Drafts", Some(MailboxAttribute::Drafts)),
            ("Sent", Some(MailboxAttribute::Sent)),
            ("Trash", Some(MailboxAttribute::Trash)),
        ] {
            account.provision_default_mailbox(name, attr);
        }
        account.provision_default_mailbox(junk_mailbox_name, Some(MailboxAttribute::Junk));

        account
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(username: String) -> Self {
        Self::new(username, "Junk", Arc::new(AtomicU64::new(1)))
    }

    fn provision_default_mailbox(&self, name: &str, attr: Option<MailboxAttribute>) {
        let uid_validity = self.uid_validity_counter.fetch_add(1, Ordering::SeqCst) as u32;
        let attrs = attr.into_iter().collect();
        let mailbox = Arc::new(Mailbox::new(name.to_string(), attrs, uid_validity));
        self.mailboxes.write().by_name.insert(lookup_key(name), mailbox);
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn first_login_at(&self) -> u64 {
        self.first_login_at.load(Ordering::SeqCst)
    }

    /// Records the first successful session-open. A no-op on subsequent
    /// calls. Called by the (out-of-scope) authentication front-end; not
    /// named directly in the interface contract this crate was built
    /// against, but implied by the `first_login_at` attribute.
    pub fn mark_first_login(&self) {
        self.first_login_at
            .compare_exchange(FIRST_LOGIN_UNSET, now_unix_secs(), Ordering::SeqCst, Ordering::SeqCst)
            .ok();
    }

    pub fn quota_used_bytes(&self) -> u64 {
        self.quota_used_bytes.load(Ordering::SeqCst).max(0) as u64
    }

    pub(crate) fn adjust_quota_used(&self, delta: i64) {
        let prev = self.quota_used_bytes.fetch_add(delta, Ordering::SeqCst);
        if prev + delta < 0 {
            // Clamp at zero: expunge/delete paths only ever subtract bytes
            // already accounted for, but defends against drift.
            self.quota_used_bytes.store(0, Ordering::SeqCst);
        }
    }

    pub fn get_quota(&self, default_quota_bytes: u64, global_default_quota_bytes: u64) -> QuotaInfo {
        let max_bytes_set = self.quota_max_bytes.load(Ordering::SeqCst);
        let (max_bytes, is_default) = if max_bytes_set > 0 {
            (max_bytes_set, false)
        } else if global_default_quota_bytes > 0 {
            (global_default_quota_bytes, true)
        } else {
            (default_quota_bytes, true)
        };

        QuotaInfo {
            used_bytes: self.quota_used_bytes(),
            max_bytes,
            is_default,
        }
    }

    pub fn set_quota(&self, max_bytes: u64) {
        self.quota_max_bytes.store(max_bytes, Ordering::SeqCst);
    }

    pub fn reset_quota(&self) {
        self.quota_max_bytes.store(0, Ordering::SeqCst);
    }

    pub fn get_mailbox(&self, name: &str) -> Option<Arc<Mailbox>> {
        self.mailboxes.read().by_name.get(&lookup_key(name)).cloned()
    }

    pub fn list_mailboxes(&self, filter_subscribed: bool) -> Vec<MailboxListEntry> {
        let guard = self.mailboxes.read();
        let names: Vec<String> = guard.by_name.values().map(|m| m.name()).collect();

        guard
            .by_name
            .values()
            .filter(|m| !filter_subscribed || m.subscribed())
            .map(|m| {
                let name = m.name();
                let has_children = names.iter().any(|other| other.starts_with(&format!("{}.", name)));
                MailboxListEntry {
                    name,
                    subscribed: m.subscribed(),
                    attributes: m.attributes().into_iter().collect(),
                    has_children,
                }
            })
            .collect()
    }

    pub fn create_mailbox(&self, name: &str) -> Result<()> {
        let key = lookup_key(name);
        let mut guard = self.mailboxes.write();
        if guard.by_name.contains_key(&key) {
            return Err(MailError::MailboxExists);
        }
        let uid_validity = self.uid_validity_counter.fetch_add(1, Ordering::SeqCst) as u32;
        guard
            .by_name
            .insert(key, Arc::new(Mailbox::new(name.to_string(), Default::default(), uid_validity)));
        debug!(%name, "mailbox created");
        Ok(())
    }

    /// Releases every blob referenced by the mailbox's messages, then
    /// removes it. Rejects `INBOX`.
    pub fn delete_mailbox(&self, name: &str, blob_pool: &BlobPool) -> Result<()> {
        if name.eq_ignore_ascii_case("INBOX") {
            return Err(MailError::CannotDeleteInbox);
        }

        let mailbox = {
            let mut guard = self.mailboxes.write();
            guard.by_name.remove(&lookup_key(name)).ok_or(MailError::NoSuchMailbox)?
        };

        let freed = mailbox.expunge_all_for_delete(blob_pool);
        self.adjust_quota_used(-(freed as i64));
        debug!(%name, freed, "mailbox deleted");
        Ok(())
    }

    pub fn rename_mailbox(&self, old: &str, new: &str) -> Result<()> {
        if old.eq_ignore_ascii_case("INBOX") {
            return Err(MailError::CannotRenameInbox);
        }

        let mut guard = self.mailboxes.write();
        let new_key = lookup_key(new);
        if guard.by_name.contains_key(&new_key) {
            return Err(MailError::MailboxExists);
        }
        let mailbox = guard.by_name.remove(&lookup_key(old)).ok_or(MailError::NoSuchMailbox)?;
        mailbox.set_name(new.to_string());
        guard.by_name.insert(new_key, mailbox);
        debug!(%old, %new, "mailbox renamed");
        Ok(())
    }

    pub fn set_subscribed(&self, name: &str, subscribed: bool) -> Result<()> {
        let guard = self.mailboxes.read();
        let mailbox = guard.by_name.get(&lookup_key(name)).ok_or(MailError::NoSuchMailbox)?;
        mailbox.set_subscribed(subscribed);
        Ok(())
    }

    /// Ensures `name` exists, provisioning it fresh (with a new
    /// UIDVALIDITY) if absent. Used by delivery quarantine routing.
    pub(crate) fn get_or_create_mailbox(&self, name: &str, attr: Option<MailboxAttribute>) -> Arc<Mailbox> {
        if let Some(existing) = self.get_mailbox(name) {
            return existing;
        }
        let mut guard = self.mailboxes.write();
        let key = lookup_key(name);
        guard
            .by_name
            .entry(key)
            .or_insert_with(|| {
                let uid_validity = self.uid_validity_counter.fetch_add(1, Ordering::SeqCst) as u32;
                Arc::new(Mailbox::new(name.to_string(), attr.into_iter().collect(), uid_validity))
            })
            .clone()
    }

    /// Resolves `name` to a mailbox and computes the requested `items` from
    /// a single locked snapshot of it (spec.md §4.3's `status` contract).
    pub fn status(&self, name: &str, items: &[StatusItem]) -> Result<StatusResult> {
        let mailbox = self.get_mailbox(name).ok_or(MailError::NoSuchMailbox)?;
        Ok(mailbox.status(items))
    }

    /// The session-facing `APPEND` entry point the IMAP server object
    /// exposes (spec.md §6). Unlike delivery's `Body` — which silently drops
    /// over-quota recipients and has no size limit of its own — `APPEND`
    /// surfaces both `MessageTooLarge` (against `appendlimit_bytes`) and
    /// `QuotaExceeded` (against this account's effective quota) as hard
    /// errors, per spec.md §7.
    ///
    /// `currently_selected` is the subscription id of the invoking
    /// session's own subscription to `mailbox_name`, if that happens to be
    /// the mailbox it currently has selected; pass `None` when appending to
    /// a mailbox other than the one selected, or with no session context.
    /// When set, the resulting `Exists` update is not re-delivered to that
    /// subscription — the session already learns the new UID from this
    /// call's own return value.
    #[allow(clippy::too_many_arguments)]
    pub fn create_message(
        &self,
        blob_pool: &BlobPool,
        config: &EngineConfig,
        global_default_quota_bytes: u64,
        mailbox_name: &str,
        parsed_headers: &HeaderList,
        raw_body: &[u8],
        flags: &[Flag],
        internal_date: u64,
        currently_selected: Option<u64>,
    ) -> Result<u32> {
        let size_bytes = raw_body.len() as u64;
        if size_bytes > config.appendlimit_bytes as u64 {
            return Err(MailError::MessageTooLarge);
        }

        let quota = self.get_quota(config.default_quota_bytes, global_default_quota_bytes);
        if quota.max_bytes > 0 && quota.used_bytes + size_bytes > quota.max_bytes {
            return Err(MailError::QuotaExceeded);
        }

        let mailbox = self.get_mailbox(mailbox_name).ok_or(MailError::NoSuchMailbox)?;
        match currently_selected {
            Some(subscription_id) => {
                mailbox.append_excluding(blob_pool, self, parsed_headers, raw_body, flags, internal_date, subscription_id)
            }
            None => mailbox.append(blob_pool, self, parsed_headers, raw_body, flags, internal_date),
        }
    }

    /// Session teardown hook the IMAP server object calls on logout
    /// (spec.md §6). This account keeps no other per-session state; the one
    /// thing that must not leak past a session's lifetime is its mailbox
    /// bus subscription ([`Mailbox::subscribe`]), so `logout` takes the
    /// still-open subscription, if any, and unsubscribes it.
    pub fn logout(&self, selected: Option<(&Mailbox, u64)>) {
        if let Some((mailbox, subscription_id)) = selected {
            mailbox.unsubscribe(subscription_id);
        }
        debug!(username = %self.username, "session logged out");
    }
}
