//! The root object a surrounding server holds: wires the blob pool,
//! accounts, and process-wide counters together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use mail_types::config::EngineConfig;
use mail_types::error::{MailError, Result};
use mail_types::normalize::{AuthNormalize, OptionalAuthMap};
use tracing::debug;

use crate::account::Account;
use crate::blob::BlobPool;

/// The in-memory mail storage engine.
pub struct Store {
    pub(crate) config: EngineConfig,
    pub(crate) blob_pool: BlobPool,
    accounts: DashMap<String, Arc<Account>>,
    uid_validity_counter: Arc<AtomicU64>,
    /// Runtime override of `config.default_quota_bytes`, settable by the
    /// admin surface. Zero means "no override" (fall back to
    /// `default_quota_bytes`), per spec.md §3's Store data model.
    global_default_quota_bytes: AtomicU64,
}

impl Store {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            blob_pool: BlobPool::new(),
            accounts: DashMap::new(),
            uid_validity_counter: Arc::new(AtomicU64::new(1)),
            global_default_quota_bytes: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn global_default_quota_bytes(&self) -> u64 {
        self.global_default_quota_bytes.load(Ordering::SeqCst)
    }

    /// Sets or clears (with `0`) the process-wide default quota override.
    pub fn set_global_default_quota_bytes(&self, max_bytes: u64) {
        self.global_default_quota_bytes.store(max_bytes, Ordering::SeqCst);
    }

    pub fn blob_pool(&self) -> &BlobPool {
        &self.blob_pool
    }

    pub fn account_count(&self) -> u64 {
        self.accounts.len() as u64
    }

    pub fn get_account(&self, username: &str) -> Option<Arc<Account>> {
        self.accounts.get(username).map(|e| e.value().clone())
    }

    /// Creates the account (and its default mailboxes) if absent, otherwise
    /// returns the existing one.
    pub fn get_or_create_account(&self, username: &str) -> Arc<Account> {
        if let Some(existing) = self.get_account(username) {
            return existing;
        }
        self.accounts
            .entry(username.to_string())
            .or_insert_with(|| {
                debug!(%username, "account created");
                Arc::new(Account::new(
                    username.to_string(),
                    &self.config.junk_mailbox,
                    self.uid_validity_counter.clone(),
                ))
            })
            .clone()
    }

    /// Resolves an IMAP/SMTP AUTH login to its account, provisioning the
    /// account on first login (spec.md §6).
    ///
    /// `raw` is normalized with `auth_normalize` first. If `auth_map` is
    /// configured (a deployment's directory lookup), the normalized key must
    /// resolve through it to an account key, or the login is rejected with
    /// [`MailError::InvalidCredentials`] — an unset `auth_map` means no
    /// directory is configured and the normalized key is used directly.
    pub fn login(&self, raw: &str, auth_normalize: &dyn AuthNormalize, auth_map: &OptionalAuthMap) -> Result<Arc<Account>> {
        let normalized = auth_normalize.normalize(raw);
        let account_key = match auth_map {
            Some(map) => map.lookup(&normalized).ok_or(MailError::InvalidCredentials)?,
            None => normalized,
        };
        let account = self.get_or_create_account(&account_key);
        account.mark_first_login();
        Ok(account)
    }

    pub fn list_accounts(&self) -> Vec<String> {
        self.accounts.iter().map(|e| e.key().clone()).collect()
    }

    /// Removes the account entirely, releasing every blob referenced by
    /// any of its mailboxes.
    pub fn delete_account(&self, username: &str) -> bool {
        let Some((_, account)) = self.accounts.remove(username) else {
            return false;
        };
        for entry in account.list_mailboxes(false) {
            if let Some(mailbox) = account.get_mailbox(&entry.name) {
                mailbox.expunge_all_for_delete(&self.blob_pool);
            }
        }
        debug!(%username, "account deleted");
        true
    }
}
