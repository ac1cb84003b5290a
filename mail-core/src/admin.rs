//! Thin wrapper around [`Store`] exposing the observability/maintenance
//! surface required by the surrounding system (list/create/delete
//! accounts, quota management, statistics, and pruning). Not part of the
//! hardcore IMAP/delivery state machine, but called out explicitly as a
//! required collaborator surface.

use mail_types::error::{MailError, Result};
use tracing::{info, warn};

use crate::account::QuotaInfo;
use crate::mailbox::{IdSet, SearchCriterion, StoreOp, FLAG_DELETED, FLAG_SEEN};
use crate::store::Store;

pub struct Stat {
    pub total_bytes: u64,
    pub accounts_count: u64,
}

pub fn list_accounts(store: &Store) -> Vec<String> {
    store.list_accounts()
}

pub fn create_account(store: &Store, username: &str) {
    store.get_or_create_account(username);
}

pub fn delete_account(store: &Store, username: &str) -> Result<()> {
    if store.delete_account(username) {
        Ok(())
    } else {
        Err(MailError::UserDoesNotExist)
    }
}

pub fn get_quota(store: &Store, username: &str) -> Result<QuotaInfo> {
    let account = store.get_account(username).ok_or(MailError::UserDoesNotExist)?;
    Ok(account.get_quota(store.config().default_quota_bytes, store.global_default_quota_bytes()))
}

pub fn set_quota(store: &Store, username: &str, max_bytes: u64) -> Result<()> {
    let account = store.get_account(username).ok_or(MailError::UserDoesNotExist)?;
    account.set_quota(max_bytes);
    Ok(())
}

pub fn reset_quota(store: &Store, username: &str) -> Result<()> {
    let account = store.get_account(username).ok_or(MailError::UserDoesNotExist)?;
    account.reset_quota();
    Ok(())
}

/// Sets (or clears, with `0`) the process-wide default quota override that
/// applies to every account without its own `quota_max_bytes` set, taking
/// precedence over `config.default_quota_bytes`.
pub fn set_global_default_quota(store: &Store, max_bytes: u64) {
    store.set_global_default_quota_bytes(max_bytes);
}

pub fn get_stat(store: &Store) -> Stat {
    Stat {
        total_bytes: store.blob_pool().total_blob_bytes(),
        accounts_count: store.account_count(),
    }
}

/// Removes messages (across every account/mailbox) older than
/// `retention_secs`. Per-entity failures are logged and skipped; the
/// overall call never aborts early.
pub fn prune_messages(store: &Store, retention_secs: u64) -> u64 {
    if retention_secs == 0 {
        return 0;
    }
    let cutoff = mail_types::time::now_unix_secs().saturating_sub(retention_secs);
    let mut pruned = 0u64;

    for username in store.list_accounts() {
        let Some(account) = store.get_account(&username) else { continue };
        for entry in account.list_mailboxes(false) {
            let Some(mailbox) = account.get_mailbox(&entry.name) else { continue };
            let stale_uids = mailbox.uids_with_internal_date_before(store.blob_pool(), cutoff);
            if stale_uids.is_empty() {
                continue;
            }
            if let Err(err) =
                mailbox.store(&IdSet::Ids(stale_uids.clone()), true, StoreOp::Add, &[FLAG_DELETED.to_string()], true)
            {
                warn!(%username, mailbox = %entry.name, %err, "prune_messages: failed to mark stale messages deleted");
                continue;
            }
            let removed = mailbox.expunge(store.blob_pool(), &account);
            pruned += removed.len() as u64;
        }
    }
    info!(pruned, "prune_messages complete");
    pruned
}

/// Removes accounts that have never logged in, or have been idle, longer
/// than `retention_secs`.
pub fn prune_unused_accounts(store: &Store, retention_secs: u64) -> u64 {
    if retention_secs == 0 {
        return 0;
    }
    let cutoff = mail_types::time::now_unix_secs().saturating_sub(retention_secs);
    let mut pruned = 0u64;

    for username in store.list_accounts() {
        let Some(account) = store.get_account(&username) else { continue };
        let last_activity = if account.first_login_at() == mail_types::time::FIRST_LOGIN_UNSET {
            account.created_at()
        } else {
            account.first_login_at()
        };
        if last_activity < cutoff && store.delete_account(&username) {
            pruned += 1;
        }
    }
    info!(pruned, "prune_unused_accounts complete");
    pruned
}

pub fn purge_all_messages(store: &Store) -> u64 {
    let mut purged = 0u64;
    for username in store.list_accounts() {
        let Some(account) = store.get_account(&username) else { continue };
        for entry in account.list_mailboxes(false) {
            let Some(mailbox) = account.get_mailbox(&entry.name) else { continue };
            let all_uids = mailbox.search(&IdSet::All, true, &[]);
            if all_uids.is_empty() {
                continue;
            }
            let _ = mailbox.store(&IdSet::Ids(all_uids), true, StoreOp::Add, &[FLAG_DELETED.to_string()], true);
            purged += mailbox.expunge(store.blob_pool(), &account).len() as u64;
        }
    }
    purged
}

pub fn purge_read_messages(store: &Store) -> u64 {
    let mut purged = 0u64;
    for username in store.list_accounts() {
        let Some(account) = store.get_account(&username) else { continue };
        for entry in account.list_mailboxes(false) {
            let Some(mailbox) = account.get_mailbox(&entry.name) else { continue };
            let read_uids = mailbox.search(&IdSet::All, true, &[SearchCriterion::WithFlags(vec![FLAG_SEEN.to_string()])]);
            if read_uids.is_empty() {
                continue;
            }
            let _ = mailbox.store(&IdSet::Ids(read_uids), true, StoreOp::Add, &[FLAG_DELETED.to_string()], true);
            purged += mailbox.expunge(store.blob_pool(), &account).len() as u64;
        }
    }
    purged
}

#[cfg(test)]
mod tests {
    use super::*;
    use mail_types::config::EngineConfig;

    #[test]
    fn global_default_quota_overrides_config_default_when_account_has_no_quota_set() {
        let mut config = EngineConfig::default();
        config.default_quota_bytes = 1000;
        let store = Store::new(config);
        store.get_or_create_account("u@t");

        let quota = get_quota(&store, "u@t").unwrap();
        assert_eq!(quota.max_bytes, 1000);
        assert!(quota.is_default);

        set_global_default_quota(&store, 50);
        let quota = get_quota(&store, "u@t").unwrap();
        assert_eq!(quota.max_bytes, 50);
        assert!(quota.is_default);

        set_quota(&store, "u@t", 20).unwrap();
        let quota = get_quota(&store, "u@t").unwrap();
        assert_eq!(quota.max_bytes, 20);
        assert!(!quota.is_default);
    }

    #[test]
    fn get_quota_unknown_account_is_user_does_not_exist() {
        let store = Store::new(EngineConfig::default());
        assert_eq!(get_quota(&store, "nobody@t"), Err(MailError::UserDoesNotExist));
    }
}
