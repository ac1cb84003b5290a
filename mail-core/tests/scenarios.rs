//! End-to-end behavioral scenarios exercising the engine the way the
//! surrounding IMAP/LMTP servers would: through [`Store`], [`Delivery`],
//! and the public `Account`/`Mailbox` surface only.

use std::sync::Arc;

use mail_core::delivery::{Delivery, DeliveryMetadata};
use mail_core::mailbox::{FetchItem, IdSet, StoreOp, FLAG_DELETED};
use mail_core::store::Store;
use mail_types::config::EngineConfig;
use mail_types::normalize::IdentityNormalize;
use tokio_util::sync::CancellationToken;

fn headers(subject: &str) -> Vec<(String, String)> {
    vec![
        ("From".to_string(), "s@t".to_string()),
        ("Subject".to_string(), subject.to_string()),
    ]
}

async fn deliver(store: &Store, sender: &str, rcpts: &[&str], body: &[u8], quarantine: bool) -> Vec<(String, u32)> {
    let normalize = IdentityNormalize;
    let cancel = CancellationToken::new();
    let mut delivery = Delivery::start(store, sender, DeliveryMetadata { quarantine });
    for rcpt in rcpts {
        delivery.add_rcpt(rcpt, &normalize).unwrap();
    }
    let receipt = delivery.body(&headers("x"), body, &cancel).await.unwrap();
    delivery.commit().unwrap();
    receipt.delivered.into_iter().map(|d| (d.account, d.uid)).collect()
}

#[tokio::test]
async fn s1_dedup_fan_out() {
    let store = Store::new(EngineConfig::default());
    let body = b"From: s@t\nSubject: x\n\nhi";
    let delivered = deliver(&store, "s@t", &["u1@t", "u2@t", "u3@t"], body, false).await;

    assert_eq!(delivered.len(), 3);
    assert!(delivered.iter().all(|(_, uid)| *uid == 1));
    assert_eq!(store.blob_pool().blob_count(), 1);
    assert_eq!(store.blob_pool().total_blob_bytes(), body.len() as u64);

    let total_quota: u64 = ["u1@t", "u2@t", "u3@t"]
        .iter()
        .map(|u| store.get_account(u).unwrap().quota_used_bytes())
        .sum();
    assert_eq!(total_quota, 3 * body.len() as u64);

    for user in ["u1@t", "u2@t", "u3@t"] {
        let account = store.get_account(user).unwrap();
        let inbox = account.get_mailbox("INBOX").unwrap();
        assert_eq!(inbox.message_count(), 1);
    }
}

#[tokio::test]
async fn s2_quota_drop() {
    let store = Store::new(EngineConfig::default());
    store.get_or_create_account("u1@t").set_quota(10);
    store.get_or_create_account("u2@t");

    let body = vec![b'x'; 1000];
    let delivered = deliver(&store, "s@t", &["u1@t", "u2@t"], &body, false).await;

    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, "u2@t");
    assert_eq!(delivered[0].1, 1);

    let u1 = store.get_account("u1@t").unwrap();
    assert_eq!(u1.get_mailbox("INBOX").unwrap().message_count(), 0);

    let u2 = store.get_account("u2@t").unwrap();
    let inbox = u2.get_mailbox("INBOX").unwrap();
    assert_eq!(inbox.message_count(), 1);

    assert_eq!(store.blob_pool().blob_count(), 1);
}

#[tokio::test]
async fn s3_move_consistency() {
    let store = Store::new(EngineConfig::default());
    let account = store.get_or_create_account("u@t");
    let inbox = account.get_mailbox("INBOX").unwrap();
    account.create_mailbox("Archive").unwrap();
    let archive = account.get_mailbox("Archive").unwrap();

    let u1 = inbox.append(store.blob_pool(), &account, &headers("1"), b"one", &[], 0).unwrap();
    let u2 = inbox.append(store.blob_pool(), &account, &headers("2"), b"two", &[], 0).unwrap();
    let u3 = inbox.append(store.blob_pool(), &account, &headers("3"), b"three", &[], 0).unwrap();
    assert_eq!((u1, u2, u3), (1, 2, 3));

    let copied = inbox
        .copy(store.blob_pool(), &IdSet::Ids(vec![u1, u3]), true, &archive, &account)
        .unwrap();
    assert_eq!(copied, vec![1, 2]);

    let moved = inbox
        .move_to(store.blob_pool(), &IdSet::Ids(vec![u2]), true, &archive, &account, &account)
        .unwrap();
    assert_eq!(moved, vec![3]);

    let archive_uids: Vec<u32> = archive.search(&IdSet::All, true, &[]);
    assert_eq!(archive_uids, vec![1, 2, 3]);

    let inbox_uids: Vec<u32> = inbox.search(&IdSet::All, true, &[]);
    assert_eq!(inbox_uids, vec![1, 3]);
}

#[tokio::test]
async fn s4_expunge_frees_blob() {
    let store = Store::new(EngineConfig::default());
    let account = store.get_or_create_account("u@t");
    let inbox = account.get_mailbox("INBOX").unwrap();

    let uid = inbox.append(store.blob_pool(), &account, &headers("1"), b"body", &[], 0).unwrap();
    inbox
        .store(&IdSet::Ids(vec![uid]), true, StoreOp::Add, &[FLAG_DELETED.to_string()], false)
        .unwrap();
    inbox.expunge(store.blob_pool(), &account);

    assert_eq!(inbox.message_count(), 0);
    assert_eq!(store.blob_pool().blob_count(), 0);
    assert_eq!(store.blob_pool().total_blob_bytes(), 0);
    assert_eq!(account.quota_used_bytes(), 0);
}

#[tokio::test]
async fn s5_concurrent_append_sequence_numbering() {
    let store = Arc::new(Store::new(EngineConfig::default()));
    let account = store.get_or_create_account("u@t");
    let inbox = account.get_mailbox("INBOX").unwrap();

    let mut handles = Vec::new();
    for worker in 0..2 {
        let store = Arc::clone(&store);
        let account = Arc::clone(&account);
        let inbox = Arc::clone(&inbox);
        handles.push(tokio::task::spawn_blocking(move || {
            for i in 0..100 {
                let body = format!("worker {worker} msg {i}");
                inbox
                    .append(store.blob_pool(), &account, &headers("s"), body.as_bytes(), &[], 0)
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let uids: Vec<u32> = inbox.search(&IdSet::All, true, &[]);
    assert_eq!(uids.len(), 200);
    assert_eq!(uids, (1..=200).collect::<Vec<_>>());
    assert_eq!(inbox.uid_next(), 201);

    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let cancel = CancellationToken::new();
    inbox
        .fetch(store.blob_pool(), &IdSet::All, false, &[FetchItem::Uid], tx, &cancel)
        .await;
    let mut seen = Vec::new();
    while let Some(view) = rx.recv().await {
        seen.push(view.uid);
    }
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    assert_eq!(seen, sorted);
}

#[tokio::test]
async fn s6_rename_preserves_refs() {
    let store = Store::new(EngineConfig::default());
    let account = store.get_or_create_account("u@t");
    account.create_mailbox("Work").unwrap();
    let work = account.get_mailbox("Work").unwrap();
    work.append(store.blob_pool(), &account, &headers("1"), b"content", &[], 0).unwrap();

    account.rename_mailbox("Work", "Projects").unwrap();

    assert!(account.get_mailbox("Work").is_none());
    let projects = account.get_mailbox("Projects").unwrap();
    assert_eq!(projects.message_count(), 1);
    let uids: Vec<u32> = projects.search(&IdSet::All, true, &[]);
    assert_eq!(uids, vec![1]);
}

#[tokio::test]
async fn s7_append_enforces_quota_and_notifies_other_sessions_only() {
    let store = Store::new(EngineConfig::default());
    let account = store.login("u@t", &IdentityNormalize, &None).unwrap();
    account.set_quota(10);

    let inbox = account.get_mailbox("INBOX").unwrap();
    let mut own_session = inbox.subscribe();
    let mut other_session = inbox.subscribe();

    let uid = account
        .create_message(store.blob_pool(), store.config(), store.global_default_quota_bytes(), "INBOX", &headers("hi"), b"short", &[], 1000, Some(own_session.id))
        .unwrap();
    assert_eq!(uid, 1);
    assert!(other_session.recv().await.is_some());
    assert!(own_session.try_recv().is_err());

    let status = account.status("INBOX", &[mail_core::mailbox::StatusItem::Messages]).unwrap();
    assert_eq!(status.messages, Some(1));

    let err = account
        .create_message(store.blob_pool(), store.config(), store.global_default_quota_bytes(), "INBOX", &headers("too big"), b"this body is far too large for the quota", &[], 0, None)
        .unwrap_err();
    assert_eq!(err, mail_types::error::MailError::QuotaExceeded);

    account.logout(Some((&inbox, own_session.id)));
    assert_eq!(inbox.subscriber_count(), 1);
}
