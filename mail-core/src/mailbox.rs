//! Per-account mailbox/UID machine (C2): UID allocation, the message
//! reference map, flag mutation, expunge, copy, move, and the `IDLE`
//! subscription surface.
//!
//! Every operation takes place under the mailbox's own reader/writer lock.
//! Quota bookkeeping on the owning [`crate::account::Account`] is threaded
//! through as an explicit parameter rather than a back-pointer, per the
//! cyclic-ownership note this engine follows throughout.

use std::collections::{BTreeMap, HashSet};

use mail_types::error::Result;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::account::Account;
use crate::blob::{BlobPool, ContentHash, HeaderList};
use crate::bus::{Bus, Subscription, Update};

pub type Flag = String;

pub const FLAG_SEEN: &str = "Seen";
pub const FLAG_ANSWERED: &str = "Answered";
pub const FLAG_FLAGGED: &str = "Flagged";
pub const FLAG_DELETED: &str = "Deleted";
pub const FLAG_DRAFT: &str = "Draft";
pub const FLAG_RECENT: &str = "Recent";

/// Special-use mailbox markers. `HasChildren`/`HasNoChildren` are computed
/// at listing time by the owning [`Account`], never stored here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailboxAttribute {
    Drafts,
    Sent,
    Trash,
    Junk,
    Archive,
}

/// A per-mailbox reference to a [`crate::blob::Blob`].
#[derive(Debug, Clone)]
pub struct MessageRef {
    pub content_hash: ContentHash,
    pub uid: u32,
    pub flags: Vec<Flag>,
}

impl MessageRef {
    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

/// Selects messages by sequence number or by UID; both are represented as
/// an explicit, already-expanded set of numbers (range expansion is a
/// front-end concern).
#[derive(Debug, Clone)]
pub enum IdSet {
    All,
    Ids(Vec<u32>),
}

/// `STORE`'s three flag-mutation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Set,
    Add,
    Remove,
}

/// Additional `SEARCH` filters layered on top of an [`IdSet`] selection.
#[derive(Debug, Clone)]
pub enum SearchCriterion {
    WithFlags(Vec<Flag>),
    WithoutFlags(Vec<Flag>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchItem {
    Envelope,
    BodyStructure,
    Flags,
    InternalDate,
    Rfc822Size,
    Uid,
    BodySection,
}

#[derive(Debug, Clone)]
pub struct BodyStructure {
    pub media_type: &'static str,
    pub encoding: &'static str,
    pub size_bytes: u64,
}

/// A FETCH view assembled from a single locked snapshot; only the fields
/// named in the request's `items` are populated.
#[derive(Debug, Clone, Default)]
pub struct MessageView {
    pub seq: u32,
    pub uid: u32,
    pub envelope: Option<HeaderList>,
    pub body_structure: Option<BodyStructure>,
    pub flags: Option<Vec<Flag>>,
    pub internal_date: Option<u64>,
    pub rfc822_size: Option<u64>,
    pub body_section: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
    FirstUnseen,
}

#[derive(Debug, Clone, Default)]
pub struct StatusResult {
    pub messages: Option<u32>,
    pub recent: Option<u32>,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
    pub unseen: Option<u32>,
    pub first_unseen: Option<u32>,
}

struct MailboxInternal {
    name: String,
    subscribed: bool,
    attributes: HashSet<MailboxAttribute>,
    messages: BTreeMap<u32, MessageRef>,
    uid_next: u32,
    uid_validity: u32,
}

impl MailboxInternal {
    /// Ascending-UID order, re-derived fresh for every selection: this is
    /// the single locked snapshot invariant 6 depends on.
    fn ordered_uids(&self) -> Vec<u32> {
        self.messages.keys().copied().collect()
    }

    fn resolve(&self, id_set: &IdSet, by_uid: bool) -> Vec<u32> {
        let ordered = self.ordered_uids();
        match id_set {
            IdSet::All => ordered,
            IdSet::Ids(ids) => {
                if by_uid {
                    let wanted: HashSet<u32> = ids.iter().copied().collect();
                    ordered.into_iter().filter(|uid| wanted.contains(uid)).collect()
                } else {
                    ids.iter()
                        .filter_map(|seq| ordered.get((*seq as usize).checked_sub(1)?).copied())
                        .collect()
                }
            }
        }
    }

    fn seqnum_of(&self, uid: u32) -> Option<u32> {
        self.ordered_uids().iter().position(|u| *u == uid).map(|p| p as u32 + 1)
    }
}

/// One IMAP-visible mailbox: UID index plus the mailbox's own update bus.
pub struct Mailbox {
    internal: RwLock<MailboxInternal>,
    bus: Bus,
}

impl Mailbox {
    pub(crate) fn new(name: String, attributes: HashSet<MailboxAttribute>, uid_validity: u32) -> Self {
        Self {
            internal: RwLock::new(MailboxInternal {
                name,
                subscribed: true,
                attributes,
                messages: BTreeMap::new(),
                uid_next: 1,
                uid_validity,
            }),
            bus: Bus::new(),
        }
    }

    pub fn name(&self) -> String {
        self.internal.read().name.clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        self.internal.write().name = name;
    }

    pub fn attributes(&self) -> HashSet<MailboxAttribute> {
        self.internal.read().attributes.clone()
    }

    pub fn subscribed(&self) -> bool {
        self.internal.read().subscribed
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.internal.write().subscribed = subscribed;
    }

    pub fn uid_validity(&self) -> u32 {
        self.internal.read().uid_validity
    }

    pub fn uid_next(&self) -> u32 {
        self.internal.read().uid_next
    }

    pub fn message_count(&self) -> u32 {
        self.internal.read().messages.len() as u32
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// Appends a new message, interning its blob with refcount 1.
    pub fn append(
        &self,
        blob_pool: &BlobPool,
        account: &Account,
        parsed_headers: &HeaderList,
        raw_body: &[u8],
        flags: &[Flag],
        internal_date: u64,
    ) -> Result<u32> {
        self.append_impl(blob_pool, account, parsed_headers, raw_body, flags, internal_date, None)
    }

    /// Same as [`Mailbox::append`], but the resulting `Exists` update is not
    /// re-delivered to `exclude_subscription` — used by the session-facing
    /// `APPEND` entry point ([`Account::create_message`]) when the invoking
    /// session already has this mailbox selected and subscribed: that
    /// session learns the new state from this call's own return value, so
    /// the bus does not need to tell it again.
    pub(crate) fn append_excluding(
        &self,
        blob_pool: &BlobPool,
        account: &Account,
        parsed_headers: &HeaderList,
        raw_body: &[u8],
        flags: &[Flag],
        internal_date: u64,
        exclude_subscription: u64,
    ) -> Result<u32> {
        self.append_impl(
            blob_pool,
            account,
            parsed_headers,
            raw_body,
            flags,
            internal_date,
            Some(exclude_subscription),
        )
    }

    fn append_impl(
        &self,
        blob_pool: &BlobPool,
        account: &Account,
        parsed_headers: &HeaderList,
        raw_body: &[u8],
        flags: &[Flag],
        internal_date: u64,
        exclude_subscription: Option<u64>,
    ) -> Result<u32> {
        let content_hash = blob_pool.intern(parsed_headers, raw_body, 1, internal_date)?;
        let size_bytes = raw_body.len() as u64;

        let mut flags: Vec<Flag> = flags.to_vec();
        if !flags.iter().any(|f| f.eq_ignore_ascii_case(FLAG_RECENT)) {
            flags.push(FLAG_RECENT.to_string());
        }

        let uid = {
            let mut internal = self.internal.write();
            let uid = internal.uid_next;
            internal.uid_next += 1;
            internal.messages.insert(
                uid,
                MessageRef {
                    content_hash,
                    uid,
                    flags,
                },
            );
            uid
        };

        account.adjust_quota_used(size_bytes as i64);
        self.bus.publish_excluding(
            Update::Exists {
                new_count: self.message_count() as u64,
            },
            exclude_subscription,
        );
        trace!(mailbox = %self.name(), uid, "message appended");
        Ok(uid)
    }

    /// Installs a reference to a blob the caller has already interned
    /// (with the correct up-front refcount) — the delivery pipeline's
    /// fan-out step, which interns once for every recipient rather than
    /// once per mailbox via [`Mailbox::append`].
    pub(crate) fn install_delivered_ref(&self, content_hash: ContentHash, flags: Vec<Flag>) -> u32 {
        let uid = {
            let mut internal = self.internal.write();
            let uid = internal.uid_next;
            internal.uid_next += 1;
            internal.messages.insert(uid, MessageRef { content_hash, uid, flags });
            uid
        };
        self.bus.publish(Update::Exists {
            new_count: self.message_count() as u64,
        });
        uid
    }

    /// Streams a view per selected message, in ascending-UID order, over
    /// `tx`. Suspends on backpressure; stops early if the receiver is gone
    /// or `cancel` fires.
    pub async fn fetch(
        &self,
        blob_pool: &BlobPool,
        id_set: &IdSet,
        by_uid: bool,
        items: &[FetchItem],
        tx: mpsc::Sender<MessageView>,
        cancel: &CancellationToken,
    ) {
        let views = {
            let internal = self.internal.read();
            let uids = internal.resolve(id_set, by_uid);
            uids.into_iter()
                .enumerate()
                .filter_map(|(idx, uid)| {
                    let msg_ref = internal.messages.get(&uid)?;
                    Some(build_view(blob_pool, msg_ref, idx as u32 + 1, items))
                })
                .collect::<Vec<_>>()
        };

        for view in views {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(mailbox = %self.name(), "fetch cancelled");
                    return;
                }
                result = tx.send(view) => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Returns UIDs (if `by_uid`) or sequence numbers matching `id_set` and
    /// every `criteria` filter.
    pub fn search(&self, id_set: &IdSet, by_uid: bool, criteria: &[SearchCriterion]) -> Vec<u32> {
        let internal = self.internal.read();
        let uids = internal.resolve(id_set, by_uid);

        uids.into_iter()
            .filter(|uid| {
                let msg_ref = match internal.messages.get(uid) {
                    Some(m) => m,
                    None => return false,
                };
                criteria.iter().all(|c| match c {
                    SearchCriterion::WithFlags(flags) => flags.iter().all(|f| msg_ref.has_flag(f)),
                    SearchCriterion::WithoutFlags(flags) => flags.iter().all(|f| !msg_ref.has_flag(f)),
                })
            })
            .map(|uid| if by_uid { uid } else { internal.seqnum_of(uid).unwrap_or(0) })
            .collect()
    }

    /// Mutates the flag set of every selected message. Returns the
    /// resulting `(uid, flags)` pairs unless `silent`.
    pub fn store(
        &self,
        id_set: &IdSet,
        by_uid: bool,
        op: StoreOp,
        flags: &[Flag],
        silent: bool,
    ) -> Result<Vec<(u32, Vec<Flag>)>> {
        let mut internal = self.internal.write();
        let selected = internal.resolve(id_set, by_uid);
        let mut changed = Vec::new();

        for uid in selected {
            let msg_ref = match internal.messages.get_mut(&uid) {
                Some(m) => m,
                None => continue,
            };
            apply_store_op(&mut msg_ref.flags, op, flags);
            changed.push((uid, msg_ref.flags.clone()));
        }

        drop(internal);
        for (uid, new_flags) in &changed {
            self.bus.publish(Update::Flags {
                uid: *uid,
                new_flags: new_flags.clone(),
            });
        }

        Ok(if silent { Vec::new() } else { changed })
    }

    /// Copies selected messages into `dest`. Acquires this mailbox's read
    /// lock, then `dest`'s write lock — never both at once, so lock
    /// ordering by name is moot for this path.
    pub fn copy(&self, blob_pool: &BlobPool, id_set: &IdSet, by_uid: bool, dest: &Mailbox, dest_account: &Account) -> Result<Vec<u32>> {
        let to_copy: Vec<(ContentHash, Vec<Flag>)> = {
            let internal = self.internal.read();
            internal
                .resolve(id_set, by_uid)
                .into_iter()
                .filter_map(|uid| internal.messages.get(&uid))
                .map(|m| (m.content_hash.clone(), m.flags.clone()))
                .collect()
        };

        let mut new_uids = Vec::with_capacity(to_copy.len());
        let mut bytes_added = 0i64;
        {
            let mut dest_internal = dest.internal.write();
            for (content_hash, flags) in to_copy {
                blob_pool.acquire(&content_hash, 1);
                if let Some(blob) = blob_pool.load(&content_hash) {
                    bytes_added += blob.size_bytes as i64;
                }
                let uid = dest_internal.uid_next;
                dest_internal.uid_next += 1;
                dest_internal.messages.insert(uid, MessageRef { content_hash, uid, flags });
                new_uids.push(uid);
            }
        }

        dest_account.adjust_quota_used(bytes_added);
        if !new_uids.is_empty() {
            dest.bus.publish(Update::Exists {
                new_count: dest.message_count() as u64,
            });
        }
        Ok(new_uids)
    }

    /// `copy` into `dest`, mark the source refs `Deleted`, then `expunge`
    /// the source. Destination observers see all-or-none of the moved
    /// messages because the copy installs them under one write-lock
    /// acquisition before the source expunge runs.
    pub fn move_to(
        &self,
        blob_pool: &BlobPool,
        id_set: &IdSet,
        by_uid: bool,
        dest: &Mailbox,
        dest_account: &Account,
        source_account: &Account,
    ) -> Result<Vec<u32>> {
        let new_uids = self.copy(blob_pool, id_set, by_uid, dest, dest_account)?;
        let source_uids = self.internal.read().resolve(id_set, by_uid);
        self.store(&IdSet::Ids(source_uids), true, StoreOp::Add, &[FLAG_DELETED.to_string()], true)?;
        self.expunge(blob_pool, source_account);
        Ok(new_uids)
    }

    /// Removes every message flagged `Deleted`. Publishes per-removed
    /// sequence number in descending order so consumer numbering stays
    /// consistent as each removal is applied.
    pub fn expunge(&self, blob_pool: &BlobPool, account: &Account) -> Vec<u32> {
        let (removed_seqnums, bytes_freed) = {
            let mut internal = self.internal.write();
            let ordered = internal.ordered_uids();
            let mut to_remove = Vec::new();
            for (idx, uid) in ordered.iter().enumerate() {
                if internal.messages.get(uid).map(|m| m.has_flag(FLAG_DELETED)).unwrap_or(false) {
                    to_remove.push((idx as u32 + 1, *uid));
                }
            }
            to_remove.sort_by(|a, b| b.0.cmp(&a.0));

            let mut bytes_freed = 0i64;
            let mut seqnums = Vec::with_capacity(to_remove.len());
            for (seqnum, uid) in to_remove {
                if let Some(msg_ref) = internal.messages.remove(&uid) {
                    if let Some(blob) = blob_pool.load(&msg_ref.content_hash) {
                        bytes_freed += blob.size_bytes as i64;
                    }
                    blob_pool.release(&msg_ref.content_hash);
                    seqnums.push(seqnum);
                }
            }
            (seqnums, bytes_freed)
        };

        account.adjust_quota_used(-bytes_freed);
        for seqnum in &removed_seqnums {
            self.bus.publish(Update::Expunge { seqnum: *seqnum });
        }
        removed_seqnums
    }

    /// Releases every blob referenced by this mailbox's messages,
    /// regardless of flags. Used when the mailbox itself is being deleted
    /// (or an account is torn down), returning the total bytes freed for
    /// the caller to deduct from quota.
    pub(crate) fn expunge_all_for_delete(&self, blob_pool: &BlobPool) -> u64 {
        let mut internal = self.internal.write();
        let mut freed = 0u64;
        for (_, msg_ref) in internal.messages.iter() {
            if let Some(blob) = blob_pool.load(&msg_ref.content_hash) {
                freed += blob.size_bytes;
            }
            blob_pool.release(&msg_ref.content_hash);
        }
        internal.messages.clear();
        freed
    }

    /// UIDs whose blob was first stored before `cutoff` (unix seconds).
    /// Used by retention pruning.
    pub(crate) fn uids_with_internal_date_before(&self, blob_pool: &BlobPool, cutoff: u64) -> Vec<u32> {
        let internal = self.internal.read();
        internal
            .messages
            .values()
            .filter_map(|m| {
                let blob = blob_pool.load(&m.content_hash)?;
                (blob.internal_date < cutoff).then_some(m.uid)
            })
            .collect()
    }

    pub fn status(&self, items: &[StatusItem]) -> StatusResult {
        let internal = self.internal.read();
        let mut result = StatusResult::default();

        for item in items {
            match item {
                StatusItem::Messages => result.messages = Some(internal.messages.len() as u32),
                StatusItem::Recent => {
                    result.recent = Some(internal.messages.values().filter(|m| m.has_flag(FLAG_RECENT)).count() as u32)
                }
                StatusItem::UidNext => result.uid_next = Some(internal.uid_next),
                StatusItem::UidValidity => result.uid_validity = Some(internal.uid_validity),
                StatusItem::Unseen => {
                    result.unseen = Some(internal.messages.values().filter(|m| !m.has_flag(FLAG_SEEN)).count() as u32)
                }
                StatusItem::FirstUnseen => {
                    result.first_unseen = internal
                        .ordered_uids()
                        .iter()
                        .position(|uid| !internal.messages[uid].has_flag(FLAG_SEEN))
                        .map(|p| p as u32 + 1)
                }
            }
        }
        result
    }
}

fn build_view(blob_pool: &BlobPool, msg_ref: &MessageRef, seq: u32, items: &[FetchItem]) -> MessageView {
    let blob = blob_pool.load(&msg_ref.content_hash);
    let mut view = MessageView {
        seq,
        uid: msg_ref.uid,
        ..Default::default()
    };

    for item in items {
        match item {
            FetchItem::Envelope => view.envelope = blob.as_ref().map(|b| b.parsed_headers.clone()),
            FetchItem::BodyStructure => {
                view.body_structure = blob.as_ref().map(|b| BodyStructure {
                    media_type: "text/plain",
                    encoding: "7bit",
                    size_bytes: b.size_bytes,
                })
            }
            FetchItem::Flags => view.flags = Some(msg_ref.flags.clone()),
            FetchItem::InternalDate => view.internal_date = blob.as_ref().map(|b| b.internal_date),
            FetchItem::Rfc822Size => view.rfc822_size = blob.as_ref().map(|b| b.size_bytes),
            FetchItem::Uid => {}
            FetchItem::BodySection => {
                view.body_section = blob.as_ref().map(|b| {
                    let mut section = Vec::new();
                    for (k, v) in &b.parsed_headers {
                        section.extend_from_slice(k.as_bytes());
                        section.extend_from_slice(b": ");
                        section.extend_from_slice(v.as_bytes());
                        section.extend_from_slice(b"\r\n");
                    }
                    section.extend_from_slice(b"\r\n");
                    section.extend_from_slice(&b.raw_body);
                    section
                })
            }
        }
    }
    view
}

fn apply_store_op(current: &mut Vec<Flag>, op: StoreOp, flags: &[Flag]) {
    match op {
        StoreOp::Add => {
            for flag in flags {
                if !current.iter().any(|f| f.eq_ignore_ascii_case(flag)) {
                    current.push(flag.clone());
                }
            }
        }
        StoreOp::Remove => {
            current.retain(|f| !flags.iter().any(|rm| rm.eq_ignore_ascii_case(f)));
        }
        StoreOp::Set => {
            let kept: Vec<Flag> = current
                .iter()
                .filter(|f| flags.iter().any(|keep| keep.eq_ignore_ascii_case(f)))
                .cloned()
                .collect();
            let mut new_flags = kept.clone();
            for flag in flags {
                if !kept.iter().any(|f| f.eq_ignore_ascii_case(flag)) {
                    new_flags.push(flag.clone());
                }
            }
            *current = new_flags;
        }
    }
}
