//! Per-session update bus used by IMAP `IDLE` and status polling (C5).
//!
//! Each selected IMAP session holds a [`Subscription`] to its mailbox.
//! Every mutating [`crate::mailbox::Mailbox`] operation publishes the
//! corresponding [`Update`]s after releasing its write lock. Consecutive
//! `Exists` updates for a slow subscriber are coalesced into the latest
//! value; `Flags`/`Expunge` updates are never dropped — a subscriber too
//! slow to keep up with those is disconnected instead.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

/// Depth of each subscription's bounded channel. Chosen generously enough
/// that only a genuinely stalled consumer ever overflows it.
const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 256;

/// A single notification fanned out to subscribers of a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Exists { new_count: u64 },
    Expunge { seqnum: u32 },
    Flags { uid: u32, new_flags: Vec<String> },
}

struct Slot {
    tx: mpsc::Sender<Update>,
    /// An `Exists` update that lost a race against a full channel, held here
    /// so the next `Exists` can coalesce into it instead of queuing behind
    /// it.
    pending_exists: Mutex<Option<Update>>,
}

/// The set of live subscriptions for one mailbox.
#[derive(Default)]
pub struct Bus {
    next_id: AtomicU64,
    subs: DashMap<u64, Slot>,
}

/// A subscriber's handle: an id (used to unsubscribe) and the receiving end
/// of its channel.
pub struct Subscription {
    pub id: u64,
    rx: mpsc::Receiver<Update>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.len()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        self.subs.insert(
            id,
            Slot {
                tx,
                pending_exists: Mutex::new(None),
            },
        );
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subs.remove(&id);
    }

    /// Fans `update` out to every live subscription, applying the
    /// `Exists`-coalescing and disconnect-on-overflow rules described above.
    pub fn publish(&self, update: Update) {
        self.publish_excluding(update, None)
    }

    /// Same as [`Bus::publish`], but `exclude` (if present) does not receive
    /// this update — used when the caller that triggered it already knows
    /// the new state by some other means (its own call's return value) and
    /// does not need the bus to tell it a second time.
    pub fn publish_excluding(&self, update: Update, exclude: Option<u64>) {
        let mut stale = Vec::new();

        for entry in self.subs.iter() {
            let id = *entry.key();
            if Some(id) == exclude {
                continue;
            }
            let slot = entry.value();

            if let Some(pending) = slot.pending_exists.lock().take() {
                if slot.tx.try_send(pending.clone()).is_err() {
                    // Channel is still full; keep the newest pending Exists.
                    if matches!(update, Update::Exists { .. }) {
                        *slot.pending_exists.lock() = Some(update.clone());
                        continue;
                    }
                    *slot.pending_exists.lock() = Some(pending);
                    stale.push(id);
                    continue;
                }
            }

            match (&update, slot.tx.try_send(update.clone())) {
                (_, Ok(())) => {}
                (Update::Exists { .. }, Err(_)) => {
                    *slot.pending_exists.lock() = Some(update.clone());
                }
                (_, Err(_)) => {
                    trace!(subscription = id, "disconnecting slow subscriber");
                    stale.push(id);
                }
            }
        }

        for id in stale {
            self.subs.remove(&id);
        }
    }
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Update> {
        self.rx.recv().await
    }

    /// Non-blocking receive; `Err` means nothing is queued right now
    /// (`mpsc::error::TryRecvError::Empty`) or the bus has disconnected this
    /// subscription (`Disconnected`).
    pub fn try_recv(&mut self) -> std::result::Result<Update, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Blocks until `done` resolves, invoking `on_update` for every update
    /// delivered in the meantime. Returns once `done` resolves or the
    /// subscription's channel is closed (bus dropped, or disconnected for
    /// falling behind).
    pub async fn idle<Fut, F>(&mut self, done: Fut, mut on_update: F)
    where
        Fut: Future<Output = ()>,
        F: FnMut(Update),
    {
        tokio::pin!(done);
        loop {
            tokio::select! {
                _ = &mut done => return,
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(update) => on_update(update),
                        None => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_received() {
        let bus = Bus::new();
        let mut sub = bus.subscribe();
        bus.publish(Update::Exists { new_count: 1 });
        assert_eq!(sub.recv().await, Some(Update::Exists { new_count: 1 }));
    }

    #[tokio::test]
    async fn publish_excluding_skips_only_the_named_subscription() {
        let bus = Bus::new();
        let mut excluded = bus.subscribe();
        let mut other = bus.subscribe();
        bus.publish_excluding(Update::Exists { new_count: 1 }, Some(excluded.id));

        assert_eq!(other.recv().await, Some(Update::Exists { new_count: 1 }));
        assert_eq!(excluded.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }

    #[tokio::test]
    async fn overflow_disconnects_on_non_coalescible_update() {
        let bus = Bus::new();
        let sub = bus.subscribe();
        // Fill the channel without draining it.
        for uid in 0..(SUBSCRIPTION_CHANNEL_CAPACITY as u32 + 1) {
            bus.publish(Update::Flags { uid, new_flags: vec![] });
        }
        assert_eq!(bus.subscriber_count(), 0);
        drop(sub);
    }

    #[tokio::test]
    async fn overflow_coalesces_exists_instead_of_disconnecting() {
        let bus = Bus::new();
        let sub = bus.subscribe();
        for n in 0..(SUBSCRIPTION_CHANNEL_CAPACITY as u64 + 5) {
            bus.publish(Update::Exists { new_count: n });
        }
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
    }
}
