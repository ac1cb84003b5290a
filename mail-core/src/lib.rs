//! In-memory, multi-user mail storage engine.
//!
//! This crate holds the state machine behind an IMAP4rev1 front-end and an
//! SMTP/LMTP delivery front-end: a content-addressed blob pool ([`blob`]),
//! per-account mailbox/UID bookkeeping ([`mailbox`], [`account`]), a
//! transactional multi-recipient delivery pipeline ([`delivery`]), and the
//! per-session update bus IMAP `IDLE` rides on ([`bus`]). [`store`] ties
//! the four together into the single object a surrounding server holds.
//!
//! Wire protocols, authentication, TLS, and on-disk persistence all live
//! outside this crate; it keeps every message in process memory and is
//! discarded whole on restart.

pub mod account;
pub mod admin;
pub mod blob;
pub mod bus;
pub mod delivery;
pub mod mailbox;
pub mod store;

/// IMAP extensions this engine's semantics support, for the (out-of-scope)
/// IMAP front-end to advertise in its own `CAPABILITY` response. This crate
/// has no wire-protocol dependency of its own, so the list is a plain
/// string constant rather than a capability type from an IMAP codec.
pub const ADVERTISED_EXTENSIONS: &[&str] =
    &["APPENDLIMIT", "MOVE", "CHILDREN", "SPECIAL-USE", "I18NLEVEL=1", "QUOTA"];

pub use account::Account;
pub use blob::{Blob, BlobPool, ContentHash};
pub use bus::{Subscription, Update};
pub use delivery::{Delivery, DeliveryMetadata, DeliveryReceipt};
pub use mailbox::Mailbox;
pub use store::Store;

pub use mail_types::{error::MailError, error::Result};
