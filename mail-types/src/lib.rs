//! Shared types for the in-memory mail storage engine: the error kinds the
//! core surfaces, the configuration it is built from, and the normalization
//! contracts it consumes from its authentication/delivery collaborators.
//!
//! This crate holds no mutable state and does no locking; it is the
//! vocabulary the `mail-core` engine is built on.

pub mod config;
pub mod error;
pub mod normalize;
pub mod time;

pub use config::EngineConfig;
pub use error::MailError;
pub use normalize::{AuthNormalize, DeliveryNormalize, KeyLookup, OptionalAuthMap, StaticKeyMap};
