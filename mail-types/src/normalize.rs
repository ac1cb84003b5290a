//! Normalization contracts consumed from the front-end/collaborator layer.
//! The core calls these synchronously on the hot path (every login lookup,
//! every delivery recipient), so they are plain traits, not
//! `async_trait`-based like a network-calling login provider would be.

/// Maps a raw login string (as offered on an IMAP/SMTP AUTH exchange) to the
/// canonical account key the core indexes accounts under.
///
/// Implementations decide what "canonical" means: case folding, PRECIS
/// profiles, alias resolution. The core treats the output as an opaque
/// `String` key.
pub trait AuthNormalize: Send + Sync {
    fn normalize(&self, raw: &str) -> String;
}

/// Maps a raw RCPT TO / delivery address to the canonical account key used
/// to route an incoming message.
pub trait DeliveryNormalize: Send + Sync {
    fn normalize(&self, raw: &str) -> String;
}

/// A lookup from a normalized login key to the account key it maps to
/// (spec.md §6's `StorageMap`): case/alias folding done by a deployment's
/// directory, independent of [`AuthNormalize`]'s string-shape normalization.
/// `lookup` returns `None` when the key is absent from the map, which the
/// core surfaces as [`crate::error::MailError::InvalidCredentials`].
pub trait KeyLookup: Send + Sync {
    fn lookup(&self, normalized: &str) -> Option<String>;
}

/// A deployment's login directory, if it has one configured. Deployments
/// without a real one can leave this unset: the core then treats the
/// normalized key as the account key directly, with no lookup at all.
pub type OptionalAuthMap = Option<Box<dyn KeyLookup>>;

/// A fixed, in-memory `KeyLookup` — the shape a real directory-backed map
/// takes in tests; a deployment would back this with its own store instead.
#[derive(Debug, Default, Clone)]
pub struct StaticKeyMap {
    entries: std::collections::HashMap<String, String>,
}

impl StaticKeyMap {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self { entries: entries.into_iter().collect() }
    }
}

impl KeyLookup for StaticKeyMap {
    fn lookup(&self, normalized: &str) -> Option<String> {
        self.entries.get(normalized).cloned()
    }
}

/// Identity normalization: returns the input unchanged. Used in tests and as
/// a fallback when no configured normalization name resolves to a real
/// implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityNormalize;

impl AuthNormalize for IdentityNormalize {
    fn normalize(&self, raw: &str) -> String {
        raw.to_string()
    }
}

impl DeliveryNormalize for IdentityNormalize {
    fn normalize(&self, raw: &str) -> String {
        raw.to_string()
    }
}

/// Lowercases and trims the local part, leaving the domain untouched.
/// Named after the `precis_casefold_email` profile used as the default
/// `delivery_normalize`; a placeholder for local testing, not a full PRECIS
/// implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrecisCasefoldEmail;

impl AuthNormalize for PrecisCasefoldEmail {
    fn normalize(&self, raw: &str) -> String {
        casefold(raw)
    }
}

impl DeliveryNormalize for PrecisCasefoldEmail {
    fn normalize(&self, raw: &str) -> String {
        casefold(raw)
    }
}

fn casefold(raw: &str) -> String {
    match raw.split_once('@') {
        Some((local, domain)) => format!("{}@{}", local.trim().to_lowercase(), domain.trim().to_lowercase()),
        None => raw.trim().to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_a_no_op() {
        assert_eq!(IdentityNormalize.normalize("Alice@Example.COM"), "Alice@Example.COM");
    }

    #[test]
    fn casefold_lowercases_both_parts() {
        assert_eq!(PrecisCasefoldEmail.normalize(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn casefold_handles_bare_local_part() {
        assert_eq!(PrecisCasefoldEmail.normalize("ADMIN"), "admin");
    }

    #[test]
    fn static_key_map_resolves_known_key() {
        let map = StaticKeyMap::new([("alice@example.com".to_string(), "alice".to_string())]);
        assert_eq!(map.lookup("alice@example.com"), Some("alice".to_string()));
    }

    #[test]
    fn static_key_map_reports_absence_for_unknown_key() {
        let map = StaticKeyMap::new([("alice@example.com".to_string(), "alice".to_string())]);
        assert_eq!(map.lookup("bob@example.com"), None);
    }
}
