use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// `APPEND` is capped process-wide at 4 GiB - 1 by default.
pub const APPENDLIMIT_MAX: u32 = u32::MAX;

/// Configuration recognized by the engine.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Enables verbose event logs.
    pub debug: bool,

    /// Name of the Junk folder provisioned for every account.
    pub junk_mailbox: String,

    /// Name of the normalization function used for account keying.
    pub auth_normalize: String,

    /// Name of the normalization function used for recipient routing.
    pub delivery_normalize: String,

    /// Seconds a message may live before `prune_messages` removes it.
    /// Zero disables pruning.
    pub retention_secs: u64,

    /// Seconds an account may stay unused before `prune_unused_accounts`
    /// removes it. Zero disables pruning.
    pub unused_account_retention_secs: u64,

    /// Default per-account quota in bytes, used when neither the account's
    /// own quota nor a global override is set.
    pub default_quota_bytes: u64,

    /// Whether delivery to an unknown recipient creates the account.
    pub auto_create: bool,

    /// Process-wide `APPEND`/delivery size limit, in bytes.
    pub appendlimit_bytes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debug: false,
            junk_mailbox: "Junk".to_string(),
            auth_normalize: "auto".to_string(),
            delivery_normalize: "precis_casefold_email".to_string(),
            retention_secs: 0,
            unused_account_retention_secs: 0,
            default_quota_bytes: 0,
            auto_create: false,
            appendlimit_bytes: APPENDLIMIT_MAX,
        }
    }
}

impl EngineConfig {
    /// Loads a TOML configuration file from disk.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let mut file = std::fs::OpenOptions::new().read(true).open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn from_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_appendlimit_is_capped() {
        assert_eq!(EngineConfig::default().appendlimit_bytes, APPENDLIMIT_MAX);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg = EngineConfig::from_str("auto_create = true\n").unwrap();
        assert!(cfg.auto_create);
        assert_eq!(cfg.junk_mailbox, "Junk");
    }
}
