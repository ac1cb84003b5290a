use std::time::{SystemTime, UNIX_EPOCH};

/// Returns milliseconds since UNIX Epoch.
pub fn now_msec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Fix your clock :o")
        .as_millis() as u64
}

/// Returns seconds since UNIX Epoch, the unit `internal_date` and
/// `first_login_at` are tracked in.
pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Fix your clock :o")
        .as_secs()
}

/// Sentinel for `Account::first_login_at` before the first successful
/// session-open.
pub const FIRST_LOGIN_UNSET: u64 = 1;
