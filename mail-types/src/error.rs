use thiserror::Error;

/// Error kinds surfaced by the core to its front-end collaborators.
///
/// Most internal failures (a racing delete, a transient normalization
/// hiccup during background maintenance) are logged and absorbed by the
/// caller rather than turned into one of these; this enum only carries the
/// handful of outcomes the surrounding IMAP/SMTP front-ends must act on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailError {
    #[error("no such mailbox")]
    NoSuchMailbox,

    #[error("mailbox already exists")]
    MailboxExists,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("message too large")]
    MessageTooLarge,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("user does not exist")]
    UserDoesNotExist,

    #[error("cannot delete INBOX")]
    CannotDeleteInbox,

    #[error("cannot rename INBOX")]
    CannotRenameInbox,

    #[error("internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, MailError>;
