use thiserror::Error;

/// Errors raised while admitting or storing a single event.
///
/// Every variant here maps to exactly one wire disposition, per the
/// table in the connection state machine: everything except
/// [`RelayError::Transport`] is surfaced to the client as a failed `OK`
/// frame and the connection stays open.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("bad id")]
    BadId,

    #[error("bad signature: {0}")]
    BadSignature(String),

    #[error("malformed: {0}")]
    Malformed(String),

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("duplicate")]
    Duplicate,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("empty filter")]
    EmptyFilter,
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::Storage(e.to_string())
    }
}

impl RelayError {
    /// The human-readable reason carried in an `OK` frame's message field.
    /// Empty string means "do not prefix with `error:`" (only used for the
    /// success path, which never constructs a `RelayError`).
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Duplicate => "duplicate".to_string(),
            other => format!("error: {other}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
