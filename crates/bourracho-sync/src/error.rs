use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Reasons a command is refused. Validation failures are returned before
/// anything is persisted or broadcast.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conversation is locked")]
    Locked,

    #[error("conversation is not locked")]
    NotLocked,

    #[error("{0} not found")]
    NotFound(String),

    #[error("already a member")]
    AlreadyMember,

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    /// Stable machine-readable code, used in API bodies and gateway replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Forbidden(_) => "forbidden",
            Self::Locked => "locked",
            Self::NotLocked => "not_locked",
            Self::NotFound(_) => "not_found",
            Self::AlreadyMember => "already_member",
            Self::Invalid(_) => "invalid",
            Self::Storage(_) => "storage",
        }
    }
}
