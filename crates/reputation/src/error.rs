use common::types::ModerationStatus;
use thiserror::Error;

/// Caller-visible input problems. Retrying without changing the input fails the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("stake of {amount} is below the minimum of {min}")]
    BelowMinimum { amount: i64, min: i64 },

    #[error("stake of {amount} is above the maximum of {max}")]
    AboveMaximum { amount: i64, max: i64 },

    #[error("comment {0} not found")]
    CommentNotFound(i64),

    #[error("post {0} is a thread root, not a comment")]
    NotAComment(i64),

    #[error("user {user_id} cannot invest in their own comment {comment_id}")]
    SelfInvestment { user_id: i64, comment_id: i64 },

    #[error("comment {comment_id} is {status} and cannot be staked")]
    CommentIneligible {
        comment_id: i64,
        status: ModerationStatus,
    },

    #[error("insufficient balance: have {available}, need {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    #[error("point delta must be non-zero")]
    ZeroDelta,

    #[error("post {0} not found")]
    PostNotFound(i64),

    #[error("parent post {parent_id} not found in hub {hub_id}")]
    ParentNotFound { parent_id: i64, hub_id: i64 },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("investment {0} not found")]
    NotFound(i64),

    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl LedgerError {
    /// Validation and not-found errors are the caller's to fix; storage errors may be transient.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }

    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(v) => Some(v),
            _ => None,
        }
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;
