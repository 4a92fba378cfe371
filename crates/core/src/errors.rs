//! Error types for the relationship engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Named failure codes the UI branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequesterId,
    InvalidRecipientId,
    InvalidRequesterAlias,
    InvalidUserId,
    InvalidAlias,
    CannotLinkSelf,
    ProfileNotFound,
    RequestNotFound,
    AlreadyHasPartner,
    RecipientAlreadyHasPartner,
    AlreadyLinked,
    NotPartners,
    RequestNotPending,
    RequestExpired,
    NoRoutine,
    AliasTaken,
    SyncNotAllowed,
}

/// Error taxonomy used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input, rejected before any state is touched.
    Validation,
    /// Expected, user-facing outcome such as "already linked".
    Precondition,
    /// A referenced document does not exist.
    MissingDependency,
    /// Store or network failure; the step may be retried.
    Transient,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequesterId => "INVALID_REQUESTER_ID",
            Self::InvalidRecipientId => "INVALID_RECIPIENT_ID",
            Self::InvalidRequesterAlias => "INVALID_REQUESTER_ALIAS",
            Self::InvalidUserId => "INVALID_USER_ID",
            Self::InvalidAlias => "INVALID_ALIAS",
            Self::CannotLinkSelf => "CANNOT_LINK_SELF",
            Self::ProfileNotFound => "PROFILE_NOT_FOUND",
            Self::RequestNotFound => "REQUEST_NOT_FOUND",
            Self::AlreadyHasPartner => "ALREADY_HAS_PARTNER",
            Self::RecipientAlreadyHasPartner => "RECIPIENT_ALREADY_HAS_PARTNER",
            Self::AlreadyLinked => "ALREADY_LINKED",
            Self::NotPartners => "NOT_PARTNERS",
            Self::RequestNotPending => "REQUEST_NOT_PENDING",
            Self::RequestExpired => "REQUEST_EXPIRED",
            Self::NoRoutine => "NO_ROUTINE",
            Self::AliasTaken => "ALIAS_TAKEN",
            Self::SyncNotAllowed => "SYNC_NOT_ALLOWED",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidRequesterId
            | Self::InvalidRecipientId
            | Self::InvalidRequesterAlias
            | Self::InvalidUserId
            | Self::InvalidAlias
            | Self::CannotLinkSelf => ErrorCategory::Validation,
            Self::ProfileNotFound | Self::RequestNotFound => ErrorCategory::MissingDependency,
            Self::AlreadyHasPartner
            | Self::RecipientAlreadyHasPartner
            | Self::AlreadyLinked
            | Self::NotPartners
            | Self::RequestNotPending
            | Self::RequestExpired
            | Self::NoRoutine
            | Self::AliasTaken
            | Self::SyncNotAllowed => ErrorCategory::Precondition,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Named protocol outcome (validation, precondition or missing dependency).
    #[error("{code}: {message}")]
    Relationship { code: ErrorCode, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Relationship {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Error code if this is a named protocol outcome.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Relationship { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Relationship { code, .. } => code.category(),
            Self::Store(StoreError::NotFound(_)) => ErrorCategory::MissingDependency,
            Self::Store(err) if err.is_transient() => ErrorCategory::Transient,
            Self::Store(_) | Self::Json(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// True when the caller should offer a retry.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_code(&self, code: ErrorCode) -> bool {
        self.error_code() == Some(code)
    }
}
