use http::StatusCode;
use meridian_core::HttpError;
use meridian_kv::KvError;
use meridian_store::StoreError;
use thiserror::Error;

/// Quota ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The checked funding source cannot cover the request
    #[error("insufficient quota: {0}")]
    InsufficientQuota(String),

    /// The caller may not use the addressed group
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The daily check-in was already claimed
    #[error("already checked in today")]
    AlreadyCheckedIn,

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HttpError for LedgerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InsufficientQuota(_) | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::AlreadyCheckedIn => StatusCode::BAD_REQUEST,
            Self::Kv(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::InsufficientQuota(_) => "insufficient_user_quota",
            Self::Forbidden(_) => "forbidden",
            Self::AlreadyCheckedIn => "already_checked_in",
            Self::Kv(_) | Self::Store(_) => "internal_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Kv(_) | Self::Store(_) => "internal error".to_owned(),
            other => other.to_string(),
        }
    }
}
