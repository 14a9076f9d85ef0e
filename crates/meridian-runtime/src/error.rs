use http::StatusCode;
use meridian_channel::ChannelError;
use meridian_core::HttpError;
use meridian_guard::{AuditRejection, GuardError};
use meridian_ledger::LedgerError;
use thiserror::Error;

/// Request-time errors surfaced to the relay
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The caller was banned by the risk guard
    #[error("account suspended by risk control")]
    Banned,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Audit(#[from] AuditRejection),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Store(#[from] meridian_store::StoreError),
}

impl HttpError for RuntimeError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Banned => StatusCode::FORBIDDEN,
            Self::Channel(e) => e.status_code(),
            Self::Ledger(e) => e.status_code(),
            Self::Audit(e) => e.status_code(),
            Self::Guard(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Banned => "account_suspended",
            Self::Channel(e) => e.error_type(),
            Self::Ledger(e) => e.error_type(),
            Self::Audit(e) => e.error_type(),
            Self::Guard(GuardError::AuditMisconfigured(_)) => "audit_misconfigured",
            Self::Guard(_) | Self::Store(_) => "internal_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Banned => self.to_string(),
            Self::Channel(e) => e.client_message(),
            Self::Ledger(e) => e.client_message(),
            Self::Audit(e) => e.client_message(),
            Self::Guard(GuardError::AuditMisconfigured(_)) => "header audit misconfigured".to_owned(),
            Self::Guard(_) | Self::Store(_) => "internal error".to_owned(),
        }
    }
}
