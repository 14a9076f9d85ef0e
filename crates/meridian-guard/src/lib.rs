#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

//! Risk and audit guards
//!
//! Per-channel request auditing (header rules, content keywords), the
//! per-user IP-cardinality guard, and classification of upstream
//! failures (channel disable/enable predicates, session-concurrency
//! detection).

mod audit;
mod failure;
mod risk;

use thiserror::Error;

pub use audit::{AuditRejection, ChannelAudit, request_text};
pub use failure::{is_session_concurrency_error, should_disable_channel, should_enable_channel};
pub use risk::IpGuard;

/// Guard errors
#[derive(Debug, Error)]
pub enum GuardError {
    /// A channel's audit configuration cannot be compiled; the
    /// request fails rather than passing unaudited
    #[error("header audit misconfigured: {0}")]
    AuditMisconfigured(String),

    #[error(transparent)]
    Kv(#[from] meridian_kv::KvError),

    #[error(transparent)]
    Store(#[from] meridian_store::StoreError),
}
