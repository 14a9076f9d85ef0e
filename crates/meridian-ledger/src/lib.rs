#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

//! Quota ledger
//!
//! Debits requests against one of three funding sources (the
//! check-in pool, the subscription envelopes, or the paid balance)
//! with pre-consume/settle semantics and strict source preservation:
//! whatever source funded the pre-consume receives the settle-time
//! refund or top-up. Subscription counters are atomic multi-window
//! increments in the KV; nothing here takes a row lock.

mod checkin;
mod error;
mod ledger;
mod pricing;
mod subscription;

pub use checkin::{CheckinPool, CheckinStatus};
pub use error::LedgerError;
pub use ledger::{
    Ledger, SettleOptions, exclusive_group_name, exclusive_group_user_id, is_exclusive_group,
};
pub use pricing::{PricingInput, QuotaBreakdown, compute_quota};
pub use subscription::SubscriptionQuota;
