#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

//! Durable-store surface consumed by the dispatch core
//!
//! The relational store itself (schema, migrations, SQL) is outside
//! the core; this crate names exactly the operations the core calls,
//! with explicit persisted record shapes so the wire format is stable
//! independent of in-process type layout. [`MemoryStore`] backs
//! embedded deployments and the test suites.

mod error;
mod memory;
mod records;

use async_trait::async_trait;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use records::{
    ChannelRecord, ConsumeLogRecord, SubscriptionLogRecord, SubscriptionRecord,
    UserSubscriptionRecord, UserSubscriptionStatus,
};

/// Operations the core performs against the durable store
#[async_trait]
pub trait Store: Send + Sync {
    // ---- balances ----

    async fn user_quota(&self, user_id: i64) -> Result<i64, StoreError>;

    async fn increase_user_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError>;

    async fn decrease_user_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError>;

    async fn token_remain_quota(&self, token_id: i64) -> Result<i64, StoreError>;

    async fn increase_token_quota(&self, token_id: i64, amount: i64) -> Result<(), StoreError>;

    async fn decrease_token_quota(&self, token_id: i64, amount: i64) -> Result<(), StoreError>;

    // ---- usage accumulators (batch-drain reducers) ----

    async fn add_user_used_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError>;

    async fn add_user_request_count(&self, user_id: i64, count: i64) -> Result<(), StoreError>;

    async fn add_channel_used_quota(&self, channel_id: i64, amount: i64) -> Result<(), StoreError>;

    // ---- channels ----

    /// All channel rows, enabled or not; the cache filters by status
    async fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError>;

    // ---- subscriptions ----

    /// The user's active subscription, if any. A user holds at most
    /// one; creating a new one marks the previous as replaced.
    async fn active_subscription(
        &self,
        user_id: i64,
    ) -> Result<Option<(UserSubscriptionRecord, SubscriptionRecord)>, StoreError>;

    // ---- audit log ----

    async fn record_consume_log(&self, record: ConsumeLogRecord) -> Result<(), StoreError>;

    async fn record_subscription_log(&self, record: SubscriptionLogRecord) -> Result<(), StoreError>;

    /// Distinct IPs seen on consume rows at or after `since_unix`
    async fn distinct_ips_since(&self, user_id: i64, since_unix: i64) -> Result<Vec<String>, StoreError>;

    /// Ban a user with a structured reason (risk guard)
    async fn ban_user(&self, user_id: i64, reason: String) -> Result<(), StoreError>;
}
