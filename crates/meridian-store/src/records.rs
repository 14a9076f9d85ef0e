use serde::{Deserialize, Serialize};

/// Channel row as persisted
///
/// `status` uses the stored integer encoding (1 enabled, 2 manually
/// disabled, 3 auto-disabled); `groups` and `models` are the stored
/// comma-delimited lists and `settings` the raw JSON settings blob.
/// The channel crate owns the typed in-process view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: i64,
    pub name: String,
    pub status: i32,
    pub priority: i64,
    pub weight: i64,
    pub groups: String,
    pub models: String,
    pub base_url: String,
    /// Upstream credentials; newline-delimited for multi-key channels
    pub key: String,
    /// Raw JSON settings blob; invalid JSON falls back to defaults
    pub settings: String,
}

/// Subscription plan row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: i64,
    pub name: String,
    /// 0 means unlimited, for each of the three envelopes
    pub daily_limit: i64,
    pub weekly_limit: i64,
    pub total_limit: i64,
    pub allowed_groups: Vec<String>,
    pub duration_days: i64,
    pub enable_exclusive_group: bool,
}

/// Lifecycle state of a user's subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserSubscriptionStatus {
    Active,
    Expired,
    Canceled,
    /// Superseded by a newer subscription
    Replaced,
}

/// A user's subscription instance
///
/// Usage is not stored here; the window counters live in the KV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSubscriptionRecord {
    pub id: i64,
    pub user_id: i64,
    pub subscription_id: i64,
    pub status: UserSubscriptionStatus,
    pub start_time: i64,
    pub expire_time: i64,
}

/// One row per settled request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLogRecord {
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub model_name: String,
    pub group: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    /// Final settled quota
    pub quota: i64,
    pub duration_secs: i64,
    pub is_stream: bool,
    /// Human-readable billing remarks
    pub content: String,
    /// Ratios, long-context flag, cache breakdown, free-cache facts
    pub other: serde_json::Map<String, serde_json::Value>,
    /// Client IP, used by the risk guard's confirmation query
    pub ip: String,
    pub created_at: i64,
}

/// One row per subscription-funded debit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionLogRecord {
    pub user_subscription_id: i64,
    pub user_id: i64,
    pub quota_used: i64,
    pub channel_id: i64,
    pub model_name: String,
    pub token_name: String,
    pub created_at: i64,
}
