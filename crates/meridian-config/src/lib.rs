#![allow(clippy::must_use_candidate)]

//! Configuration for the Meridian dispatch core
//!
//! Loaded from a TOML file with `{{ env.VAR }}` placeholder expansion,
//! then validated. Every section has workable defaults so an embedded
//! deployment can start from `Config::default()`.

mod env;
mod loader;

use serde::Deserialize;
use url::Url;

/// Top-level configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Key/value store connection; absent means in-memory mode
    #[serde(default)]
    pub kv: Option<KvConfig>,
    /// Quota ledger tuning
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Channel dispatch tuning
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Batch-update drain tuning
    #[serde(default)]
    pub batch: BatchConfig,
    /// IP-cardinality risk guard
    #[serde(default)]
    pub risk: RiskConfig,
    /// Log filter configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Key/value store connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KvConfig {
    /// Connection URL (`redis://…`)
    pub url: Url,
    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

/// Quota ledger settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    /// Funds level above which pre-consume is skipped entirely
    #[serde(default = "default_trust_quota")]
    pub trust_quota: i64,
    /// Quota units per unit of flat model price
    #[serde(default = "default_quota_per_unit")]
    pub quota_per_unit: f64,
    /// Group name whose requests run exclusively on the check-in pool
    #[serde(default = "default_free_group")]
    pub free_group: String,
    /// Quota granted by one daily check-in claim
    #[serde(default = "default_checkin_grant")]
    pub checkin_grant: i64,
    /// Whether channel-switch cache creation is forgiven
    #[serde(default = "default_true")]
    pub free_cache_creation: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            trust_quota: default_trust_quota(),
            quota_per_unit: default_quota_per_unit(),
            free_group: default_free_group(),
            checkin_grant: default_checkin_grant(),
            free_cache_creation: true,
        }
    }
}

/// Channel dispatch settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Groups tried in order when a request addresses group "auto"
    #[serde(default)]
    pub auto_groups: Vec<String>,
    /// Seconds between channel cache rebuilds
    #[serde(default = "default_sync_frequency")]
    pub sync_frequency_secs: u64,
    /// Sticky TTL applied when a channel leaves it unset
    #[serde(default = "default_sticky_ttl_minutes")]
    pub default_sticky_ttl_minutes: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            auto_groups: Vec::new(),
            sync_frequency_secs: default_sync_frequency(),
            default_sticky_ttl_minutes: default_sticky_ttl_minutes(),
        }
    }
}

/// Batch-update drain settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// Seconds between flushes to the durable store
    #[serde(default = "default_batch_interval")]
    pub interval_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_batch_interval(),
        }
    }
}

/// IP-cardinality risk guard settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    /// Master switch; disabled guards observe nothing
    #[serde(default)]
    pub enabled: bool,
    /// Rolling window in minutes
    #[serde(default = "default_risk_window")]
    pub window_minutes: u32,
    /// Distinct-IP count at which the guard confirms and bans
    #[serde(default = "default_risk_threshold")]
    pub ip_threshold: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_minutes: default_risk_window(),
            ip_threshold: default_risk_threshold(),
        }
    }
}

/// Log filter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// `tracing` env-filter directive (e.g. "info,meridian_ledger=debug")
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

fn default_pool_size() -> usize {
    10
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_trust_quota() -> i64 {
    500_000
}
fn default_quota_per_unit() -> f64 {
    500_000.0
}
fn default_free_group() -> String {
    "free".to_owned()
}
fn default_checkin_grant() -> i64 {
    10_000
}
fn default_sync_frequency() -> u64 {
    60
}
fn default_sticky_ttl_minutes() -> u32 {
    60
}
fn default_batch_interval() -> u64 {
    5
}
fn default_risk_window() -> u32 {
    10
}
fn default_risk_threshold() -> u32 {
    5
}
fn default_log_filter() -> String {
    "info".to_owned()
}
fn default_true() -> bool {
    true
}
