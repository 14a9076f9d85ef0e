use std::time::Duration;

use meridian_store::ChannelRecord;
use secrecy::SecretString;
use serde::Deserialize;

use crate::normalize::normalize_model_name;

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    /// Disabled by the error policy; eligible for automatic re-enable
    AutoDisabled,
}

impl ChannelStatus {
    /// Decode the stored integer form; unknown values read as
    /// manually disabled so a bad row can never serve traffic
    pub fn from_stored(value: i32) -> Self {
        match value {
            1 => Self::Enabled,
            3 => Self::AutoDisabled,
            _ => Self::ManuallyDisabled,
        }
    }

    pub fn as_stored(self) -> i32 {
        match self {
            Self::Enabled => 1,
            Self::ManuallyDisabled => 2,
            Self::AutoDisabled => 3,
        }
    }
}

/// Per-channel settings, stored as a JSON blob on the channel row
///
/// Every field has a default; an unparsable blob degrades to the
/// defaults with a warning rather than failing the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub sticky_enabled: bool,
    /// Live-session cap; 0 = unlimited
    pub sticky_max_count: u32,
    /// Binding lifetime; 0 falls back to the configured default
    pub sticky_ttl_minutes: u32,
    /// New bindings per civil day; 0 = unlimited
    pub sticky_daily_bind_limit: u32,
    /// Exclude the channel temporarily on session-concurrency errors
    pub concurrency_auto_exclude: bool,
    /// Exclusion duration; 0 falls back to two minutes
    pub concurrency_exclude_minutes: u32,
    /// Bill 1-hour cache creation at the 5-minute ratio
    pub cache_1h_as_5m: bool,
    /// Forward all client headers upstream instead of the default set
    pub pass_through_headers: bool,
    pub claude_code_test_enabled: bool,
    pub header_audit: HeaderAuditSettings,
    pub content_audit: ContentAuditSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeaderAuditSettings {
    pub enabled: bool,
    /// JSON object mapping header name to a required regex
    pub rules: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContentAuditSettings {
    pub enabled: bool,
    /// Newline-separated keyword list
    pub keywords: String,
}

impl ChannelSettings {
    /// Parse the stored settings blob; empty or invalid JSON yields
    /// the defaults
    pub fn from_stored(channel_id: i64, raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str(raw) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(channel_id, error = %e, "invalid channel settings, using defaults");
                Self::default()
            }
        }
    }

    /// Effective exclusion duration for concurrency errors
    pub fn exclusion_duration(&self) -> Duration {
        let minutes = if self.concurrency_exclude_minutes == 0 {
            2
        } else {
            u64::from(self.concurrency_exclude_minutes)
        };
        Duration::from_secs(minutes * 60)
    }
}

/// In-process view of one upstream provider endpoint
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub status: ChannelStatus,
    /// Higher priorities are tried first
    pub priority: i64,
    /// Relative share within a priority tier; all-zero tiers are
    /// smoothed at selection time
    pub weight: i64,
    groups: Vec<String>,
    models: Vec<String>,
    pub base_url: String,
    keys: Vec<SecretString>,
    pub settings: ChannelSettings,
}

impl Channel {
    pub fn from_record(record: &ChannelRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            status: ChannelStatus::from_stored(record.status),
            priority: record.priority,
            weight: record.weight,
            groups: split_list(&record.groups, ','),
            models: split_list(&record.models, ','),
            base_url: record.base_url.clone(),
            keys: record
                .key
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| SecretString::from(line.to_owned()))
                .collect(),
            settings: ChannelSettings::from_stored(record.id, &record.settings),
        }
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn supports_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    /// Whether the channel serves the model, by exact or normalized name
    pub fn supports_model(&self, model: &str) -> bool {
        let normalized = normalize_model_name(model);
        self.models.iter().any(|m| m == model || *m == normalized)
    }

    /// Effective sticky TTL, falling back to the configured default
    pub fn sticky_ttl(&self, default_minutes: u32) -> Duration {
        let minutes = if self.settings.sticky_ttl_minutes == 0 {
            default_minutes.max(1)
        } else {
            self.settings.sticky_ttl_minutes
        };
        Duration::from_secs(u64::from(minutes) * 60)
    }

    pub fn is_multi_key(&self) -> bool {
        self.keys.len() > 1
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Credential at a polling cursor position
    pub fn key_at(&self, index: usize) -> Option<&SecretString> {
        if self.keys.is_empty() {
            None
        } else {
            self.keys.get(index % self.keys.len())
        }
    }
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn record(id: i64, groups: &str, models: &str) -> ChannelRecord {
        ChannelRecord {
            id,
            name: format!("channel-{id}"),
            status: 1,
            priority: 0,
            weight: 0,
            groups: groups.to_owned(),
            models: models.to_owned(),
            base_url: "https://upstream.example".to_owned(),
            key: "sk-test".to_owned(),
            settings: String::new(),
        }
    }

    #[test]
    fn parses_delimited_lists() {
        let channel = Channel::from_record(&record(1, "std, vip ,", "m-1,m-2"));
        assert_eq!(channel.groups(), ["std", "vip"]);
        assert!(channel.supports_group("vip"));
        assert!(!channel.supports_group("free"));
        assert!(channel.supports_model("m-1"));
        assert!(!channel.supports_model("m-3"));
    }

    #[test]
    fn normalized_model_matches() {
        let channel = Channel::from_record(&record(1, "std", "claude-sonnet-4"));
        assert!(channel.supports_model("claude-sonnet-4-20250514"));
        assert!(channel.supports_model("anthropic/claude-sonnet-4"));
    }

    #[test]
    fn settings_blob_failures_degrade_to_defaults() {
        let mut rec = record(1, "std", "m");
        rec.settings = "{not json".to_owned();
        let channel = Channel::from_record(&rec);
        assert_eq!(channel.settings, ChannelSettings::default());

        rec.settings = r#"{"sticky_enabled": true, "sticky_max_count": 5}"#.to_owned();
        let channel = Channel::from_record(&rec);
        assert!(channel.settings.sticky_enabled);
        assert_eq!(channel.settings.sticky_max_count, 5);
    }

    #[test]
    fn multi_key_rotation_wraps() {
        let mut rec = record(1, "std", "m");
        rec.key = "sk-a\nsk-b\n\nsk-c\n".to_owned();
        let channel = Channel::from_record(&rec);
        assert!(channel.is_multi_key());
        assert_eq!(channel.key_count(), 3);
        assert!(channel.key_at(3).is_some());
        assert!(channel.key_at(0).is_some());
    }

    #[test]
    fn unknown_status_reads_disabled() {
        assert_eq!(ChannelStatus::from_stored(1), ChannelStatus::Enabled);
        assert_eq!(ChannelStatus::from_stored(3), ChannelStatus::AutoDisabled);
        assert_eq!(ChannelStatus::from_stored(99), ChannelStatus::ManuallyDisabled);
    }
}
