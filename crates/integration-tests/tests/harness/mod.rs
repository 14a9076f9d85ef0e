//! Shared fixtures for the end-to-end scenarios
#![allow(dead_code)]

use std::sync::Arc;

use meridian_config::Config;
use meridian_core::{Caller, PriceData, TokenInfo};
use meridian_kv::{Kv, MemoryKv};
use meridian_runtime::{DispatchRequest, Runtime};
use meridian_store::{ChannelRecord, MemoryStore, SubscriptionRecord, UserSubscriptionRecord, UserSubscriptionStatus};

pub const USER: i64 = 1;
pub const TOKEN: i64 = 10;

pub struct Harness {
    pub kv: Arc<MemoryKv>,
    pub store: Arc<MemoryStore>,
    pub runtime: Arc<Runtime>,
}

/// Build a runtime over seeded channels with a rich user
///
/// The trust threshold sits above the seeded funds so pre-consume is
/// exercised; trust-skip scenarios lower it through
/// [`harness_with_config`].
pub async fn harness(channels: &[ChannelRecord]) -> Harness {
    let mut config = Config::default();
    config.quota.trust_quota = 10_000_000;
    harness_with_config(channels, config).await
}

pub async fn harness_with_config(channels: &[ChannelRecord], config: Config) -> Harness {
    let kv = Arc::new(MemoryKv::new());
    let store = Arc::new(MemoryStore::new());
    for channel in channels {
        store.put_channel(channel.clone());
    }
    store.set_user_quota(USER, 1_000_000);
    store.set_token_quota(TOKEN, 1_000_000);

    let runtime = Arc::new(
        Runtime::new(config, store.clone() as Arc<dyn meridian_store::Store>, kv.clone() as Arc<dyn Kv>)
            .await
            .unwrap(),
    );
    Harness { kv, store, runtime }
}

pub fn channel(id: i64, priority: i64, weight: i64, group: &str, model: &str, settings: &str) -> ChannelRecord {
    ChannelRecord {
        id,
        name: format!("channel-{id}"),
        status: 1,
        priority,
        weight,
        groups: group.to_owned(),
        models: model.to_owned(),
        base_url: "https://upstream.example".to_owned(),
        key: "sk-test".to_owned(),
        settings: settings.to_owned(),
    }
}

pub fn sticky_settings(max_count: u32) -> String {
    format!(r#"{{"sticky_enabled": true, "sticky_max_count": {max_count}}}"#)
}

pub fn subscription(daily: i64, weekly: i64, total: i64) -> (UserSubscriptionRecord, SubscriptionRecord) {
    (
        UserSubscriptionRecord {
            id: 77,
            user_id: USER,
            subscription_id: 5,
            status: UserSubscriptionStatus::Active,
            start_time: 0,
            expire_time: meridian_core::civil::unix_now() + 30 * 24 * 3600,
        },
        SubscriptionRecord {
            id: 5,
            name: "pro".to_owned(),
            daily_limit: daily,
            weekly_limit: weekly,
            total_limit: total,
            allowed_groups: vec!["default".to_owned()],
            duration_days: 30,
            enable_exclusive_group: true,
        },
    )
}

/// A dispatch request for `group`/`model` with a session pinned via
/// request metadata
pub fn request(group: &str, model: &str, session: &str, estimate: i64) -> DispatchRequest {
    let body = if session.is_empty() {
        serde_json::json!({
            "messages": [{ "role": "user", "content": "hello" }],
        })
    } else {
        serde_json::json!({
            "metadata": { "user_id": format!("user_session_{session}") },
            "messages": [{ "role": "user", "content": "hello" }],
        })
    };
    DispatchRequest {
        caller: Caller {
            user_id: USER,
            username: "alice".to_owned(),
            user_group: "default".to_owned(),
            is_admin: false,
            risk_exempt: false,
        },
        token: TokenInfo {
            token_id: TOKEN,
            token_name: "cli".to_owned(),
            remain_quota: 1_000_000,
            unlimited: false,
        },
        group: group.to_owned(),
        origin_model: model.to_owned(),
        upstream_model: model.to_owned(),
        price: PriceData::default(),
        body: body.to_string().into_bytes(),
        headers: http::HeaderMap::new(),
        client_ip: "10.0.0.1".to_owned(),
        is_stream: false,
        estimate,
        retry: 0,
        usable_groups: vec![group.to_owned()],
    }
}
