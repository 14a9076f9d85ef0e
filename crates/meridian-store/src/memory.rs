use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    ChannelRecord, ConsumeLogRecord, Store, StoreError, SubscriptionLogRecord, SubscriptionRecord,
    UserSubscriptionRecord, UserSubscriptionStatus,
};

/// In-process [`Store`] for embedded deployments and tests
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    user_quota: HashMap<i64, i64>,
    token_quota: HashMap<i64, i64>,
    user_used_quota: HashMap<i64, i64>,
    user_request_count: HashMap<i64, i64>,
    channel_used_quota: HashMap<i64, i64>,
    channels: Vec<ChannelRecord>,
    subscriptions: HashMap<i64, (UserSubscriptionRecord, SubscriptionRecord)>,
    consume_logs: Vec<ConsumeLogRecord>,
    subscription_logs: Vec<SubscriptionLogRecord>,
    banned: HashMap<i64, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ---- seeding and inspection, used by embedding code and tests ----

    pub fn set_user_quota(&self, user_id: i64, quota: i64) {
        self.lock().user_quota.insert(user_id, quota);
    }

    pub fn set_token_quota(&self, token_id: i64, quota: i64) {
        self.lock().token_quota.insert(token_id, quota);
    }

    pub fn put_channel(&self, record: ChannelRecord) {
        let mut inner = self.lock();
        inner.channels.retain(|c| c.id != record.id);
        inner.channels.push(record);
    }

    /// Attach an active subscription to a user, replacing any prior one
    pub fn put_subscription(&self, user: UserSubscriptionRecord, plan: SubscriptionRecord) {
        debug_assert_eq!(user.status, UserSubscriptionStatus::Active);
        self.lock().subscriptions.insert(user.user_id, (user, plan));
    }

    pub fn user_used_quota(&self, user_id: i64) -> i64 {
        self.lock().user_used_quota.get(&user_id).copied().unwrap_or(0)
    }

    pub fn user_request_count(&self, user_id: i64) -> i64 {
        self.lock().user_request_count.get(&user_id).copied().unwrap_or(0)
    }

    pub fn channel_used_quota(&self, channel_id: i64) -> i64 {
        self.lock().channel_used_quota.get(&channel_id).copied().unwrap_or(0)
    }

    pub fn consume_logs(&self) -> Vec<ConsumeLogRecord> {
        self.lock().consume_logs.clone()
    }

    pub fn subscription_logs(&self) -> Vec<SubscriptionLogRecord> {
        self.lock().subscription_logs.clone()
    }

    pub fn banned_reason(&self, user_id: i64) -> Option<String> {
        self.lock().banned.get(&user_id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user_quota(&self, user_id: i64) -> Result<i64, StoreError> {
        Ok(self.lock().user_quota.get(&user_id).copied().unwrap_or(0))
    }

    async fn increase_user_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError> {
        *self.lock().user_quota.entry(user_id).or_insert(0) += amount;
        Ok(())
    }

    async fn decrease_user_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError> {
        *self.lock().user_quota.entry(user_id).or_insert(0) -= amount;
        Ok(())
    }

    async fn token_remain_quota(&self, token_id: i64) -> Result<i64, StoreError> {
        Ok(self.lock().token_quota.get(&token_id).copied().unwrap_or(0))
    }

    async fn increase_token_quota(&self, token_id: i64, amount: i64) -> Result<(), StoreError> {
        *self.lock().token_quota.entry(token_id).or_insert(0) += amount;
        Ok(())
    }

    async fn decrease_token_quota(&self, token_id: i64, amount: i64) -> Result<(), StoreError> {
        *self.lock().token_quota.entry(token_id).or_insert(0) -= amount;
        Ok(())
    }

    async fn add_user_used_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError> {
        *self.lock().user_used_quota.entry(user_id).or_insert(0) += amount;
        Ok(())
    }

    async fn add_user_request_count(&self, user_id: i64, count: i64) -> Result<(), StoreError> {
        *self.lock().user_request_count.entry(user_id).or_insert(0) += count;
        Ok(())
    }

    async fn add_channel_used_quota(&self, channel_id: i64, amount: i64) -> Result<(), StoreError> {
        *self.lock().channel_used_quota.entry(channel_id).or_insert(0) += amount;
        Ok(())
    }

    async fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError> {
        Ok(self.lock().channels.clone())
    }

    async fn active_subscription(
        &self,
        user_id: i64,
    ) -> Result<Option<(UserSubscriptionRecord, SubscriptionRecord)>, StoreError> {
        Ok(self
            .lock()
            .subscriptions
            .get(&user_id)
            .filter(|(user, _)| user.status == UserSubscriptionStatus::Active)
            .cloned())
    }

    async fn record_consume_log(&self, record: ConsumeLogRecord) -> Result<(), StoreError> {
        self.lock().consume_logs.push(record);
        Ok(())
    }

    async fn record_subscription_log(&self, record: SubscriptionLogRecord) -> Result<(), StoreError> {
        self.lock().subscription_logs.push(record);
        Ok(())
    }

    async fn distinct_ips_since(&self, user_id: i64, since_unix: i64) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        let ips: BTreeSet<String> = inner
            .consume_logs
            .iter()
            .filter(|log| log.user_id == user_id && log.created_at >= since_unix && !log.ip.is_empty())
            .map(|log| log.ip.clone())
            .collect();
        Ok(ips.into_iter().collect())
    }

    async fn ban_user(&self, user_id: i64, reason: String) -> Result<(), StoreError> {
        self.lock().banned.insert(user_id, reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(user_id: i64, ip: &str, created_at: i64) -> ConsumeLogRecord {
        ConsumeLogRecord {
            user_id,
            token_id: 1,
            token_name: "t".to_owned(),
            channel_id: 1,
            model_name: "m".to_owned(),
            group: "default".to_owned(),
            prompt_tokens: 10,
            completion_tokens: 5,
            quota: 100,
            duration_secs: 1,
            is_stream: false,
            content: String::new(),
            other: serde_json::Map::new(),
            ip: ip.to_owned(),
            created_at,
        }
    }

    #[tokio::test]
    async fn balances_move_both_ways() {
        let store = MemoryStore::new();
        store.set_user_quota(1, 1000);
        store.decrease_user_quota(1, 300).await.unwrap();
        store.increase_user_quota(1, 100).await.unwrap();
        assert_eq!(store.user_quota(1).await.unwrap(), 800);
    }

    #[tokio::test]
    async fn distinct_ips_filters_window_and_user() {
        let store = MemoryStore::new();
        store.record_consume_log(log(1, "10.0.0.1", 100)).await.unwrap();
        store.record_consume_log(log(1, "10.0.0.2", 200)).await.unwrap();
        store.record_consume_log(log(1, "10.0.0.2", 250)).await.unwrap();
        store.record_consume_log(log(1, "10.0.0.3", 50)).await.unwrap();
        store.record_consume_log(log(2, "10.0.0.9", 200)).await.unwrap();

        let ips = store.distinct_ips_since(1, 100).await.unwrap();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn inactive_subscription_is_invisible() {
        let store = MemoryStore::new();
        let plan = SubscriptionRecord {
            id: 1,
            name: "pro".to_owned(),
            daily_limit: 0,
            weekly_limit: 0,
            total_limit: 0,
            allowed_groups: vec!["default".to_owned()],
            duration_days: 30,
            enable_exclusive_group: false,
        };
        let mut user = UserSubscriptionRecord {
            id: 7,
            user_id: 1,
            subscription_id: 1,
            status: UserSubscriptionStatus::Active,
            start_time: 0,
            expire_time: i64::MAX,
        };
        store.put_subscription(user.clone(), plan.clone());
        assert!(store.active_subscription(1).await.unwrap().is_some());

        user.status = UserSubscriptionStatus::Replaced;
        store.lock().subscriptions.insert(1, (user, plan));
        assert!(store.active_subscription(1).await.unwrap().is_none());
    }
}
