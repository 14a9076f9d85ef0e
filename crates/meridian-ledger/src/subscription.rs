use std::sync::Arc;
use std::time::Duration;

use meridian_core::civil;
use meridian_kv::{Kv, KvError, WindowConsume, WindowOutcome};
use meridian_store::{SubscriptionRecord, UserSubscriptionRecord};

const QUOTA_PREFIX: &str = "subscription:quota:";

/// A subscription's three window counters
///
/// Keys are `subscription:quota:{user_subscription_id}:{period}:{key}`
/// with period keys `YYYY-MM-DD`, `YYYY-Www`, and the literal `total`.
/// Counters reset implicitly by TTL aligned to the period boundary;
/// the total window lives as long as the subscription itself. The one
/// Lua-scripted consume is the only mechanism enforcing the limits, so
/// concurrent requests cannot jointly breach an envelope.
pub struct SubscriptionQuota {
    kv: Arc<dyn Kv>,
    user_subscription_id: i64,
    limits: [i64; 3],
    expire_time: i64,
}

impl SubscriptionQuota {
    pub fn new(kv: Arc<dyn Kv>, user_sub: &UserSubscriptionRecord, plan: &SubscriptionRecord) -> Self {
        Self {
            kv,
            user_subscription_id: user_sub.id,
            limits: [plan.daily_limit, plan.weekly_limit, plan.total_limit],
            expire_time: user_sub.expire_time,
        }
    }

    fn keys(&self) -> [String; 3] {
        let now = civil::now();
        let id = self.user_subscription_id;
        [
            format!("{QUOTA_PREFIX}{id}:daily:{}", civil::day_key(now)),
            format!("{QUOTA_PREFIX}{id}:weekly:{}", civil::week_key(now)),
            format!("{QUOTA_PREFIX}{id}:total:total"),
        ]
    }

    fn ttls(&self) -> [Duration; 3] {
        let now = civil::now();
        let until_expiry = (self.expire_time - civil::unix_now()).max(1) as u64;
        [
            civil::until_midnight(now),
            civil::until_next_monday(now),
            Duration::from_secs(until_expiry),
        ]
    }

    /// Used amounts for the current daily/weekly/total windows
    pub async fn used(&self) -> Result<[i64; 3], KvError> {
        let keys = self.keys();
        let mut used = [0_i64; 3];
        for (slot, key) in used.iter_mut().zip(&keys) {
            if let Some(raw) = self.kv.get(key).await? {
                *slot = raw
                    .parse()
                    .map_err(|e| KvError::Decode(format!("window counter {key}: {e}")))?;
            }
        }
        Ok(used)
    }

    /// Headroom across the three envelopes: the tightest remaining
    /// amount, never negative; a limit of 0 imposes nothing
    pub async fn available(&self) -> Result<i64, KvError> {
        let used = self.used().await?;
        let mut available = i64::MAX;
        for (limit, used) in self.limits.into_iter().zip(used) {
            if limit > 0 {
                available = available.min(limit - used);
            }
        }
        Ok(available.max(0))
    }

    /// Atomically debit all three windows under their limits
    ///
    /// Returns false without moving anything when any envelope would
    /// be breached.
    pub async fn consume(&self, amount: i64) -> Result<bool, KvError> {
        if amount <= 0 {
            return Ok(true);
        }
        let op = WindowConsume {
            keys: self.keys(),
            amount,
            limits: self.limits,
            ttls: self.ttls(),
        };
        match self.kv.window_consume(&op).await? {
            WindowOutcome::Applied { .. } => Ok(true),
            WindowOutcome::Exceeded { index, used, limit } => {
                let window = ["daily", "weekly", "total"][index.min(2)];
                tracing::debug!(
                    user_subscription_id = self.user_subscription_id,
                    window,
                    used,
                    limit,
                    amount,
                    "subscription envelope would be breached"
                );
                Ok(false)
            }
        }
    }

    /// Credit back a previously consumed amount, flooring at zero
    pub async fn refund(&self, amount: i64) -> Result<(), KvError> {
        if amount <= 0 {
            return Ok(());
        }
        self.kv.window_refund(&self.keys(), amount).await
    }
}
