use std::sync::Arc;

use meridian_core::{FundingSource, RelayContext, Usage, civil};
use meridian_drain::{Drain, UpdateKind};
use meridian_kv::Kv;
use meridian_store::{
    ConsumeLogRecord, Store, SubscriptionLogRecord, SubscriptionRecord, UserSubscriptionRecord,
};

use crate::checkin::CheckinPool;
use crate::pricing::{PricingInput, QuotaBreakdown, compute_quota};
use crate::subscription::SubscriptionQuota;
use crate::LedgerError;

/// Virtual per-user group prefix; `sub_user_7` is user 7's exclusive
/// group
const EXCLUSIVE_GROUP_PREFIX: &str = "sub_user_";

pub fn is_exclusive_group(group: &str) -> bool {
    group.starts_with(EXCLUSIVE_GROUP_PREFIX)
}

pub fn exclusive_group_name(user_id: i64) -> String {
    format!("{EXCLUSIVE_GROUP_PREFIX}{user_id}")
}

pub fn exclusive_group_user_id(group: &str) -> Option<i64> {
    group.strip_prefix(EXCLUSIVE_GROUP_PREFIX)?.parse().ok()
}

/// Channel-level billing facts the ledger needs at settle time
#[derive(Debug, Clone, Copy, Default)]
pub struct SettleOptions {
    /// Bill 1-hour cache creation at the 5-minute ratio
    pub cache_1h_as_5m: bool,
}

/// The quota ledger: funding-source dispatch, pre-consume, settle,
/// and refund
///
/// Source precedence for a paid request is subscription first, then
/// balance; the free-tier group runs exclusively on the check-in
/// pool, and an exclusive group runs exclusively on its owner's
/// subscription. The source chosen at pre-consume is recorded on the
/// request context and is the only place settle will refund to.
pub struct Ledger {
    kv: Arc<dyn Kv>,
    store: Arc<dyn Store>,
    drain: Arc<Drain>,
    checkin: CheckinPool,
    trust_quota: i64,
    quota_per_unit: f64,
    free_group: String,
}

impl Ledger {
    pub fn new(
        kv: Arc<dyn Kv>,
        store: Arc<dyn Store>,
        drain: Arc<Drain>,
        trust_quota: i64,
        quota_per_unit: f64,
        free_group: String,
    ) -> Self {
        let checkin = CheckinPool::new(kv.clone());
        Self {
            kv,
            store,
            drain,
            checkin,
            trust_quota,
            quota_per_unit,
            free_group,
        }
    }

    pub fn checkin(&self) -> &CheckinPool {
        &self.checkin
    }

    /// Provisionally debit the request's funding source by `estimate`
    ///
    /// Mutates the context with the amount actually pre-consumed, the
    /// source it came from, and the decision flags the relay reports.
    pub async fn pre_consume(
        &self,
        ctx: &mut RelayContext,
        estimate: i64,
    ) -> Result<(), LedgerError> {
        let user_id = ctx.caller.user_id;
        ctx.user_quota = self.store.user_quota(user_id).await?;

        if ctx.group == self.free_group {
            return self.pre_consume_checkin(ctx, estimate).await;
        }
        if is_exclusive_group(&ctx.group) {
            return self.pre_consume_exclusive(ctx, estimate).await;
        }
        self.pre_consume_paid(ctx, estimate).await
    }

    /// Free-tier path: the check-in pool is the only money
    async fn pre_consume_checkin(
        &self,
        ctx: &mut RelayContext,
        estimate: i64,
    ) -> Result<(), LedgerError> {
        let user_id = ctx.caller.user_id;
        let pool = self.checkin.remaining(user_id).await?;
        if pool <= 0 {
            return Err(LedgerError::InsufficientQuota(
                "free-tier pool is empty; check in to refill it or use a paid group".to_owned(),
            ));
        }
        if pool < estimate {
            return Err(LedgerError::InsufficientQuota(format!(
                "free-tier pool has {pool}, request needs {estimate}"
            )));
        }

        if estimate > 0 {
            self.pre_consume_token(ctx, estimate).await?;
            let consumed = self.checkin.consume(user_id, estimate).await?;
            ctx.flags.checkin_consumed = consumed;
            tracing::info!(user_id, consumed, remaining = pool - consumed, "check-in pool pre-consumed");
        }
        ctx.final_pre_consumed = estimate;
        ctx.source = Some(FundingSource::Checkin);
        Ok(())
    }

    /// Exclusive-group path: the owner's subscription only, no
    /// balance fallback
    async fn pre_consume_exclusive(
        &self,
        ctx: &mut RelayContext,
        mut estimate: i64,
    ) -> Result<(), LedgerError> {
        let user_id = ctx.caller.user_id;
        let owner = exclusive_group_user_id(&ctx.group);
        if owner != Some(user_id) {
            return Err(LedgerError::Forbidden(
                "exclusive group belongs to another user".to_owned(),
            ));
        }

        let Some((user_sub, plan)) = self.store.active_subscription(user_id).await? else {
            return Err(LedgerError::InsufficientQuota(
                "an exclusive group requires an active subscription".to_owned(),
            ));
        };
        if !plan.enable_exclusive_group {
            return Err(LedgerError::Forbidden(
                "the current plan does not enable exclusive groups".to_owned(),
            ));
        }

        let quota = self.subscription_quota(&user_sub, &plan);
        let available = quota.available().await?;
        if available <= 0 {
            return Err(LedgerError::InsufficientQuota(
                "subscription envelopes are exhausted".to_owned(),
            ));
        }

        if self.trusted(ctx, available) {
            tracing::info!(user_id, available, "trusted request, skipping pre-consume");
            estimate = 0;
        }

        if estimate > 0 {
            self.pre_consume_token(ctx, estimate).await?;
            if !quota.consume(estimate).await? {
                self.drain.record(UpdateKind::TokenQuota, ctx.token.token_id, estimate).await;
                return Err(LedgerError::InsufficientQuota(
                    "subscription envelopes cannot cover the estimate".to_owned(),
                ));
            }
            ctx.flags.subscription_pre_consumed = true;
            ctx.source = Some(FundingSource::Subscription);
            tracing::info!(user_id, estimate, "exclusive-group subscription pre-consumed");
        }
        ctx.flags.exclusive_used = true;
        ctx.final_pre_consumed = estimate;
        Ok(())
    }

    /// Ordinary paid path: subscription first, balance as fallback
    async fn pre_consume_paid(
        &self,
        ctx: &mut RelayContext,
        mut estimate: i64,
    ) -> Result<(), LedgerError> {
        let user_id = ctx.caller.user_id;

        let subscription = self.store.active_subscription(user_id).await?;
        let sub_available = match &subscription {
            Some((user_sub, plan)) => self.subscription_quota(user_sub, plan).available().await?,
            None => 0,
        };

        // an all-unlimited envelope reports i64::MAX headroom, so the
        // sum must saturate rather than wrap
        let total_available = ctx.user_quota.saturating_add(sub_available);
        if total_available <= 0 {
            return Err(LedgerError::InsufficientQuota(format!(
                "no funds available (subscription {sub_available}, balance {})",
                ctx.user_quota
            )));
        }

        if self.trusted(ctx, total_available) {
            tracing::info!(
                user_id,
                total_available,
                sub_available,
                balance = ctx.user_quota,
                "trusted request, skipping pre-consume"
            );
            estimate = 0;
        }

        if estimate > 0 {
            self.pre_consume_token(ctx, estimate).await?;

            let from_subscription = match &subscription {
                Some((user_sub, plan)) => {
                    self.subscription_quota(user_sub, plan).consume(estimate).await?
                }
                None => false,
            };
            if from_subscription {
                ctx.flags.subscription_pre_consumed = true;
                ctx.source = Some(FundingSource::Subscription);
                tracing::info!(user_id, estimate, "subscription pre-consumed");
            } else {
                if ctx.user_quota < estimate {
                    self.drain.record(UpdateKind::TokenQuota, ctx.token.token_id, estimate).await;
                    return Err(LedgerError::InsufficientQuota(format!(
                        "balance {} cannot cover the estimate {estimate}",
                        ctx.user_quota
                    )));
                }
                if let Err(e) = self.store.decrease_user_quota(user_id, estimate).await {
                    self.drain.record(UpdateKind::TokenQuota, ctx.token.token_id, estimate).await;
                    return Err(e.into());
                }
                ctx.source = Some(FundingSource::Balance);
                tracing::info!(
                    user_id,
                    estimate,
                    remaining = ctx.user_quota - estimate,
                    "balance pre-consumed"
                );
            }
        }
        ctx.final_pre_consumed = estimate;
        Ok(())
    }

    /// Trust-skip: funds comfortably above the threshold and a token
    /// that is unlimited or itself above the threshold
    fn trusted(&self, ctx: &RelayContext, available: i64) -> bool {
        available > self.trust_quota
            && (ctx.token.unlimited || ctx.token.remain_quota > self.trust_quota)
    }

    /// Token-level debit, orthogonal to the funding source
    async fn pre_consume_token(&self, ctx: &RelayContext, amount: i64) -> Result<(), LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InsufficientQuota("negative pre-consume amount".to_owned()));
        }
        if !ctx.token.unlimited {
            let remain = self.store.token_remain_quota(ctx.token.token_id).await?;
            if remain < amount {
                return Err(LedgerError::InsufficientQuota(format!(
                    "token has {remain}, request needs {amount}"
                )));
            }
        }
        self.store.decrease_token_quota(ctx.token.token_id, amount).await?;
        Ok(())
    }

    /// Reconcile the true cost after the upstream returned
    ///
    /// Computes the final quota, applies `final − pre_consumed` to the
    /// recorded funding source, feeds the usage accumulators, and
    /// emits the consume log row. Store failures here are logged and
    /// swallowed: the request already completed and must not fail
    /// retroactively.
    pub async fn settle(
        &self,
        ctx: &RelayContext,
        usage: &Usage,
        options: SettleOptions,
    ) -> Result<i64, LedgerError> {
        let free_cache = ctx.flags.free_cache_creation;
        let breakdown = compute_quota(&PricingInput {
            model_name: &ctx.origin_model,
            usage,
            price: &ctx.price,
            quota_per_unit: self.quota_per_unit,
            cache_1h_as_5m: options.cache_1h_as_5m,
            free_cache_creation: free_cache,
        });

        let mut quota = breakdown.quota;
        let mut content = String::new();
        if breakdown.long_context {
            content.push_str(&format!(
                "long-context pricing applied ({} input tokens)",
                breakdown.total_input_tokens
            ));
        }
        if free_cache && usage.cache_creation_tokens > 0 {
            if !content.is_empty() {
                content.push_str("; ");
            }
            content.push_str(&format!(
                "cache creation forgiven after channel switch ({} tokens unbilled)",
                usage.cache_creation_tokens
            ));
        }

        if usage.total_tokens() == 0 {
            // an empty usage means the upstream failed mid-flight; the
            // row is still recorded so the request is visible
            quota = 0;
            if !content.is_empty() {
                content.push_str("; ");
            }
            content.push_str("zero tokens reported, upstream may have errored");
            tracing::error!(
                user_id = ctx.caller.user_id,
                channel_id = ctx.channel_id,
                model = %ctx.origin_model,
                pre_consumed = ctx.final_pre_consumed,
                "zero-token settle"
            );
        } else {
            self.drain.record(UpdateKind::UsedQuota, ctx.caller.user_id, quota).await;
            self.drain.record(UpdateKind::RequestCount, ctx.caller.user_id, 1).await;
            self.drain.record(UpdateKind::ChannelUsedQuota, ctx.channel_id, quota).await;
        }

        let delta = quota - ctx.final_pre_consumed;
        if delta > 0 {
            tracing::info!(delta, quota, pre_consumed = ctx.final_pre_consumed, "settling extra debit");
        } else if delta < 0 {
            tracing::info!(
                refund = -delta,
                quota,
                pre_consumed = ctx.final_pre_consumed,
                "settling refund"
            );
        }
        if delta != 0 {
            if let Err(e) = self.apply_delta(ctx, delta).await {
                tracing::error!(error = %e, "settle delta failed, counters may drift");
            }
        }

        let record = self.consume_log(ctx, usage, quota, &breakdown, &content);
        if let Err(e) = self.store.record_consume_log(record).await {
            tracing::error!(error = %e, "failed to record consume log");
        }
        Ok(quota)
    }

    /// Apply a settle-time difference to the pre-consume source
    async fn apply_delta(&self, ctx: &RelayContext, delta: i64) -> Result<(), LedgerError> {
        let user_id = ctx.caller.user_id;

        match ctx.source {
            // trust-skip: nothing was pre-consumed, so a positive
            // delta follows normal precedence
            None => {
                if delta > 0 && !self.try_consume_subscription(ctx, delta).await {
                    self.debit_balance_capped(user_id, delta).await?;
                }
            }
            Some(FundingSource::Subscription) => {
                if delta > 0 {
                    // envelope may have filled since pre-consume; only
                    // then may the extra debit degrade to the balance
                    if !self.try_consume_subscription(ctx, delta).await {
                        tracing::warn!(user_id, delta, "subscription exhausted at settle, degrading to balance");
                        self.debit_balance_capped(user_id, delta).await?;
                    }
                } else {
                    self.refund_subscription(user_id, -delta).await;
                }
            }
            Some(FundingSource::Balance) => {
                if delta > 0 {
                    self.debit_balance_capped(user_id, delta).await?;
                } else {
                    self.drain.record(UpdateKind::UserQuota, user_id, -delta).await;
                }
            }
            // free-tier money: the pool absorbs the difference and
            // paid counters stay untouched
            Some(FundingSource::Checkin) => {
                if delta > 0 {
                    self.checkin.consume(user_id, delta).await?;
                } else {
                    self.checkin.refund(user_id, -delta).await?;
                }
            }
        }

        // the token balance always tracks the true cost, on the free
        // tier as much as anywhere else
        if delta > 0 {
            self.store.decrease_token_quota(ctx.token.token_id, delta).await?;
        } else {
            self.drain.record(UpdateKind::TokenQuota, ctx.token.token_id, -delta).await;
        }
        Ok(())
    }

    /// Debit the balance, capping at what the user has; a shortfall is
    /// logged as debt and the request is not failed
    async fn debit_balance_capped(&self, user_id: i64, amount: i64) -> Result<(), LedgerError> {
        let balance = self.store.user_quota(user_id).await?;
        if balance < amount {
            tracing::error!(
                user_id,
                amount,
                balance,
                "balance short at settle, debiting to zero"
            );
            if balance > 0 {
                self.store.decrease_user_quota(user_id, balance).await?;
            }
            return Ok(());
        }
        self.store.decrease_user_quota(user_id, amount).await?;
        Ok(())
    }

    async fn try_consume_subscription(&self, ctx: &RelayContext, amount: i64) -> bool {
        let user_id = ctx.caller.user_id;
        let Ok(Some((user_sub, plan))) = self.store.active_subscription(user_id).await else {
            return false;
        };
        let quota = self.subscription_quota(&user_sub, &plan);
        match quota.consume(amount).await {
            Ok(true) => {
                let log = SubscriptionLogRecord {
                    user_subscription_id: user_sub.id,
                    user_id,
                    quota_used: amount,
                    channel_id: ctx.channel_id,
                    model_name: ctx.origin_model.clone(),
                    token_name: ctx.token.token_name.clone(),
                    created_at: civil::unix_now(),
                };
                if let Err(e) = self.store.record_subscription_log(log).await {
                    tracing::warn!(error = %e, "failed to record subscription log");
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(error = %e, "subscription consume failed");
                false
            }
        }
    }

    async fn refund_subscription(&self, user_id: i64, amount: i64) {
        match self.store.active_subscription(user_id).await {
            Ok(Some((user_sub, plan))) => {
                if let Err(e) = self.subscription_quota(&user_sub, &plan).refund(amount).await {
                    tracing::error!(error = %e, user_id, amount, "subscription refund failed");
                }
            }
            Ok(None) => {
                tracing::error!(user_id, amount, "no active subscription to refund into");
            }
            Err(e) => {
                tracing::error!(error = %e, user_id, amount, "subscription refund lookup failed");
            }
        }
    }

    /// Return everything pre-consumed after an upstream failure
    ///
    /// Funds go back to the source that provided them; for the
    /// free-tier group only the check-in pool is touched.
    pub async fn refund_pre_consumed(&self, ctx: &RelayContext) {
        let user_id = ctx.caller.user_id;

        if ctx.group == self.free_group {
            if ctx.flags.checkin_consumed > 0 {
                tracing::info!(
                    user_id,
                    amount = ctx.flags.checkin_consumed,
                    "returning check-in pool pre-consume after failure"
                );
                if let Err(e) = self.checkin.refund(user_id, ctx.flags.checkin_consumed).await {
                    tracing::error!(error = %e, "check-in refund failed");
                }
            }
            if ctx.final_pre_consumed != 0 {
                self.drain
                    .record(UpdateKind::TokenQuota, ctx.token.token_id, ctx.final_pre_consumed)
                    .await;
            }
            return;
        }

        if ctx.final_pre_consumed == 0 {
            return;
        }
        tracing::info!(
            user_id,
            amount = ctx.final_pre_consumed,
            source = ?ctx.source,
            "returning pre-consume after failure"
        );
        self.drain
            .record(UpdateKind::TokenQuota, ctx.token.token_id, ctx.final_pre_consumed)
            .await;
        match ctx.source {
            Some(FundingSource::Subscription) => {
                self.refund_subscription(user_id, ctx.final_pre_consumed).await;
            }
            _ => {
                self.drain
                    .record(UpdateKind::UserQuota, user_id, ctx.final_pre_consumed)
                    .await;
            }
        }
    }

    fn subscription_quota(
        &self,
        user_sub: &UserSubscriptionRecord,
        plan: &SubscriptionRecord,
    ) -> SubscriptionQuota {
        SubscriptionQuota::new(self.kv.clone(), user_sub, plan)
    }

    fn consume_log(
        &self,
        ctx: &RelayContext,
        usage: &Usage,
        quota: i64,
        breakdown: &QuotaBreakdown,
        content: &str,
    ) -> ConsumeLogRecord {
        let mut other = serde_json::Map::new();
        let price = &ctx.price;
        other.insert("model_ratio".into(), price.model_ratio.into());
        other.insert("group_ratio".into(), price.group_ratio.into());
        other.insert("completion_ratio".into(), price.completion_ratio.into());
        other.insert("cache_ratio".into(), price.cache_ratio.into());
        other.insert("cache_creation_ratio".into(), price.cache_creation_ratio.into());
        other.insert("cache_tokens".into(), usage.cache_read_tokens.into());
        other.insert(
            "cache_creation_tokens".into(),
            breakdown.billed_cache_creation_tokens.into(),
        );
        if price.use_price {
            other.insert("model_price".into(), price.model_price.into());
        }
        if breakdown.long_context {
            other.insert("is_long_context".into(), true.into());
            other.insert("total_input_tokens".into(), breakdown.total_input_tokens.into());
            other.insert("long_context_input_multiplier".into(), breakdown.input_multiplier.into());
            other.insert(
                "long_context_output_multiplier".into(),
                breakdown.output_multiplier.into(),
            );
        }
        if ctx.flags.free_cache_creation {
            other.insert("free_cache_creation".into(), true.into());
            other.insert(
                "free_cache_original_tokens".into(),
                usage.cache_creation_tokens.into(),
            );
            if let Some(prev) = ctx.flags.free_cache_prev_channel {
                other.insert("free_cache_prev_channel".into(), prev.into());
            }
        }

        ConsumeLogRecord {
            user_id: ctx.caller.user_id,
            token_id: ctx.token.token_id,
            token_name: ctx.token.token_name.clone(),
            channel_id: ctx.channel_id,
            model_name: ctx.origin_model.clone(),
            group: ctx.group.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota,
            duration_secs: (civil::unix_now() - ctx.started_at).max(0),
            is_stream: ctx.is_stream,
            content: content.to_owned(),
            other,
            ip: ctx.client_ip.clone(),
            created_at: civil::unix_now(),
        }
    }
}
