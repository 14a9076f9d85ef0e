use std::collections::BTreeSet;
use std::sync::Arc;

use meridian_session::{BindOutcome, BindPolicy, StickyRegistry, SwitchHistory};
use rand::Rng;

use crate::{Channel, ChannelCache, ChannelError, ChannelStatus};

/// One selection request
#[derive(Debug, Clone, Copy)]
pub struct PickRequest<'a> {
    pub group: &'a str,
    pub model: &'a str,
    /// 0-based priority tier to start from; the relay advances this
    /// after a failed attempt
    pub retry: usize,
    /// Session fingerprint; empty disables affinity
    pub session_id: &'a str,
    /// Groups the caller may use, for "auto" resolution
    pub usable_groups: &'a [String],
    pub username: &'a str,
    pub token_name: &'a str,
}

/// A dispatched channel with its decision facts
#[derive(Debug, Clone)]
pub struct Selection {
    pub channel: Arc<Channel>,
    /// The group actually used (resolved from "auto" when applicable)
    pub group: String,
    /// A sticky binding now exists for this session
    pub sticky_bound: bool,
    /// Previous channel when the switch qualifies for free cache
    /// creation
    pub free_cache_prev_channel: Option<i64>,
}

/// Channel selector: cache + sticky registry + switch history
pub struct Selector {
    cache: Arc<ChannelCache>,
    registry: Arc<StickyRegistry>,
    history: Arc<SwitchHistory>,
    auto_groups: Vec<String>,
    default_sticky_ttl_minutes: u32,
    free_cache_enabled: bool,
}

impl Selector {
    pub fn new(
        cache: Arc<ChannelCache>,
        registry: Arc<StickyRegistry>,
        history: Arc<SwitchHistory>,
        auto_groups: Vec<String>,
        default_sticky_ttl_minutes: u32,
        free_cache_enabled: bool,
    ) -> Self {
        Self {
            cache,
            registry,
            history,
            auto_groups,
            default_sticky_ttl_minutes,
            free_cache_enabled,
        }
    }

    /// Pick a channel for the request and bind the session to it
    pub async fn pick(&self, request: &PickRequest<'_>) -> Result<Selection, ChannelError> {
        let (channel, group) = if request.group == "auto" {
            self.pick_auto(request).await?
        } else {
            (
                self.pick_in_group(request.group, request).await?,
                request.group.to_owned(),
            )
        };

        let (sticky_bound, free_cache_prev_channel) =
            self.after_select(&group, request, &channel).await;

        Ok(Selection {
            channel,
            group,
            sticky_bound,
            free_cache_prev_channel,
        })
    }

    async fn pick_auto(&self, request: &PickRequest<'_>) -> Result<(Arc<Channel>, String), ChannelError> {
        for group in &self.auto_groups {
            if !request.usable_groups.contains(group) {
                continue;
            }
            match self.pick_in_group(group, request).await {
                Ok(channel) => {
                    tracing::debug!(%group, "auto group selected");
                    return Ok((channel, group.clone()));
                }
                Err(e) => {
                    tracing::debug!(%group, error = %e, "auto group candidate failed");
                }
            }
        }
        Err(ChannelError::AutoGroupsExhausted {
            model: request.model.to_owned(),
        })
    }

    async fn pick_in_group(
        &self,
        group: &str,
        request: &PickRequest<'_>,
    ) -> Result<Arc<Channel>, ChannelError> {
        if !request.session_id.is_empty()
            && let Some(channel) = self.sticky_hit(group, request).await
        {
            return Ok(channel);
        }
        self.pick_fresh(group, request.model, request.retry, request.session_id).await
    }

    /// Resolve an existing binding, validating that the channel can
    /// still serve the session; stale bindings are deleted
    async fn sticky_hit(&self, group: &str, request: &PickRequest<'_>) -> Option<Arc<Channel>> {
        let binding = match self.registry.lookup(group, request.model, request.session_id).await {
            Ok(Some(binding)) => binding,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(error = %e, "sticky lookup failed, selecting fresh");
                return None;
            }
        };

        let channel = self.cache.channel(binding.channel_id);
        let valid = channel.as_ref().is_some_and(|c| {
            c.status == ChannelStatus::Enabled
                && c.supports_group(group)
                && c.supports_model(request.model)
                && c.settings.sticky_enabled
        });
        if !valid {
            tracing::debug!(
                channel_id = binding.channel_id,
                session = request.session_id,
                "stale sticky binding, releasing"
            );
            if let Err(e) = self
                .registry
                .unbind(group, request.model, request.session_id, binding.channel_id)
                .await
            {
                tracing::debug!(error = %e, "failed to release stale binding");
            }
            return None;
        }

        let channel = channel?;
        let ttl = channel.sticky_ttl(self.default_sticky_ttl_minutes);
        if let Err(e) = self
            .registry
            .renew_ttl(group, request.model, request.session_id, ttl)
            .await
        {
            tracing::debug!(error = %e, "sticky TTL renewal failed");
        }
        Some(channel)
    }

    async fn pick_fresh(
        &self,
        group: &str,
        model: &str,
        retry: usize,
        session_id: &str,
    ) -> Result<Arc<Channel>, ChannelError> {
        let channels: Vec<Arc<Channel>> = self
            .cache
            .candidates(group, model)
            .into_iter()
            .filter_map(|id| self.cache.channel(id))
            .collect();
        if channels.is_empty() {
            return Err(ChannelError::NoChannelAvailable {
                group: group.to_owned(),
                model: model.to_owned(),
            });
        }

        // unique priorities, descending
        let priorities: Vec<i64> = channels
            .iter()
            .map(|c| std::cmp::Reverse(c.priority))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|r| r.0)
            .collect();
        let start = retry.min(priorities.len() - 1);

        for &priority in &priorities[start..] {
            let tier: Vec<Arc<Channel>> = channels
                .iter()
                .filter(|c| c.priority == priority)
                .cloned()
                .collect();
            let tier = self.filter_excluded(tier).await;
            if tier.is_empty() {
                continue;
            }

            if session_id.is_empty() {
                return Ok(select_by_weight(&tier));
            }

            let available = self.filter_by_capacity(tier).await;
            if available.is_empty() {
                continue;
            }
            if should_even_distribute(&available) {
                return Ok(self.select_fewest_bound(available).await);
            }
            return Ok(select_by_weight(&available));
        }

        // every tier was at capacity; serve the original tier without
        // the capacity filter rather than failing the request
        tracing::debug!(group, model, "all tiers at session capacity, ignoring caps");
        let tier: Vec<Arc<Channel>> = channels
            .iter()
            .filter(|c| c.priority == priorities[start])
            .cloned()
            .collect();
        let tier = self.filter_excluded(tier).await;
        if tier.is_empty() {
            return Err(ChannelError::NoChannelAvailable {
                group: group.to_owned(),
                model: model.to_owned(),
            });
        }
        Ok(select_by_weight(&tier))
    }

    async fn filter_excluded(&self, channels: Vec<Arc<Channel>>) -> Vec<Arc<Channel>> {
        let mut kept = Vec::with_capacity(channels.len());
        for channel in channels {
            if channel.settings.concurrency_auto_exclude
                && self.registry.is_excluded(channel.id).await.unwrap_or(false)
            {
                tracing::debug!(channel_id = channel.id, "channel temporarily excluded");
                continue;
            }
            kept.push(channel);
        }
        kept
    }

    /// Keep channels with a free session slot; sticky-disabled and
    /// uncapped channels always qualify
    async fn filter_by_capacity(&self, channels: Vec<Arc<Channel>>) -> Vec<Arc<Channel>> {
        let mut kept = Vec::with_capacity(channels.len());
        for channel in channels {
            let settings = &channel.settings;
            if !settings.sticky_enabled || settings.sticky_max_count == 0 {
                kept.push(channel);
                continue;
            }
            match self.registry.count(channel.id).await {
                Ok(count) if count < settings.sticky_max_count as usize => kept.push(channel),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(channel_id = channel.id, error = %e, "session count failed, skipping");
                }
            }
        }
        kept
    }

    /// Fewest-bindings selection for even sticky distribution;
    /// ties break uniformly at random
    async fn select_fewest_bound(&self, channels: Vec<Arc<Channel>>) -> Arc<Channel> {
        let mut counted = Vec::with_capacity(channels.len());
        for channel in channels {
            let count = self.registry.count(channel.id).await.unwrap_or(0);
            counted.push((count, channel));
        }
        let min = counted.iter().map(|(count, _)| *count).min().unwrap_or(0);
        let tied: Vec<Arc<Channel>> = counted
            .into_iter()
            .filter(|(count, _)| *count == min)
            .map(|(_, channel)| channel)
            .collect();
        if tied.len() == 1 {
            return tied[0].clone();
        }
        tied[rand::thread_rng().gen_range(0..tied.len())].clone()
    }

    /// Free-cache decision, usage-history write, and session bind
    async fn after_select(
        &self,
        group: &str,
        request: &PickRequest<'_>,
        channel: &Arc<Channel>,
    ) -> (bool, Option<i64>) {
        if request.session_id.is_empty() {
            return (false, None);
        }

        let mut free_cache_prev = None;
        let lowered = request.model.to_lowercase();
        let cache_capable_model = lowered.contains("opus") || lowered.contains("sonnet");
        if self.free_cache_enabled && cache_capable_model {
            match self
                .history
                .free_cache_eligible(group, request.model, request.session_id, channel.id, channel.priority)
                .await
            {
                Ok(prev) => free_cache_prev = prev,
                Err(e) => tracing::debug!(error = %e, "free-cache eligibility check failed"),
            }
            if let Err(e) = self
                .history
                .record(group, request.model, request.session_id, channel.id, channel.priority)
                .await
            {
                tracing::warn!(error = %e, "failed to record session channel usage");
            }
        }

        let mut sticky_bound = false;
        if channel.settings.sticky_enabled {
            let policy = BindPolicy {
                ttl: channel.sticky_ttl(self.default_sticky_ttl_minutes),
                max_count: channel.settings.sticky_max_count,
                daily_bind_limit: channel.settings.sticky_daily_bind_limit,
            };
            match self
                .registry
                .bind(
                    group,
                    request.model,
                    request.session_id,
                    channel.id,
                    policy,
                    request.username,
                    request.token_name,
                )
                .await
            {
                Ok(BindOutcome::Bound | BindOutcome::Renewed) => sticky_bound = true,
                Ok(BindOutcome::DailyLimitReached | BindOutcome::CapacityReached) => {
                    tracing::debug!(channel_id = channel.id, "proceeding unsticky, bind refused");
                }
                Err(e) => tracing::warn!(error = %e, "failed to bind sticky session"),
            }
        }
        (sticky_bound, free_cache_prev)
    }
}

fn should_even_distribute(channels: &[Arc<Channel>]) -> bool {
    channels.len() > 1
        && channels
            .iter()
            .all(|c| c.weight == 0 && c.settings.sticky_enabled)
}

/// Weighted random draw with the smoothing rules:
/// an all-zero tier gets a uniform effective weight of 100, and a
/// tier whose mean weight is below 10 is scaled by 100 to reduce
/// rounding collisions
fn select_by_weight(channels: &[Arc<Channel>]) -> Arc<Channel> {
    if channels.len() == 1 {
        return channels[0].clone();
    }

    let mut sum: i64 = channels.iter().map(|c| c.weight).sum();
    let mut smoothing_factor = 1;
    let mut smoothing_adjustment = 0;
    if sum == 0 {
        sum = channels.len() as i64 * 100;
        smoothing_adjustment = 100;
    } else if sum / (channels.len() as i64) < 10 {
        smoothing_factor = 100;
    }

    let total = sum * smoothing_factor;
    let mut draw = rand::thread_rng().gen_range(0..total);
    for channel in channels {
        draw -= channel.weight * smoothing_factor + smoothing_adjustment;
        if draw < 0 {
            return channel.clone();
        }
    }
    channels[0].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kv::MemoryKv;
    use meridian_store::ChannelRecord;

    fn sticky_settings(max_count: u32) -> String {
        format!(
            r#"{{"sticky_enabled": true, "sticky_max_count": {max_count}, "sticky_ttl_minutes": 60}}"#
        )
    }

    fn record(id: i64, priority: i64, weight: i64, settings: &str) -> ChannelRecord {
        ChannelRecord {
            id,
            name: format!("channel-{id}"),
            status: 1,
            priority,
            weight,
            groups: "std".to_owned(),
            models: "claude-sonnet-4".to_owned(),
            base_url: String::new(),
            key: "sk-test".to_owned(),
            settings: settings.to_owned(),
        }
    }

    struct Fixture {
        cache: Arc<ChannelCache>,
        registry: Arc<StickyRegistry>,
        selector: Selector,
    }

    fn fixture(records: &[ChannelRecord]) -> Fixture {
        let kv = Arc::new(MemoryKv::new());
        let cache = Arc::new(ChannelCache::new());
        cache.rebuild(records);
        let registry = Arc::new(StickyRegistry::new(kv.clone()));
        let history = Arc::new(SwitchHistory::new(kv));
        let selector = Selector::new(cache.clone(), registry.clone(), history, Vec::new(), 60, true);
        Fixture {
            cache,
            registry,
            selector,
        }
    }

    fn request<'a>(session_id: &'a str, retry: usize) -> PickRequest<'a> {
        PickRequest {
            group: "std",
            model: "claude-sonnet-4",
            retry,
            session_id,
            usable_groups: &[],
            username: "alice",
            token_name: "cli",
        }
    }

    #[tokio::test]
    async fn repeated_sessions_stick_to_one_channel() {
        let fixture = fixture(&[
            record(1, 10, 0, &sticky_settings(0)),
            record(2, 10, 0, &sticky_settings(0)),
        ]);

        let first = fixture.selector.pick(&request("s1", 0)).await.unwrap();
        assert!(first.sticky_bound);
        for _ in 0..5 {
            let again = fixture.selector.pick(&request("s1", 0)).await.unwrap();
            assert_eq!(again.channel.id, first.channel.id);
            assert!(again.sticky_bound);
        }
    }

    #[tokio::test]
    async fn stale_binding_is_released_and_reselected() {
        let fixture = fixture(&[
            record(1, 10, 0, &sticky_settings(0)),
            record(2, 5, 0, &sticky_settings(0)),
        ]);

        let first = fixture.selector.pick(&request("s1", 0)).await.unwrap();
        assert_eq!(first.channel.id, 1);

        fixture.cache.set_status(1, ChannelStatus::AutoDisabled);
        let second = fixture.selector.pick(&request("s1", 0)).await.unwrap();
        assert_eq!(second.channel.id, 2);
        // binding for the disabled channel is gone
        assert!(
            fixture
                .registry
                .lookup("std", "claude-sonnet-4", "s1")
                .await
                .unwrap()
                .is_some_and(|b| b.channel_id == 2)
        );
    }

    #[tokio::test]
    async fn retry_advances_to_the_next_tier() {
        let fixture = fixture(&[
            record(1, 10, 0, ""),
            record(2, 5, 0, ""),
            record(3, 1, 0, ""),
        ]);

        assert_eq!(fixture.selector.pick(&request("", 0)).await.unwrap().channel.id, 1);
        assert_eq!(fixture.selector.pick(&request("", 1)).await.unwrap().channel.id, 2);
        assert_eq!(fixture.selector.pick(&request("", 2)).await.unwrap().channel.id, 3);
        // retry past the last tier clamps
        assert_eq!(fixture.selector.pick(&request("", 9)).await.unwrap().channel.id, 3);
    }

    #[tokio::test]
    async fn excluded_channel_is_skipped_until_expiry() {
        let auto_exclude = r#"{"concurrency_auto_exclude": true}"#;
        let fixture = fixture(&[record(1, 10, 0, auto_exclude), record(2, 5, 0, "")]);

        fixture
            .registry
            .mark_excluded(1, std::time::Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(fixture.selector.pick(&request("", 0)).await.unwrap().channel.id, 2);
    }

    #[tokio::test]
    async fn capacity_overflow_advances_then_falls_back() {
        let fixture = fixture(&[
            record(1, 10, 0, &sticky_settings(1)),
            record(2, 5, 0, &sticky_settings(1)),
        ]);

        // fill both channels with one session each
        let a = fixture.selector.pick(&request("s1", 0)).await.unwrap();
        assert_eq!(a.channel.id, 1);
        let b = fixture.selector.pick(&request("s2", 0)).await.unwrap();
        assert_eq!(b.channel.id, 2);

        // a third session finds every tier at capacity and falls back
        // to the original tier ignoring caps; the bind itself is
        // refused so the cap holds
        let c = fixture.selector.pick(&request("s3", 0)).await.unwrap();
        assert_eq!(c.channel.id, 1);
        assert!(!c.sticky_bound);
        assert_eq!(fixture.registry.count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn even_distribution_prefers_fewest_bindings() {
        let fixture = fixture(&[
            record(1, 10, 0, &sticky_settings(0)),
            record(2, 10, 0, &sticky_settings(0)),
        ]);

        for i in 0..4 {
            fixture
                .selector
                .pick(&request(&format!("s{i}"), 0))
                .await
                .unwrap();
        }
        assert_eq!(fixture.registry.count(1).await.unwrap(), 2);
        assert_eq!(fixture.registry.count(2).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn missing_bucket_is_an_error() {
        let fixture = fixture(&[record(1, 10, 0, "")]);
        let mut req = request("", 0);
        req.model = "unknown-model";
        assert!(matches!(
            fixture.selector.pick(&req).await,
            Err(ChannelError::NoChannelAvailable { .. })
        ));
    }

    #[tokio::test]
    async fn auto_group_respects_usable_list() {
        let kv = Arc::new(MemoryKv::new());
        let cache = Arc::new(ChannelCache::new());
        let mut in_vip = record(1, 10, 0, "");
        in_vip.groups = "vip".to_owned();
        cache.rebuild(&[in_vip]);
        let registry = Arc::new(StickyRegistry::new(kv.clone()));
        let history = Arc::new(SwitchHistory::new(kv));
        let selector = Selector::new(
            cache,
            registry,
            history,
            vec!["std".to_owned(), "vip".to_owned()],
            60,
            true,
        );

        let usable = vec!["vip".to_owned()];
        let mut req = request("", 0);
        req.group = "auto";
        req.usable_groups = &usable;
        let picked = selector.pick(&req).await.unwrap();
        assert_eq!(picked.group, "vip");
        assert_eq!(picked.channel.id, 1);

        // nothing usable -> exhausted
        let empty: Vec<String> = Vec::new();
        req.usable_groups = &empty;
        assert!(matches!(
            selector.pick(&req).await,
            Err(ChannelError::AutoGroupsExhausted { .. })
        ));
    }
}
