use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use meridian_channel::{Channel, ChannelCache, PickRequest, Selector};
use meridian_config::Config;
use meridian_core::{Caller, PriceData, RelayContext, TokenInfo, Usage, UpstreamError, civil};
use meridian_drain::Drain;
use meridian_guard::{ChannelAudit, IpGuard, is_session_concurrency_error, should_disable_channel};
use meridian_kv::Kv;
use meridian_ledger::{Ledger, SettleOptions};
use meridian_session::{StickyRegistry, SwitchHistory, extract_session_id};
use meridian_store::Store;
use tokio_util::sync::CancellationToken;

use crate::RuntimeError;

/// Everything the relay resolved before calling the core
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub caller: Caller,
    pub token: TokenInfo,
    /// Group addressed by the API key ("auto" triggers auto-group
    /// resolution)
    pub group: String,
    pub origin_model: String,
    pub upstream_model: String,
    pub price: PriceData,
    /// Raw request body, used for session fingerprinting and content
    /// audit only
    pub body: Vec<u8>,
    pub headers: HeaderMap,
    pub client_ip: String,
    pub is_stream: bool,
    /// Estimated cost for pre-consume
    pub estimate: i64,
    /// 0-based priority tier to start from (advanced on retries)
    pub retry: usize,
    /// Groups the caller may use, for "auto" resolution
    pub usable_groups: Vec<String>,
}

/// A dispatched request: the chosen channel plus the accounting
/// context the relay must hand back at settle time
#[derive(Debug)]
pub struct Dispatch {
    pub channel: Arc<Channel>,
    pub ctx: RelayContext,
}

/// What happened on the failure path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureDisposition {
    /// The channel was temporarily excluded from selection
    pub channel_excluded: bool,
    /// The external channel policy should disable this channel
    pub should_disable: bool,
}

/// The assembled dispatch core
pub struct Runtime {
    config: Config,
    store: Arc<dyn Store>,
    cache: Arc<ChannelCache>,
    registry: Arc<StickyRegistry>,
    selector: Selector,
    ledger: Ledger,
    drain: Arc<Drain>,
    ip_guard: IpGuard,
    shutdown: CancellationToken,
}

impl Runtime {
    /// Build the runtime and load the initial channel snapshot
    pub async fn new(
        config: Config,
        store: Arc<dyn Store>,
        kv: Arc<dyn Kv>,
    ) -> Result<Self, RuntimeError> {
        let cache = Arc::new(ChannelCache::new());
        let records = store.channels().await?;
        cache.rebuild(&records);

        let registry = Arc::new(StickyRegistry::new(kv.clone()));
        let history = Arc::new(SwitchHistory::new(kv.clone()));
        let selector = Selector::new(
            cache.clone(),
            registry.clone(),
            history,
            config.dispatch.auto_groups.clone(),
            config.dispatch.default_sticky_ttl_minutes,
            config.quota.free_cache_creation,
        );

        let drain = Arc::new(Drain::new(
            Some(kv.clone()),
            store.clone(),
            Duration::from_secs(config.batch.interval_secs),
        ));
        let ledger = Ledger::new(
            kv.clone(),
            store.clone(),
            drain.clone(),
            config.quota.trust_quota,
            config.quota.quota_per_unit,
            config.quota.free_group.clone(),
        );
        let ip_guard = IpGuard::new(
            kv,
            store.clone(),
            config.risk.enabled,
            config.risk.window_minutes,
            config.risk.ip_threshold,
        );

        Ok(Self {
            config,
            store,
            cache,
            registry,
            selector,
            ledger,
            drain,
            ip_guard,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the background tasks: periodic channel sync and the
    /// batch-update flush loop
    pub fn start(self: &Arc<Self>) {
        self.drain.start(self.shutdown.clone());

        let runtime = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(runtime.config.dispatch.sync_frequency_secs);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the constructor already loaded the first snapshot
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        runtime.refresh_channels().await;
                    }
                }
            }
        });
    }

    /// Stop background tasks and flush everything buffered
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.drain.flush().await;
        tracing::info!("dispatch core stopped");
    }

    /// Rebuild the channel snapshot now (admin writes call this
    /// instead of waiting for the next tick)
    pub async fn refresh_channels(&self) {
        match self.store.channels().await {
            Ok(records) => self.cache.rebuild(&records),
            Err(e) => tracing::error!(error = %e, "channel snapshot refresh failed"),
        }
    }

    pub fn cache(&self) -> &Arc<ChannelCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<StickyRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn drain(&self) -> &Arc<Drain> {
        &self.drain
    }

    /// The request-time decision path: risk guard, channel selection
    /// with session affinity, channel audit, then pre-consume
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<Dispatch, RuntimeError> {
        if self.ip_guard.observe(&request.caller, &request.client_ip).await? {
            return Err(RuntimeError::Banned);
        }

        let session_id = extract_session_id(&request.body);
        let selection = self
            .selector
            .pick(&PickRequest {
                group: &request.group,
                model: &request.upstream_model,
                retry: request.retry,
                session_id: &session_id,
                usable_groups: &request.usable_groups,
                username: &request.caller.username,
                token_name: &request.token.token_name,
            })
            .await?;
        let channel = selection.channel.clone();

        let settings = &channel.settings;
        let audit = ChannelAudit::compile(
            settings.header_audit.enabled,
            &settings.header_audit.rules,
            settings.content_audit.enabled,
            &settings.content_audit.keywords,
        )?;
        if !audit.is_empty() {
            let content = meridian_guard::request_text(&request.body);
            audit.check(&request.headers, &content)?;
        }

        let mut ctx = RelayContext::new(
            request.caller,
            request.token,
            selection.group,
            request.origin_model,
            request.upstream_model,
            request.price,
            civil::unix_now(),
        );
        ctx.channel_id = channel.id;
        ctx.session_id = session_id;
        ctx.is_stream = request.is_stream;
        ctx.client_ip = request.client_ip;
        ctx.flags.sticky_bound = selection.sticky_bound;
        ctx.flags.free_cache_creation = selection.free_cache_prev_channel.is_some();
        ctx.flags.free_cache_prev_channel = selection.free_cache_prev_channel;

        self.ledger.pre_consume(&mut ctx, request.estimate).await?;

        Ok(Dispatch { channel, ctx })
    }

    /// Post-upstream reconciliation; returns the final settled quota
    pub async fn settle(&self, ctx: &RelayContext, usage: &Usage) -> Result<i64, RuntimeError> {
        let options = SettleOptions {
            cache_1h_as_5m: self
                .cache
                .channel(ctx.channel_id)
                .is_some_and(|c| c.settings.cache_1h_as_5m),
        };
        Ok(self.ledger.settle(ctx, usage, options).await?)
    }

    /// Failure path: refund the pre-consume to its source, exclude
    /// the channel on concurrency-window errors, and report the
    /// disable predicate to the caller's channel policy
    pub async fn upstream_failed(
        &self,
        ctx: &RelayContext,
        error: &UpstreamError,
    ) -> FailureDisposition {
        self.ledger.refund_pre_consumed(ctx).await;

        let mut disposition = FailureDisposition {
            channel_excluded: false,
            should_disable: should_disable_channel(error),
        };

        if is_session_concurrency_error(error)
            && let Some(channel) = self.cache.channel(ctx.channel_id)
            && channel.settings.concurrency_auto_exclude
        {
            let duration = channel.settings.exclusion_duration();
            match self.registry.mark_excluded(channel.id, duration).await {
                Ok(()) => {
                    disposition.channel_excluded = true;
                    tracing::info!(
                        channel_id = channel.id,
                        minutes = duration.as_secs() / 60,
                        "channel excluded after session-concurrency error"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, channel_id = channel.id, "failed to exclude channel");
                }
            }
        }
        disposition
    }
}
