#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

//! Batch-update drain
//!
//! The hot path produces many small counter updates (used quota,
//! request counts, refund credits). Applying each directly would
//! stampede the durable store, so deltas are coalesced per
//! `(kind, entity)` in a KV hash and flushed on a timer. The KV buffer
//! survives process restarts; without a KV the drain degrades to
//! in-process maps and warns that a crash drops whatever is buffered.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_kv::Kv;
use meridian_store::Store;
use tokio_util::sync::CancellationToken;

/// The closed set of coalesced update kinds
///
/// Each kind has its own reducer over the store; all reducers are
/// additive, so re-applying a flushed batch can only over-count, never
/// corrupt, and deltas of either sign compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    /// Credit back to a user's paid balance
    UserQuota,
    /// Credit back to a token's remaining quota
    TokenQuota,
    /// Lifetime used-quota accumulator per user
    UsedQuota,
    /// Used-quota accumulator per channel
    ChannelUsedQuota,
    /// Request-count accumulator per user
    RequestCount,
}

impl UpdateKind {
    pub const ALL: [Self; 5] = [
        Self::UserQuota,
        Self::TokenQuota,
        Self::UsedQuota,
        Self::ChannelUsedQuota,
        Self::RequestCount,
    ];

    /// KV hash key holding this kind's pending deltas
    fn buffer_key(self) -> &'static str {
        match self {
            Self::UserQuota => "batch_update:user_quota",
            Self::TokenQuota => "batch_update:token_quota",
            Self::UsedQuota => "batch_update:used_quota",
            Self::ChannelUsedQuota => "batch_update:channel_used_quota",
            Self::RequestCount => "batch_update:request_count",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::UserQuota => 0,
            Self::TokenQuota => 1,
            Self::UsedQuota => 2,
            Self::ChannelUsedQuota => 3,
            Self::RequestCount => 4,
        }
    }
}

/// Coalescing drain over the durable store
pub struct Drain {
    kv: Option<Arc<dyn Kv>>,
    store: Arc<dyn Store>,
    /// In-process buffers; the fallback when no KV is configured or a
    /// KV write fails mid-flight
    fallback: [Mutex<HashMap<i64, i64>>; 5],
    interval: Duration,
    started: AtomicBool,
}

impl Drain {
    pub fn new(kv: Option<Arc<dyn Kv>>, store: Arc<dyn Store>, interval: Duration) -> Self {
        if kv.is_some() {
            tracing::info!("batch drain buffering in kv, deltas survive restarts");
        } else {
            tracing::warn!("batch drain buffering in memory only, a restart drops pending deltas");
        }
        Self {
            kv,
            store,
            fallback: std::array::from_fn(|_| Mutex::new(HashMap::new())),
            interval,
            started: AtomicBool::new(false),
        }
    }

    /// Enqueue one delta; never blocks on the store
    pub async fn record(&self, kind: UpdateKind, entity_id: i64, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Some(kv) = &self.kv {
            match kv.hincr_by(kind.buffer_key(), &entity_id.to_string(), delta).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(error = %e, ?kind, "kv buffer write failed, falling back to memory");
                }
            }
        }
        self.record_in_memory(kind, entity_id, delta);
    }

    fn record_in_memory(&self, kind: UpdateKind, entity_id: i64, delta: i64) {
        let mut buffer = self.fallback[kind.index()]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *buffer.entry(entity_id).or_insert(0) += delta;
    }

    /// Spawn the periodic flush task; re-entry is a no-op
    ///
    /// On cancellation the task performs one final flush so shutdown
    /// drains everything.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let drain = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(drain.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        drain.flush().await;
                        tracing::debug!("batch drain stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        drain.flush().await;
                    }
                }
            }
        });
    }

    /// Apply all pending deltas to the store
    ///
    /// The KV buffer is taken with an atomic get-and-clear, so a crash
    /// after the take loses at most what was already being applied;
    /// reducers being additive makes a replayed batch safe.
    pub async fn flush(&self) {
        for kind in UpdateKind::ALL {
            let mut pending: HashMap<i64, i64> = std::mem::take(
                &mut *self.fallback[kind.index()]
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
            );

            if let Some(kv) = &self.kv {
                match kv.hgetall_and_del(kind.buffer_key()).await {
                    Ok(entries) => {
                        for (field, value) in entries {
                            match (field.parse::<i64>(), value.parse::<i64>()) {
                                (Ok(id), Ok(delta)) => *pending.entry(id).or_insert(0) += delta,
                                _ => {
                                    tracing::warn!(%field, %value, ?kind, "unparsable buffer entry dropped");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, ?kind, "failed to take kv buffer, flushing memory only");
                    }
                }
            }

            if pending.is_empty() {
                continue;
            }
            tracing::debug!(?kind, entries = pending.len(), "flushing batch updates");
            for (entity_id, delta) in pending {
                if delta == 0 {
                    continue;
                }
                if let Err(e) = self.apply(kind, entity_id, delta).await {
                    tracing::error!(error = %e, ?kind, entity_id, delta, "batch update failed");
                }
            }
        }
    }

    async fn apply(&self, kind: UpdateKind, entity_id: i64, delta: i64) -> Result<(), meridian_store::StoreError> {
        match kind {
            UpdateKind::UserQuota => self.store.increase_user_quota(entity_id, delta).await,
            UpdateKind::TokenQuota => self.store.increase_token_quota(entity_id, delta).await,
            UpdateKind::UsedQuota => self.store.add_user_used_quota(entity_id, delta).await,
            UpdateKind::ChannelUsedQuota => self.store.add_channel_used_quota(entity_id, delta).await,
            UpdateKind::RequestCount => self.store.add_user_request_count(entity_id, delta).await,
        }
    }

    /// Pending entry count for one kind, across both buffers
    pub async fn pending(&self, kind: UpdateKind) -> usize {
        let memory = self.fallback[kind.index()]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        let buffered = match &self.kv {
            Some(kv) => kv.hlen(kind.buffer_key()).await.unwrap_or(0),
            None => 0,
        };
        memory + buffered
    }
}
