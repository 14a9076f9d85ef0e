use serde::{Deserialize, Serialize};

use crate::{Caller, PriceData, TokenInfo};

/// Where the money for a request comes from
///
/// Recorded at pre-consume time and read back at settle time. Settle
/// must never infer the source from current state: refunds and top-ups
/// go to the source stored here, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingSource {
    /// Daily check-in pool, usable only by the free-tier group
    Checkin,
    /// Active subscription envelopes (daily/weekly/total counters)
    Subscription,
    /// The user's paid balance
    Balance,
}

/// Decision flags handed back to the relay with the chosen channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchFlags {
    /// A sticky-session binding was created or renewed
    pub sticky_bound: bool,
    /// Cache-creation tokens on this request will not be billed
    pub free_cache_creation: bool,
    /// The channel the session was on before the switch, when
    /// `free_cache_creation` is set
    pub free_cache_prev_channel: Option<i64>,
    /// The request runs under the caller's exclusive group
    pub exclusive_used: bool,
    /// Pre-consume debited the subscription envelopes
    pub subscription_pre_consumed: bool,
    /// Amount actually taken from the check-in pool at pre-consume
    pub checkin_consumed: i64,
}

/// Per-request accounting context
///
/// Created by the runtime at dispatch, mutated by the ledger at
/// pre-consume, and consumed at settle or refund. Carries everything
/// the ledger needs so that no request-scoped state lives in globals.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub caller: Caller,
    pub token: TokenInfo,
    /// Group the request is running under (may differ from the
    /// caller's own group, e.g. "auto" resolution or exclusive groups)
    pub group: String,
    /// Model name as the client sent it
    pub origin_model: String,
    /// Model name sent upstream
    pub upstream_model: String,
    pub price: PriceData,
    /// Channel chosen by the selector
    pub channel_id: i64,
    /// Session fingerprint, empty when none could be derived
    pub session_id: String,
    /// Whether the response is streamed (log metadata only)
    pub is_stream: bool,
    /// Client IP as observed by the relay; consumed by the risk guard
    /// and the consume log
    pub client_ip: String,
    /// Request start, unix seconds, for duration accounting
    pub started_at: i64,

    /// Amount actually pre-consumed (0 under trust-skip)
    pub final_pre_consumed: i64,
    /// Funding source chosen at pre-consume; `None` until then
    pub source: Option<FundingSource>,
    /// User balance observed at pre-consume, for shortfall logging
    pub user_quota: i64,
    pub flags: DispatchFlags,
}

impl RelayContext {
    /// Context for a freshly dispatched request; accounting fields
    /// start zeroed and are filled in by pre-consume.
    pub fn new(
        caller: Caller,
        token: TokenInfo,
        group: impl Into<String>,
        origin_model: impl Into<String>,
        upstream_model: impl Into<String>,
        price: PriceData,
        started_at: i64,
    ) -> Self {
        Self {
            caller,
            token,
            group: group.into(),
            origin_model: origin_model.into(),
            upstream_model: upstream_model.into(),
            price,
            channel_id: 0,
            session_id: String::new(),
            is_stream: false,
            client_ip: String::new(),
            started_at,
            final_pre_consumed: 0,
            source: None,
            user_quota: 0,
            flags: DispatchFlags::default(),
        }
    }
}
