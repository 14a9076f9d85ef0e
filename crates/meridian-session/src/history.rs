use std::sync::Arc;
use std::time::Duration;

use meridian_core::civil;
use meridian_kv::Kv;
use serde::{Deserialize, Serialize};

use crate::SessionError;

const USAGE_PREFIX: &str = "session_channel_usage:";

/// History rows outlive the eligibility window by a margin
const HISTORY_TTL: Duration = Duration::from_secs(10 * 60);

/// A switch back to a higher-priority channel within this window is
/// treated as forced and its first cache write is not billed
const FREE_CACHE_WINDOW_SECS: i64 = 5 * 60;

/// Last channel a session ran on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSwitch {
    pub channel_id: i64,
    pub priority: i64,
    pub last_used_at: i64,
}

/// Per-session channel history used for free-cache-creation detection
///
/// Detects the pattern "the session was recently forced onto a
/// lower-priority channel and is now back on a higher-priority one":
/// the client will re-create its prompt cache on the new channel
/// through no fault of its own, so that write is forgiven.
pub struct SwitchHistory {
    kv: Arc<dyn Kv>,
}

fn usage_key(group: &str, model: &str, session_id: &str) -> String {
    format!("{USAGE_PREFIX}{group}:{model}:{session_id}")
}

impl SwitchHistory {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Record which channel served the session on this request
    pub async fn record(
        &self,
        group: &str,
        model: &str,
        session_id: &str,
        channel_id: i64,
        priority: i64,
    ) -> Result<(), SessionError> {
        let row = ChannelSwitch {
            channel_id,
            priority,
            last_used_at: civil::unix_now(),
        };
        let raw = serde_json::to_string(&row).map_err(|e| SessionError::Decode(e.to_string()))?;
        self.kv
            .set(&usage_key(group, model, session_id), &raw, HISTORY_TTL)
            .await?;
        Ok(())
    }

    /// Whether selecting `new_channel_id` at `new_priority` qualifies
    /// for free cache creation; returns the previous channel on a hit
    ///
    /// Eligible iff a history row exists, the channel differs, the new
    /// priority is strictly greater, and the previous use was within
    /// the five-minute window.
    pub async fn free_cache_eligible(
        &self,
        group: &str,
        model: &str,
        session_id: &str,
        new_channel_id: i64,
        new_priority: i64,
    ) -> Result<Option<i64>, SessionError> {
        let Some(raw) = self.kv.get(&usage_key(group, model, session_id)).await? else {
            return Ok(None);
        };
        let previous: ChannelSwitch =
            serde_json::from_str(&raw).map_err(|e| SessionError::Decode(e.to_string()))?;

        if previous.channel_id == new_channel_id {
            return Ok(None);
        }
        if new_priority <= previous.priority {
            return Ok(None);
        }
        if civil::unix_now() - previous.last_used_at > FREE_CACHE_WINDOW_SECS {
            return Ok(None);
        }
        Ok(Some(previous.channel_id))
    }
}
