use std::sync::Arc;
use std::time::Duration;

use meridian_core::{Caller, civil};
use meridian_kv::Kv;
use meridian_store::Store;

use crate::GuardError;

const IP_SET_PREFIX: &str = "risk_control:ips:";

/// IP-cardinality guard
///
/// Each user's recently seen IPs live in a KV sorted set scored by
/// their expiry deadline; pruning by score gives a rolling window
/// without per-member TTLs. The set is only a fast filter: before
/// banning, the count is confirmed against the durable consume log.
pub struct IpGuard {
    kv: Arc<dyn Kv>,
    store: Arc<dyn Store>,
    enabled: bool,
    window: Duration,
    threshold: u32,
}

fn ip_set_key(user_id: i64) -> String {
    format!("{IP_SET_PREFIX}{user_id}")
}

impl IpGuard {
    pub fn new(
        kv: Arc<dyn Kv>,
        store: Arc<dyn Store>,
        enabled: bool,
        window_minutes: u32,
        threshold: u32,
    ) -> Self {
        Self {
            kv,
            store,
            enabled,
            window: Duration::from_secs(u64::from(window_minutes) * 60),
            threshold,
        }
    }

    /// Record an observation and ban the user when the distinct-IP
    /// count over the window is confirmed above the threshold
    ///
    /// Returns whether the user was just banned. Admins and exempt
    /// users are never observed.
    pub async fn observe(&self, caller: &Caller, ip: &str) -> Result<bool, GuardError> {
        if !self.enabled || ip.is_empty() || caller.is_admin || caller.risk_exempt {
            return Ok(false);
        }

        let key = ip_set_key(caller.user_id);
        let now = civil::unix_now();
        let deadline = now + self.window.as_secs() as i64;

        self.kv.zadd(&key, ip, deadline as f64).await?;
        self.kv.expire(&key, self.window).await?;
        self.kv.zrem_below(&key, now as f64).await?;

        let fast_count = self.kv.zcard(&key).await?;
        if fast_count < self.threshold as usize {
            return Ok(false);
        }

        // the KV set can overcount (e.g. shared proxies rotating
        // through); the consume log is the authority
        let since = now - self.window.as_secs() as i64;
        let ips = self.store.distinct_ips_since(caller.user_id, since).await?;
        if ips.len() < self.threshold as usize {
            return Ok(false);
        }

        let reason = serde_json::json!({
            "banned_at": now,
            "ip_count": ips.len(),
            "time_window_min": self.window.as_secs() / 60,
            "ip_list": ips,
            "reason": format!(
                "{} distinct IPs within {} minutes exceeds the threshold of {}",
                ips.len(),
                self.window.as_secs() / 60,
                self.threshold
            ),
        });
        self.store.ban_user(caller.user_id, reason.to_string()).await?;
        self.kv.del(&key).await?;
        tracing::warn!(
            user_id = caller.user_id,
            ip_count = ips.len(),
            "user banned by ip-cardinality guard"
        );
        Ok(true)
    }
}
