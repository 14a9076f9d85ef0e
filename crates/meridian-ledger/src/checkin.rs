use std::sync::Arc;
use std::time::Duration;

use meridian_core::civil;
use meridian_kv::{KeyTtl, Kv, KvError};

use crate::LedgerError;

const QUOTA_PREFIX: &str = "checkin:quota:";
const RECORD_PREFIX: &str = "checkin:record:";

/// Daily check-in state for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckinStatus {
    pub claimed_today: bool,
    pub remaining: i64,
    pub total: i64,
    /// Until the pool resets at local midnight
    pub expires_in: Duration,
}

/// The free-tier check-in pool
///
/// One claim per civil day grants a fixed quantity; the pool and its
/// claim record both expire at local midnight. Funds here are fully
/// isolated from paid and subscription money: free-tier requests
/// debit and refund only this pool.
pub struct CheckinPool {
    kv: Arc<dyn Kv>,
}

fn quota_key(user_id: i64) -> String {
    format!("{QUOTA_PREFIX}{user_id}:{}", civil::day_key(civil::now()))
}

fn record_key(user_id: i64) -> String {
    format!("{RECORD_PREFIX}{user_id}:{}", civil::day_key(civil::now()))
}

impl CheckinPool {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Claim today's grant; at most once per civil day
    pub async fn claim(&self, user_id: i64, grant: i64) -> Result<CheckinStatus, LedgerError> {
        let ttl = civil::until_midnight(civil::now());
        let claimed = self
            .kv
            .set_nx(&record_key(user_id), &grant.to_string(), ttl)
            .await?;
        if !claimed {
            return Err(LedgerError::AlreadyCheckedIn);
        }
        self.kv
            .set(&quota_key(user_id), &grant.to_string(), ttl)
            .await?;
        tracing::info!(user_id, grant, "daily check-in claimed");
        Ok(CheckinStatus {
            claimed_today: true,
            remaining: grant,
            total: grant,
            expires_in: ttl,
        })
    }

    pub async fn remaining(&self, user_id: i64) -> Result<i64, KvError> {
        match self.kv.get(&quota_key(user_id)).await? {
            Some(raw) => raw
                .parse()
                .map_err(|e| KvError::Decode(format!("check-in pool: {e}"))),
            None => Ok(0),
        }
    }

    /// Debit up to `amount`; returns what was actually taken
    pub async fn consume(&self, user_id: i64, amount: i64) -> Result<i64, KvError> {
        if amount <= 0 {
            return Ok(0);
        }
        self.kv.take_up_to(&quota_key(user_id), amount).await
    }

    /// Credit back a failed or over-estimated debit
    ///
    /// A pool that already expired at midnight absorbs nothing; the
    /// refund is dropped rather than resurrecting yesterday's pool.
    pub async fn refund(&self, user_id: i64, amount: i64) -> Result<(), KvError> {
        if amount <= 0 {
            return Ok(());
        }
        match self.kv.incr_by_if_live(&quota_key(user_id), amount).await {
            Ok(_) => Ok(()),
            Err(KvError::KeyNotInitialized { .. }) => {
                tracing::debug!(user_id, amount, "check-in pool expired, refund dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn status(&self, user_id: i64) -> Result<CheckinStatus, KvError> {
        let claimed_today = self.kv.exists(&record_key(user_id)).await?;
        let remaining = self.remaining(user_id).await?;
        let total = match self.kv.get(&record_key(user_id)).await? {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        let expires_in = match self.kv.ttl(&quota_key(user_id)).await? {
            KeyTtl::Expires(ttl) => ttl,
            _ => Duration::ZERO,
        };
        Ok(CheckinStatus {
            claimed_today,
            remaining,
            total,
            expires_in,
        })
    }
}
