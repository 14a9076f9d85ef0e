use std::sync::Arc;
use std::time::Duration;

use meridian_core::civil;
use meridian_kv::{KeyTtl, Kv};
use serde::{Deserialize, Serialize};

use crate::SessionError;

const BINDING_PREFIX: &str = "sticky_session:";
const CHANNEL_INDEX_PREFIX: &str = "sticky_sessions_by_channel:";
const DAILY_BINDS_PREFIX: &str = "sticky_daily_binds:";
const EXCLUDED_PREFIX: &str = "channel_session_excluded:";

/// A session→channel binding as stored in the KV
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub channel_id: i64,
    pub group: String,
    pub model: String,
    pub created_at: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub token_name: String,
}

/// Sticky settings of the channel a bind targets
#[derive(Debug, Clone, Copy)]
pub struct BindPolicy {
    /// Binding lifetime
    pub ttl: Duration,
    /// Live sessions per channel; 0 = unlimited
    pub max_count: u32,
    /// New bindings per channel per civil day; 0 = unlimited
    pub daily_bind_limit: u32,
}

/// One live session on a channel, for the admin listing
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDetail {
    pub session_hash: String,
    pub group: String,
    pub model: String,
    pub created_at: i64,
    pub remaining_ttl: Duration,
    pub username: String,
    pub token_name: String,
}

/// Outcome of a bind attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// A new binding was created
    Bound,
    /// An existing binding was refreshed
    Renewed,
    /// The channel's daily bind quota is exhausted; caller proceeds
    /// without stickiness
    DailyLimitReached,
    /// The channel is at its live-session cap; caller proceeds
    /// without stickiness
    CapacityReached,
}

/// Session→channel binding registry
///
/// Keys:
/// - `sticky_session:{group}:{model}:{hash}` → binding JSON, TTL-bound
/// - `sticky_sessions_by_channel:{id}` → index of `group:model:hash`
///   members scored by creation time
/// - `sticky_daily_binds:{id}:{date}` → new-bind counter, expires at
///   local midnight
/// - `channel_session_excluded:{id}` → temporary exclusion flag
///
/// Index members whose binding has expired are reconciled away on
/// `count`/`sessions` reads rather than by a sweeper.
pub struct StickyRegistry {
    kv: Arc<dyn Kv>,
}

fn binding_key(group: &str, model: &str, session_hash: &str) -> String {
    format!("{BINDING_PREFIX}{group}:{model}:{session_hash}")
}

fn index_key(channel_id: i64) -> String {
    format!("{CHANNEL_INDEX_PREFIX}{channel_id}")
}

fn index_member(group: &str, model: &str, session_hash: &str) -> String {
    format!("{group}:{model}:{session_hash}")
}

fn excluded_key(channel_id: i64) -> String {
    format!("{EXCLUDED_PREFIX}{channel_id}")
}

/// `group:model:hash` split back into its parts; model names may not
/// contain `:` but session hashes may (defensively take the tail)
fn split_member(member: &str) -> Option<(String, String, String)> {
    let mut parts = member.splitn(3, ':');
    Some((
        parts.next()?.to_owned(),
        parts.next()?.to_owned(),
        parts.next()?.to_owned(),
    ))
}

impl StickyRegistry {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// The channel a session is bound to, if any
    ///
    /// Validity of the channel itself (status, group/model support,
    /// sticky still enabled) is the selector's concern; stale bindings
    /// are removed there via [`Self::unbind`].
    pub async fn lookup(
        &self,
        group: &str,
        model: &str,
        session_hash: &str,
    ) -> Result<Option<SessionBinding>, SessionError> {
        let Some(raw) = self.kv.get(&binding_key(group, model, session_hash)).await? else {
            return Ok(None);
        };
        let binding = serde_json::from_str(&raw)
            .map_err(|e| SessionError::Decode(format!("binding for {session_hash}: {e}")))?;
        Ok(Some(binding))
    }

    /// Create or refresh a binding
    ///
    /// Fast path: the binding exists on the same channel with user
    /// info present, so a single TTL refresh and nothing else. A changed channel
    /// or missing user info rewrites the record preserving
    /// `created_at`. Only a genuinely new binding touches the index
    /// and the daily counter.
    pub async fn bind(
        &self,
        group: &str,
        model: &str,
        session_hash: &str,
        channel_id: i64,
        policy: BindPolicy,
        username: &str,
        token_name: &str,
    ) -> Result<BindOutcome, SessionError> {
        let key = binding_key(group, model, session_hash);

        if let Some(existing) = self.lookup(group, model, session_hash).await? {
            if existing.channel_id == channel_id && !existing.username.is_empty() {
                self.kv.expire(&key, policy.ttl).await?;
                return Ok(BindOutcome::Renewed);
            }
            // rewrite in place; the index entry for the old channel is
            // reconciled away on the next count
            let updated = SessionBinding {
                channel_id,
                group: group.to_owned(),
                model: model.to_owned(),
                created_at: existing.created_at,
                username: username.to_owned(),
                token_name: token_name.to_owned(),
            };
            let raw = serde_json::to_string(&updated)
                .map_err(|e| SessionError::Decode(e.to_string()))?;
            if existing.channel_id == channel_id {
                self.kv.set(&key, &raw, policy.ttl).await?;
            } else {
                self.kv
                    .set_with_zadd(
                        &key,
                        &raw,
                        policy.ttl,
                        &index_key(channel_id),
                        &index_member(group, model, session_hash),
                        updated.created_at as f64,
                    )
                    .await?;
            }
            return Ok(BindOutcome::Renewed);
        }

        if policy.max_count > 0 {
            let live = self.count(channel_id).await?;
            if live >= policy.max_count as usize {
                tracing::debug!(channel_id, live, "session capacity reached");
                return Ok(BindOutcome::CapacityReached);
            }
        }

        if policy.daily_bind_limit > 0 {
            let binds_today = self.daily_bind_count(channel_id).await?;
            if binds_today >= i64::from(policy.daily_bind_limit) {
                tracing::debug!(channel_id, binds_today, "daily bind quota reached");
                return Ok(BindOutcome::DailyLimitReached);
            }
        }

        let now = civil::unix_now();
        let binding = SessionBinding {
            channel_id,
            group: group.to_owned(),
            model: model.to_owned(),
            created_at: now,
            username: username.to_owned(),
            token_name: token_name.to_owned(),
        };
        let raw = serde_json::to_string(&binding).map_err(|e| SessionError::Decode(e.to_string()))?;
        self.kv
            .set_with_zadd(
                &key,
                &raw,
                policy.ttl,
                &index_key(channel_id),
                &index_member(group, model, session_hash),
                now as f64,
            )
            .await?;
        self.bump_daily_binds(channel_id).await?;
        Ok(BindOutcome::Bound)
    }

    /// Remove a binding and its index member
    pub async fn unbind(
        &self,
        group: &str,
        model: &str,
        session_hash: &str,
        channel_id: i64,
    ) -> Result<(), SessionError> {
        self.kv
            .del_with_zrem(
                &binding_key(group, model, session_hash),
                &index_key(channel_id),
                &index_member(group, model, session_hash),
            )
            .await?;
        Ok(())
    }

    /// Extend the binding TTL when less than half of it remains
    ///
    /// Bounds write amplification: a chatty session refreshes at most
    /// twice per TTL window instead of on every request.
    pub async fn renew_ttl(
        &self,
        group: &str,
        model: &str,
        session_hash: &str,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let key = binding_key(group, model, session_hash);
        if let KeyTtl::Expires(remaining) = self.kv.ttl(&key).await?
            && remaining < ttl / 2
        {
            self.kv.expire(&key, ttl).await?;
        }
        Ok(())
    }

    /// Live session count for a channel, after reconciling expired
    /// index members
    pub async fn count(&self, channel_id: i64) -> Result<usize, SessionError> {
        self.reconcile(channel_id).await?;
        Ok(self.kv.zcard(&index_key(channel_id)).await?)
    }

    /// Live sessions on a channel with per-session detail
    pub async fn sessions(&self, channel_id: i64) -> Result<Vec<SessionDetail>, SessionError> {
        let members = self.kv.zrange_with_scores(&index_key(channel_id)).await?;
        let mut details = Vec::with_capacity(members.len());
        let mut expired = Vec::new();

        for (member, score) in members {
            let Some((group, model, session_hash)) = split_member(&member) else {
                expired.push(member);
                continue;
            };
            let key = binding_key(&group, &model, &session_hash);
            let KeyTtl::Expires(remaining) = self.kv.ttl(&key).await? else {
                expired.push(member);
                continue;
            };
            let (username, token_name) = match self.lookup(&group, &model, &session_hash).await {
                Ok(Some(binding)) => (binding.username, binding.token_name),
                _ => (String::new(), String::new()),
            };
            details.push(SessionDetail {
                session_hash,
                group,
                model,
                created_at: score as i64,
                remaining_ttl: remaining,
                username,
                token_name,
            });
        }

        if !expired.is_empty() {
            self.kv.zrem(&index_key(channel_id), &expired).await?;
        }
        Ok(details)
    }

    /// Release one session on a channel by its hash
    pub async fn release_one(&self, channel_id: i64, session_hash: &str) -> Result<bool, SessionError> {
        let members = self.kv.zrange_with_scores(&index_key(channel_id)).await?;
        for (member, _) in members {
            if let Some((group, model, hash)) = split_member(&member)
                && hash == session_hash
            {
                self.unbind(&group, &model, &hash, channel_id).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Release every session bound to a channel
    pub async fn release_all(&self, channel_id: i64) -> Result<usize, SessionError> {
        let members = self.kv.zrange_with_scores(&index_key(channel_id)).await?;
        let released = members.len();
        for (member, _) in &members {
            if let Some((group, model, hash)) = split_member(member) {
                self.kv.del(&binding_key(&group, &model, &hash)).await?;
            }
        }
        self.kv.del(&index_key(channel_id)).await?;
        Ok(released)
    }

    /// Temporarily exclude a channel from selection
    pub async fn mark_excluded(&self, channel_id: i64, duration: Duration) -> Result<(), SessionError> {
        self.kv.set(&excluded_key(channel_id), "1", duration).await?;
        Ok(())
    }

    pub async fn is_excluded(&self, channel_id: i64) -> Result<bool, SessionError> {
        Ok(self.kv.exists(&excluded_key(channel_id)).await?)
    }

    async fn daily_bind_count(&self, channel_id: i64) -> Result<i64, SessionError> {
        let key = self.daily_binds_key(channel_id);
        match self.kv.get(&key).await? {
            Some(raw) => raw
                .parse()
                .map_err(|e| SessionError::Decode(format!("daily bind counter {key}: {e}"))),
            None => Ok(0),
        }
    }

    async fn bump_daily_binds(&self, channel_id: i64) -> Result<(), SessionError> {
        let key = self.daily_binds_key(channel_id);
        let count = self.kv.incr_by(&key, 1).await?;
        if count == 1 {
            self.kv.expire(&key, civil::until_midnight(civil::now())).await?;
        }
        Ok(())
    }

    fn daily_binds_key(&self, channel_id: i64) -> String {
        format!("{DAILY_BINDS_PREFIX}{channel_id}:{}", civil::day_key(civil::now()))
    }

    /// Drop index members whose binding key has expired
    async fn reconcile(&self, channel_id: i64) -> Result<(), SessionError> {
        let members = self.kv.zrange_with_scores(&index_key(channel_id)).await?;
        let mut expired = Vec::new();
        for (member, _) in members {
            match split_member(&member) {
                Some((group, model, hash)) => {
                    if !self.kv.exists(&binding_key(&group, &model, &hash)).await? {
                        expired.push(member);
                    }
                }
                None => expired.push(member),
            }
        }
        if !expired.is_empty() {
            self.kv.zrem(&index_key(channel_id), &expired).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_kv::MemoryKv;

    fn registry() -> StickyRegistry {
        StickyRegistry::new(Arc::new(MemoryKv::new()))
    }

    fn policy(ttl_secs: u64) -> BindPolicy {
        BindPolicy {
            ttl: Duration::from_secs(ttl_secs),
            max_count: 0,
            daily_bind_limit: 0,
        }
    }

    #[tokio::test]
    async fn bind_then_lookup_roundtrip() {
        let registry = registry();
        let outcome = registry
            .bind("std", "m", "s1", 42, policy(3600), "alice", "cli")
            .await
            .unwrap();
        assert_eq!(outcome, BindOutcome::Bound);

        let binding = registry.lookup("std", "m", "s1").await.unwrap().unwrap();
        assert_eq!(binding.channel_id, 42);
        assert_eq!(binding.username, "alice");
        assert_eq!(registry.count(42).await.unwrap(), 1);

        registry.unbind("std", "m", "s1", 42).await.unwrap();
        assert!(registry.lookup("std", "m", "s1").await.unwrap().is_none());
        assert_eq!(registry.count(42).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rebind_same_channel_renews_and_preserves_created_at() {
        let registry = registry();
        registry
            .bind("std", "m", "s1", 42, policy(3600), "alice", "cli")
            .await
            .unwrap();
        let first = registry.lookup("std", "m", "s1").await.unwrap().unwrap();

        let outcome = registry
            .bind("std", "m", "s1", 42, policy(3600), "alice", "cli")
            .await
            .unwrap();
        assert_eq!(outcome, BindOutcome::Renewed);

        let second = registry.lookup("std", "m", "s1").await.unwrap().unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(registry.count(42).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rebind_to_new_channel_moves_the_index_entry() {
        let registry = registry();
        registry
            .bind("std", "m", "s1", 42, policy(3600), "alice", "cli")
            .await
            .unwrap();
        registry
            .bind("std", "m", "s1", 43, policy(3600), "alice", "cli")
            .await
            .unwrap();

        let binding = registry.lookup("std", "m", "s1").await.unwrap().unwrap();
        assert_eq!(binding.channel_id, 43);
        assert_eq!(registry.count(43).await.unwrap(), 1);
        // stale member on the old channel reconciled away on count:
        // the binding key now points at 43, but the key still exists,
        // so the old index entry survives until the binding expires
        // or is released; release everything and verify cleanup
        registry.release_all(42).await.unwrap();
        assert_eq!(registry.count(42).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_bindings_are_reconciled_out_of_the_index()
    {
        let registry = registry();
        registry
            .bind("std", "m", "s1", 42, policy(60), "alice", "cli")
            .await
            .unwrap();
        registry
            .bind("std", "m", "s2", 42, policy(3600), "bob", "cli")
            .await
            .unwrap();
        assert_eq!(registry.count(42).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.count(42).await.unwrap(), 1);

        let sessions = registry.sessions(42).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_hash, "s2");
        assert_eq!(sessions[0].username, "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn renew_ttl_only_below_half() {
        let registry = registry();
        let kv_ttl = Duration::from_secs(1000);
        registry
            .bind("std", "m", "s1", 42, policy(1000), "alice", "cli")
            .await
            .unwrap();

        // above half: no-op
        tokio::time::advance(Duration::from_secs(100)).await;
        registry.renew_ttl("std", "m", "s1", kv_ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(850)).await;
        // would have expired at 1100 if the renewal above had applied
        assert!(registry.lookup("std", "m", "s1").await.unwrap().is_some());

        // now below half: renewed to the full TTL
        registry.renew_ttl("std", "m", "s1", kv_ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(900)).await;
        assert!(registry.lookup("std", "m", "s1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_cap_refuses_new_sessions_until_one_expires() {
        let registry = registry();
        let capped = BindPolicy {
            ttl: Duration::from_secs(600),
            max_count: 1,
            daily_bind_limit: 0,
        };
        assert_eq!(
            registry.bind("std", "m", "s1", 42, capped, "a", "t").await.unwrap(),
            BindOutcome::Bound
        );
        assert_eq!(
            registry.bind("std", "m", "s2", 42, capped, "a", "t").await.unwrap(),
            BindOutcome::CapacityReached
        );
        // renewing the existing session is not a new binding
        assert_eq!(
            registry.bind("std", "m", "s1", 42, capped, "a", "t").await.unwrap(),
            BindOutcome::Renewed
        );

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(
            registry.bind("std", "m", "s2", 42, capped, "a", "t").await.unwrap(),
            BindOutcome::Bound
        );
    }

    #[tokio::test]
    async fn daily_bind_limit_refuses_new_sessions() {
        let registry = registry();
        let limited = BindPolicy {
            ttl: Duration::from_secs(3600),
            max_count: 0,
            daily_bind_limit: 2,
        };
        assert_eq!(
            registry.bind("std", "m", "s1", 42, limited, "a", "t").await.unwrap(),
            BindOutcome::Bound
        );
        assert_eq!(
            registry.bind("std", "m", "s2", 42, limited, "a", "t").await.unwrap(),
            BindOutcome::Bound
        );
        assert_eq!(
            registry.bind("std", "m", "s3", 42, limited, "a", "t").await.unwrap(),
            BindOutcome::DailyLimitReached
        );
        // renewals are not new binds and stay allowed
        assert_eq!(
            registry.bind("std", "m", "s1", 42, limited, "a", "t").await.unwrap(),
            BindOutcome::Renewed
        );
    }

    #[tokio::test]
    async fn release_one_targets_a_single_hash() {
        let registry = registry();
        registry.bind("std", "m", "s1", 42, policy(3600), "a", "t").await.unwrap();
        registry.bind("std", "m", "s2", 42, policy(3600), "a", "t").await.unwrap();

        assert!(registry.release_one(42, "s1").await.unwrap());
        assert!(!registry.release_one(42, "missing").await.unwrap());
        assert_eq!(registry.count(42).await.unwrap(), 1);
        assert!(registry.lookup("std", "m", "s2").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn exclusion_expires_on_its_own() {
        let registry = registry();
        registry.mark_excluded(7, Duration::from_secs(120)).await.unwrap();
        assert!(registry.is_excluded(7).await.unwrap());

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(!registry.is_excluded(7).await.unwrap());
    }
}
