use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use crate::{KeyTtl, Kv, KvError, WindowConsume, WindowOutcome};

/// Limit check + increment across three window counters. Limits are
/// enforced before any counter moves; EXPIRE is applied only to keys
/// this call created (TTL == -1 right after INCRBY).
static WINDOW_CONSUME: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local amount = tonumber(ARGV[1])
        local limits = {tonumber(ARGV[2]), tonumber(ARGV[3]), tonumber(ARGV[4])}
        local ttls = {tonumber(ARGV[5]), tonumber(ARGV[6]), tonumber(ARGV[7])}

        for i = 1, 3 do
            local used = tonumber(redis.call('GET', KEYS[i]) or '0')
            if limits[i] > 0 and used + amount > limits[i] then
                return {0, i, used, limits[i]}
            end
        end

        local totals = {}
        for i = 1, 3 do
            totals[i] = redis.call('INCRBY', KEYS[i], amount)
            if redis.call('TTL', KEYS[i]) == -1 then
                redis.call('EXPIRE', KEYS[i], ttls[i])
            end
        end
        return {1, totals[1], totals[2], totals[3]}
        ",
    )
});

/// Floor-at-zero decrement preserving TTL. Windows that already
/// expired are left alone so a refund can never resurrect a counter
/// into the next period.
static WINDOW_REFUND: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local amount = tonumber(ARGV[1])
        for i = 1, 3 do
            if redis.call('TTL', KEYS[i]) > 0 then
                local used = tonumber(redis.call('GET', KEYS[i]) or '0')
                local remaining = used - amount
                if remaining < 0 then remaining = 0 end
                redis.call('SET', KEYS[i], remaining, 'KEEPTTL')
            end
        end
        return 1
        ",
    )
});

static INCR_IF_LIVE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        if redis.call('TTL', KEYS[1]) <= 0 then
            return false
        end
        return redis.call('INCRBY', KEYS[1], ARGV[1])
        ",
    )
});

static TAKE_UP_TO: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        if redis.call('TTL', KEYS[1]) <= 0 then
            return 0
        end
        local current = tonumber(redis.call('GET', KEYS[1]) or '0')
        if current <= 0 then
            return 0
        end
        local take = tonumber(ARGV[1])
        if take > current then take = current end
        redis.call('DECRBY', KEYS[1], take)
        return take
        ",
    )
});

/// Redis-backed [`Kv`]
#[derive(Clone)]
pub struct RedisKv {
    client: redis::Client,
}

impl RedisKv {
    /// Create a client for the given connection URL
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid
    pub fn new(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)
            .map_err(|e| KvError::Backend(format!("failed to open redis client: {e}")))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, KvError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| KvError::Backend(format!("failed to get connection: {e}")))
    }
}

fn backend(op: &str) -> impl FnOnce(redis::RedisError) -> KvError + '_ {
    move |e| KvError::Backend(format!("{op} failed: {e}"))
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(backend("GET"))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        conn.set_ex(key, value, ttl_secs(ttl)).await.map_err(backend("SETEX"))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend("SET NX"))?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        conn.del(key).await.map_err(backend("DEL"))
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        conn.exists(key).await.map_err(backend("EXISTS"))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
        let mut conn = self.conn().await?;
        let secs: i64 = conn.ttl(key).await.map_err(backend("TTL"))?;
        Ok(match secs {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            s => KeyTtl::Expires(Duration::from_secs(s.max(0) as u64)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        conn.expire(key, ttl_secs(ttl) as i64).await.map_err(backend("EXPIRE"))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let mut conn = self.conn().await?;
        conn.incr(key, delta).await.map_err(backend("INCRBY"))
    }

    async fn incr_by_if_live(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let mut conn = self.conn().await?;
        let result: Option<i64> = INCR_IF_LIVE
            .key(key)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(backend("INCRBY (live)"))?;
        result.ok_or_else(|| KvError::KeyNotInitialized { key: key.to_owned() })
    }

    async fn take_up_to(&self, key: &str, amount: i64) -> Result<i64, KvError> {
        let mut conn = self.conn().await?;
        TAKE_UP_TO
            .key(key)
            .arg(amount)
            .invoke_async(&mut conn)
            .await
            .map_err(backend("DECRBY (floored)"))
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError> {
        let mut conn = self.conn().await?;
        conn.hincr(key, field, delta).await.map_err(backend("HINCRBY"))
    }

    async fn hlen(&self, key: &str) -> Result<usize, KvError> {
        let mut conn = self.conn().await?;
        conn.hlen(key).await.map_err(backend("HLEN"))
    }

    async fn hgetall_and_del(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut conn = self.conn().await?;
        let (entries, _deleted): (HashMap<String, String>, i64) = redis::pipe()
            .atomic()
            .hgetall(key)
            .del(key)
            .query_async(&mut conn)
            .await
            .map_err(backend("HGETALL+DEL"))?;
        Ok(entries)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        conn.zadd(key, member, score).await.map_err(backend("ZADD"))
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<(), KvError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        conn.zrem(key, members).await.map_err(backend("ZREM"))
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, KvError> {
        let mut conn = self.conn().await?;
        conn.zrange_withscores(key, 0, -1).await.map_err(backend("ZRANGE"))
    }

    async fn zcard(&self, key: &str) -> Result<usize, KvError> {
        let mut conn = self.conn().await?;
        conn.zcard(key).await.map_err(backend("ZCARD"))
    }

    async fn zrem_below(&self, key: &str, max_score: f64) -> Result<usize, KvError> {
        let mut conn = self.conn().await?;
        conn.zrembyscore(key, "-inf", format!("({max_score}"))
            .await
            .map_err(backend("ZREMRANGEBYSCORE"))
    }

    async fn set_with_zadd(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        index_key: &str,
        member: &str,
        score: f64,
    ) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: ((), i64) = redis::pipe()
            .atomic()
            .set_ex(key, value, ttl_secs(ttl))
            .zadd(index_key, member, score)
            .query_async(&mut conn)
            .await
            .map_err(backend("SETEX+ZADD"))?;
        Ok(())
    }

    async fn del_with_zrem(&self, key: &str, index_key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: (i64, i64) = redis::pipe()
            .atomic()
            .del(key)
            .zrem(index_key, member)
            .query_async(&mut conn)
            .await
            .map_err(backend("DEL+ZREM"))?;
        Ok(())
    }

    async fn window_consume(&self, op: &WindowConsume) -> Result<WindowOutcome, KvError> {
        let mut conn = self.conn().await?;
        let reply: Vec<i64> = WINDOW_CONSUME
            .key(op.keys[0].as_str())
            .key(op.keys[1].as_str())
            .key(op.keys[2].as_str())
            .arg(op.amount)
            .arg(op.limits[0])
            .arg(op.limits[1])
            .arg(op.limits[2])
            .arg(ttl_secs(op.ttls[0]))
            .arg(ttl_secs(op.ttls[1]))
            .arg(ttl_secs(op.ttls[2]))
            .invoke_async(&mut conn)
            .await
            .map_err(backend("window consume script"))?;

        match reply.as_slice() {
            [1, a, b, c] => Ok(WindowOutcome::Applied { totals: [*a, *b, *c] }),
            [0, index, used, limit] => Ok(WindowOutcome::Exceeded {
                index: (*index as usize).saturating_sub(1),
                used: *used,
                limit: *limit,
            }),
            other => Err(KvError::Decode(format!(
                "unexpected window consume reply: {other:?}"
            ))),
        }
    }

    async fn window_refund(&self, keys: &[String; 3], amount: i64) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: i64 = WINDOW_REFUND
            .key(keys[0].as_str())
            .key(keys[1].as_str())
            .key(keys[2].as_str())
            .arg(amount)
            .invoke_async(&mut conn)
            .await
            .map_err(backend("window refund script"))?;
        Ok(())
    }
}
