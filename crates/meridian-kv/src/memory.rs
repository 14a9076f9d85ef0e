use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{KeyTtl, Kv, KvError, WindowConsume, WindowOutcome};

/// In-memory [`Kv`] for embedded deployments and tests
///
/// TTLs are tracked against the tokio clock, so paused-time tests can
/// advance through expiry deterministically. Every operation takes one
/// lock; that is the whole atomicity story, which matches what the
/// Redis implementation guarantees per command or script.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: Value,
    deadline: Option<Instant>,
}

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    // kept sorted by (score, member)
    Sorted(Vec<(String, f64)>),
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

type Guard<'a> = std::sync::MutexGuard<'a, HashMap<String, Entry>>;

fn lock(entries: &Mutex<HashMap<String, Entry>>) -> Guard<'_> {
    entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn purge(entries: &mut Guard<'_>, key: &str, now: Instant) {
    if entries.get(key).is_some_and(|e| e.expired(now)) {
        entries.remove(key);
    }
}

fn parse_counter(value: &Value, key: &str) -> Result<i64, KvError> {
    match value {
        Value::Str(s) => s
            .parse::<i64>()
            .map_err(|e| KvError::Decode(format!("counter {key} is not an integer: {e}"))),
        _ => Err(KvError::Decode(format!("counter {key} holds a non-string value"))),
    }
}

fn sorted_insert(members: &mut Vec<(String, f64)>, member: &str, score: f64) {
    members.retain(|(m, _)| m != member);
    let at = members
        .partition_point(|(m, s)| (*s, m.as_str()) < (score, member));
    members.insert(at, (member.to_owned(), score));
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        match entries.get(key) {
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(KvError::Decode(format!("{key} holds a non-string value"))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut entries = lock(&self.entries);
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Str(value.to_owned()),
                deadline: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Str(value.to_owned()),
                deadline: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        Ok(entries.contains_key(key))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        Ok(match entries.get(key) {
            None => KeyTtl::Missing,
            Some(Entry { deadline: None, .. }) => KeyTtl::Persistent,
            Some(Entry { deadline: Some(deadline), .. }) => {
                KeyTtl::Expires(deadline.saturating_duration_since(now))
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.deadline = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(entry) => {
                let next = parse_counter(&entry.value, key)? + delta;
                entry.value = Value::Str(next.to_string());
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_owned(),
                    Entry {
                        value: Value::Str(delta.to_string()),
                        deadline: None,
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn incr_by_if_live(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(entry) if entry.deadline.is_some() => {
                let next = parse_counter(&entry.value, key)? + delta;
                entry.value = Value::Str(next.to_string());
                Ok(next)
            }
            _ => Err(KvError::KeyNotInitialized { key: key.to_owned() }),
        }
    }

    async fn take_up_to(&self, key: &str, amount: i64) -> Result<i64, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        match entries.get_mut(key) {
            Some(entry) if entry.deadline.is_some() => {
                let current = parse_counter(&entry.value, key)?;
                if current <= 0 {
                    return Ok(0);
                }
                let take = amount.min(current);
                entry.value = Value::Str((current - take).to_string());
                Ok(take)
            }
            _ => Ok(0),
        }
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            deadline: None,
        });
        let Value::Hash(fields) = &mut entry.value else {
            return Err(KvError::Decode(format!("{key} holds a non-hash value")));
        };
        let slot = fields.entry(field.to_owned()).or_insert_with(|| "0".to_owned());
        let next = slot
            .parse::<i64>()
            .map_err(|e| KvError::Decode(format!("hash field {key}/{field}: {e}")))?
            + delta;
        *slot = next.to_string();
        Ok(next)
    }

    async fn hlen(&self, key: &str) -> Result<usize, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        match entries.get(key) {
            Some(Entry { value: Value::Hash(fields), .. }) => Ok(fields.len()),
            Some(_) => Err(KvError::Decode(format!("{key} holds a non-hash value"))),
            None => Ok(0),
        }
    }

    async fn hgetall_and_del(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        match entries.remove(key) {
            Some(Entry { value: Value::Hash(fields), .. }) => Ok(fields),
            Some(_) => Err(KvError::Decode(format!("{key} holds a non-hash value"))),
            None => Ok(HashMap::new()),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        let entry = entries.entry(key.to_owned()).or_insert_with(|| Entry {
            value: Value::Sorted(Vec::new()),
            deadline: None,
        });
        let Value::Sorted(members) = &mut entry.value else {
            return Err(KvError::Decode(format!("{key} holds a non-zset value")));
        };
        sorted_insert(members, member, score);
        Ok(())
    }

    async fn zrem(&self, key: &str, to_remove: &[String]) -> Result<(), KvError> {
        let mut entries = lock(&self.entries);
        if let Some(Entry { value: Value::Sorted(members), .. }) = entries.get_mut(key) {
            members.retain(|(m, _)| !to_remove.contains(m));
        }
        Ok(())
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        match entries.get(key) {
            Some(Entry { value: Value::Sorted(members), .. }) => Ok(members.clone()),
            Some(_) => Err(KvError::Decode(format!("{key} holds a non-zset value"))),
            None => Ok(Vec::new()),
        }
    }

    async fn zcard(&self, key: &str) -> Result<usize, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        purge(&mut entries, key, now);
        match entries.get(key) {
            Some(Entry { value: Value::Sorted(members), .. }) => Ok(members.len()),
            Some(_) => Err(KvError::Decode(format!("{key} holds a non-zset value"))),
            None => Ok(0),
        }
    }

    async fn zrem_below(&self, key: &str, max_score: f64) -> Result<usize, KvError> {
        let mut entries = lock(&self.entries);
        if let Some(Entry { value: Value::Sorted(members), .. }) = entries.get_mut(key) {
            let before = members.len();
            members.retain(|(_, score)| *score >= max_score);
            return Ok(before - members.len());
        }
        Ok(0)
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
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        entries.insert(
            key.to_owned(),
            Entry {
                value: Value::Str(value.to_owned()),
                deadline: Some(now + ttl),
            },
        );
        let index = entries.entry(index_key.to_owned()).or_insert_with(|| Entry {
            value: Value::Sorted(Vec::new()),
            deadline: None,
        });
        let Value::Sorted(members) = &mut index.value else {
            return Err(KvError::Decode(format!("{index_key} holds a non-zset value")));
        };
        sorted_insert(members, member, score);
        Ok(())
    }

    async fn del_with_zrem(&self, key: &str, index_key: &str, member: &str) -> Result<(), KvError> {
        let mut entries = lock(&self.entries);
        entries.remove(key);
        if let Some(Entry { value: Value::Sorted(members), .. }) = entries.get_mut(index_key) {
            members.retain(|(m, _)| m != member);
        }
        Ok(())
    }

    async fn window_consume(&self, op: &WindowConsume) -> Result<WindowOutcome, KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);

        let mut used = [0_i64; 3];
        for (i, key) in op.keys.iter().enumerate() {
            purge(&mut entries, key, now);
            if let Some(entry) = entries.get(key) {
                used[i] = parse_counter(&entry.value, key)?;
            }
            if op.limits[i] > 0 && used[i] + op.amount > op.limits[i] {
                return Ok(WindowOutcome::Exceeded {
                    index: i,
                    used: used[i],
                    limit: op.limits[i],
                });
            }
        }

        let mut totals = [0_i64; 3];
        for (i, key) in op.keys.iter().enumerate() {
            totals[i] = used[i] + op.amount;
            let deadline = match entries.get(key) {
                Some(entry) => entry.deadline,
                None => Some(now + op.ttls[i]),
            };
            entries.insert(
                key.clone(),
                Entry {
                    value: Value::Str(totals[i].to_string()),
                    deadline,
                },
            );
        }
        Ok(WindowOutcome::Applied { totals })
    }

    async fn window_refund(&self, keys: &[String; 3], amount: i64) -> Result<(), KvError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        for key in keys {
            purge(&mut entries, key, now);
            if let Some(entry) = entries.get_mut(key)
                && entry.deadline.is_some()
            {
                let remaining = (parse_counter(&entry.value, key)? - amount).max(0);
                entry.value = Value::Str(remaining.to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_get_roundtrip_and_expiry() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.ttl("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn incr_if_live_rejects_uninitialized_keys() {
        let kv = MemoryKv::new();
        let err = kv.incr_by_if_live("counter", 5).await.unwrap_err();
        assert!(matches!(err, KvError::KeyNotInitialized { .. }));

        kv.incr_by("persistent", 1).await.unwrap();
        let err = kv.incr_by_if_live("persistent", 5).await.unwrap_err();
        assert!(matches!(err, KvError::KeyNotInitialized { .. }));

        kv.set("live", "10", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.incr_by_if_live("live", 5).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn take_up_to_floors_at_zero() {
        let kv = MemoryKv::new();
        kv.set("pool", "300", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.take_up_to("pool", 100).await.unwrap(), 100);
        assert_eq!(kv.take_up_to("pool", 500).await.unwrap(), 200);
        assert_eq!(kv.take_up_to("pool", 1).await.unwrap(), 0);
        assert_eq!(kv.take_up_to("missing", 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zset_ordering_and_membership() {
        let kv = MemoryKv::new();
        kv.zadd("idx", "b", 2.0).await.unwrap();
        kv.zadd("idx", "a", 1.0).await.unwrap();
        kv.zadd("idx", "c", 3.0).await.unwrap();

        let members: Vec<String> = kv
            .zrange_with_scores("idx")
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["a", "b", "c"]);

        // re-adding updates the score in place
        kv.zadd("idx", "a", 9.0).await.unwrap();
        assert_eq!(kv.zcard("idx").await.unwrap(), 3);

        assert_eq!(kv.zrem_below("idx", 3.0).await.unwrap(), 1);
        assert_eq!(kv.zcard("idx").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn hgetall_and_del_clears_atomically() {
        let kv = MemoryKv::new();
        kv.hincr_by("buf", "1", 5).await.unwrap();
        kv.hincr_by("buf", "2", -3).await.unwrap();

        let drained = kv.hgetall_and_del("buf").await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained["1"], "5");
        assert_eq!(drained["2"], "-3");
        assert_eq!(kv.hlen("buf").await.unwrap(), 0);
        assert!(kv.hgetall_and_del("buf").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn window_consume_enforces_first_breached_limit() {
        let kv = MemoryKv::new();
        let op = WindowConsume {
            keys: ["d".into(), "w".into(), "t".into()],
            amount: 600,
            limits: [1000, 0, 5000],
            ttls: [Duration::from_secs(60); 3],
        };
        assert!(matches!(
            kv.window_consume(&op).await.unwrap(),
            WindowOutcome::Applied { totals: [600, 600, 600] }
        ));
        // second call would push daily to 1200 > 1000
        match kv.window_consume(&op).await.unwrap() {
            WindowOutcome::Exceeded { index, used, limit } => {
                assert_eq!((index, used, limit), (0, 600, 1000));
            }
            other => panic!("expected exceeded, got {other:?}"),
        }
        // nothing moved on the refused call
        assert_eq!(kv.get("w").await.unwrap().as_deref(), Some("600"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_refund_skips_expired_windows() {
        let kv = MemoryKv::new();
        let keys = ["d".to_owned(), "w".to_owned(), "t".to_owned()];
        let op = WindowConsume {
            keys: keys.clone(),
            amount: 500,
            limits: [0, 0, 0],
            ttls: [
                Duration::from_secs(10),
                Duration::from_secs(1000),
                Duration::from_secs(1000),
            ],
        };
        kv.window_consume(&op).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        kv.window_refund(&keys, 200).await.unwrap();

        // daily expired and stays gone; the others refunded
        assert_eq!(kv.get("d").await.unwrap(), None);
        assert_eq!(kv.get("w").await.unwrap().as_deref(), Some("300"));
        assert_eq!(kv.get("t").await.unwrap().as_deref(), Some("300"));
    }

    #[tokio::test]
    async fn window_refund_floors_at_zero() {
        let kv = MemoryKv::new();
        let keys = ["d".to_owned(), "w".to_owned(), "t".to_owned()];
        let op = WindowConsume {
            keys: keys.clone(),
            amount: 100,
            limits: [0; 3],
            ttls: [Duration::from_secs(60); 3],
        };
        kv.window_consume(&op).await.unwrap();
        kv.window_refund(&keys, 250).await.unwrap();
        assert_eq!(kv.get("d").await.unwrap().as_deref(), Some("0"));
    }
}
