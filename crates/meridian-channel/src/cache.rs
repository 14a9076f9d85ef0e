use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use meridian_store::ChannelRecord;

use crate::normalize::normalize_model_name;
use crate::{Channel, ChannelStatus};

/// In-memory snapshot of the channel table
///
/// Readers resolve `(group, model)` to an ordered candidate list and
/// ids to channel records; a periodic rebuild (or explicit
/// invalidation after admin writes) swaps in a whole new snapshot.
/// Multi-key polling cursors survive the swap; everything else is
/// taken from the fresh rows.
#[derive(Default)]
pub struct ChannelCache {
    inner: RwLock<Snapshot>,
}

#[derive(Default)]
struct Snapshot {
    /// group → model → channel ids, sorted by descending priority
    buckets: HashMap<String, HashMap<String, Vec<i64>>>,
    by_id: HashMap<i64, Arc<Channel>>,
    /// round-robin key cursor per multi-key channel
    polling_cursor: HashMap<i64, usize>,
}

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot from fresh store rows
    ///
    /// Disabled channels stay resolvable by id (admin views need
    /// them) but never appear in a `(group, model)` bucket.
    pub fn rebuild(&self, records: &[ChannelRecord]) {
        let mut by_id = HashMap::with_capacity(records.len());
        let mut buckets: HashMap<String, HashMap<String, Vec<i64>>> = HashMap::new();

        for record in records {
            let channel = Arc::new(Channel::from_record(record));
            if channel.status == ChannelStatus::Enabled {
                for group in channel.groups() {
                    let models = buckets.entry(group.clone()).or_default();
                    for model in channel.models() {
                        models.entry(model.clone()).or_default().push(channel.id);
                    }
                }
            }
            by_id.insert(channel.id, channel);
        }

        for models in buckets.values_mut() {
            for ids in models.values_mut() {
                ids.sort_by_key(|id| {
                    std::cmp::Reverse(by_id.get(id).map_or(0, |c: &Arc<Channel>| c.priority))
                });
            }
        }

        let mut inner = self.write();
        let polling_cursor = std::mem::take(&mut inner.polling_cursor)
            .into_iter()
            .filter(|(id, _)| {
                by_id
                    .get(id)
                    .is_some_and(|channel: &Arc<Channel>| channel.is_multi_key())
            })
            .collect();
        *inner = Snapshot {
            buckets,
            by_id,
            polling_cursor,
        };
        tracing::debug!(channels = records.len(), "channel snapshot rebuilt");
    }

    pub fn channel(&self, id: i64) -> Option<Arc<Channel>> {
        self.read().by_id.get(&id).cloned()
    }

    /// Candidate ids for `(group, model)`, descending by priority
    ///
    /// Falls back to the normalized model name when the exact name
    /// has no bucket, so dated aliases share their family's channels.
    pub fn candidates(&self, group: &str, model: &str) -> Vec<i64> {
        let inner = self.read();
        let Some(models) = inner.buckets.get(group) else {
            return Vec::new();
        };
        if let Some(ids) = models.get(model) {
            return ids.clone();
        }
        models
            .get(&normalize_model_name(model))
            .cloned()
            .unwrap_or_default()
    }

    /// Apply a status change in place, without waiting for a rebuild
    pub fn set_status(&self, id: i64, status: ChannelStatus) {
        let mut inner = self.write();
        let Some(existing) = inner.by_id.get(&id) else {
            return;
        };
        let mut updated = (**existing).clone();
        updated.status = status;
        inner.by_id.insert(id, Arc::new(updated));

        if status != ChannelStatus::Enabled {
            for models in inner.buckets.values_mut() {
                for ids in models.values_mut() {
                    ids.retain(|candidate| *candidate != id);
                }
            }
        }
    }

    /// Advance and return the round-robin key cursor for a channel
    pub fn next_key_index(&self, id: i64) -> usize {
        let mut inner = self.write();
        let cursor = inner.polling_cursor.entry(id).or_insert(0);
        let index = *cursor;
        *cursor = cursor.wrapping_add(1);
        index
    }

    pub fn channel_count(&self) -> usize {
        self.read().by_id.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, priority: i64, groups: &str, models: &str) -> ChannelRecord {
        ChannelRecord {
            id,
            name: format!("channel-{id}"),
            status: 1,
            priority,
            weight: 0,
            groups: groups.to_owned(),
            models: models.to_owned(),
            base_url: String::new(),
            key: "sk-a\nsk-b".to_owned(),
            settings: String::new(),
        }
    }

    #[test]
    fn candidates_are_priority_ordered() {
        let cache = ChannelCache::new();
        cache.rebuild(&[
            record(1, 5, "std", "m"),
            record(2, 10, "std", "m"),
            record(3, 10, "std", "m"),
        ]);

        let ids = cache.candidates("std", "m");
        assert_eq!(ids.len(), 3);
        assert_eq!(cache.channel(ids[0]).unwrap().priority, 10);
        assert_eq!(cache.channel(ids[2]).unwrap().priority, 5);
        assert!(cache.candidates("other", "m").is_empty());
        assert!(cache.candidates("std", "other").is_empty());
    }

    #[test]
    fn normalized_lookup_reaches_the_family_bucket() {
        let cache = ChannelCache::new();
        cache.rebuild(&[record(1, 0, "std", "claude-sonnet-4")]);
        assert_eq!(cache.candidates("std", "claude-sonnet-4-20250514"), vec![1]);
    }

    #[test]
    fn disabled_channels_resolve_by_id_only() {
        let cache = ChannelCache::new();
        let mut disabled = record(1, 0, "std", "m");
        disabled.status = 2;
        cache.rebuild(&[disabled, record(2, 0, "std", "m")]);

        assert_eq!(cache.candidates("std", "m"), vec![2]);
        assert!(cache.channel(1).is_some());
    }

    #[test]
    fn status_change_prunes_buckets_in_place() {
        let cache = ChannelCache::new();
        cache.rebuild(&[record(1, 0, "std", "m"), record(2, 0, "std", "m")]);

        cache.set_status(1, ChannelStatus::AutoDisabled);
        assert_eq!(cache.candidates("std", "m"), vec![2]);
        assert_eq!(cache.channel(1).unwrap().status, ChannelStatus::AutoDisabled);
    }

    #[test]
    fn polling_cursor_survives_rebuild() {
        let cache = ChannelCache::new();
        cache.rebuild(&[record(1, 0, "std", "m")]);
        assert_eq!(cache.next_key_index(1), 0);
        assert_eq!(cache.next_key_index(1), 1);

        cache.rebuild(&[record(1, 0, "std", "m")]);
        assert_eq!(cache.next_key_index(1), 2);

        // dropped channels forget their cursor
        cache.rebuild(&[record(2, 0, "std", "m")]);
        cache.rebuild(&[record(1, 0, "std", "m")]);
        assert_eq!(cache.next_key_index(1), 0);
    }
}
