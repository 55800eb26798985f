//! Pure aggregation decisions over group state and a caller-supplied `now`.

use super::types::{ArrivalEvent, GroupKey, MessageGroup};
use crate::config::AggregationConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct AggregationPolicy {
    window_seconds: i64,
    quick_threshold: ChronoDuration,
    stale_threshold: ChronoDuration,
    max_items: usize,
    aggregate_channels: Vec<String>,
}

impl AggregationPolicy {
    pub fn new(config: &AggregationConfig) -> Self {
        Self {
            window_seconds: i64::try_from(config.window_seconds.max(1)).unwrap_or(i64::MAX),
            quick_threshold: secs(config.quick_threshold_seconds),
            stale_threshold: secs(config.stale_threshold_seconds),
            max_items: config.max_items.max(1),
            aggregate_channels: config
                .aggregate_channels
                .iter()
                .map(|c| c.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn stale_threshold(&self) -> ChronoDuration {
        self.stale_threshold
    }

    /// Media arrivals on a grouped channel are aggregated; the rest pass through.
    pub fn is_aggregatable(&self, event: &ArrivalEvent) -> bool {
        let channel = event.channel.trim().to_ascii_lowercase();
        event.has_payload() && self.aggregate_channels.iter().any(|c| *c == channel)
    }

    pub fn time_bucket(&self, received_at: DateTime<Utc>) -> i64 {
        received_at.timestamp().div_euclid(self.window_seconds)
    }

    pub fn group_key(&self, event: &ArrivalEvent) -> GroupKey {
        group_key_for(&event.sender_id, self.time_bucket(event.received_at))
    }

    pub fn is_full(&self, group: &MessageGroup) -> bool {
        group.item_count >= self.max_items
    }

    /// Count cap reached, or the quick threshold elapsed since the first item.
    pub fn should_finalize_inline(&self, group: &MessageGroup, now: DateTime<Utc>) -> bool {
        self.is_full(group) || now - group.created_at >= self.quick_threshold
    }

    pub fn is_stale(&self, group: &MessageGroup, now: DateTime<Utc>) -> bool {
        now - group.updated_at >= self.stale_threshold
    }
}

fn secs(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

/// `hex(sha256(sender_id NUL bucket))`; the separator keeps `("a1", 2)` and
/// `("a", 12)` apart.
pub fn group_key_for(sender_id: &str, bucket: i64) -> GroupKey {
    let mut hasher = Sha256::new();
    hasher.update(sender_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(bucket.to_be_bytes());
    GroupKey::new(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::types::ArrivalEvent;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn policy() -> AggregationPolicy {
        AggregationPolicy::new(&AggregationConfig::default())
    }

    fn group_with(count: usize, created: i64, updated: i64) -> MessageGroup {
        let mut group = MessageGroup::open(
            GroupKey::new("k"),
            ArrivalEvent::new("+1", "m0", at(created)),
            at(created),
        );
        for i in 1..count {
            group.push(ArrivalEvent::new("+1", format!("m{i}"), at(updated)), at(updated));
        }
        group
    }

    #[test]
    fn same_sender_same_window_shares_key() {
        let p = policy();
        let a = ArrivalEvent::new("+1", "a", at(100));
        let b = ArrivalEvent::new("+1", "b", at(104));
        let c = ArrivalEvent::new("+1", "c", at(105));
        assert_eq!(p.group_key(&a), p.group_key(&b));
        assert_ne!(p.group_key(&a), p.group_key(&c));
    }

    #[test]
    fn different_senders_never_collide() {
        let p = policy();
        let a = ArrivalEvent::new("+1", "a", at(100));
        let b = ArrivalEvent::new("+2", "a", at(100));
        assert_ne!(p.group_key(&a), p.group_key(&b));
        assert_ne!(group_key_for("a1", 2), group_key_for("a", 12));
    }

    #[test]
    fn pre_epoch_timestamps_bucket_downwards() {
        let p = policy();
        assert_eq!(p.time_bucket(at(-1)), -1);
        assert_eq!(p.time_bucket(at(0)), 0);
        assert_eq!(p.time_bucket(at(4)), 0);
    }

    #[test]
    fn aggregatable_requires_grouped_channel_and_payload() {
        let p = policy();
        assert!(p.is_aggregatable(&ArrivalEvent::new("+1", "m", at(0))));
        assert!(p.is_aggregatable(&ArrivalEvent::new("+1", "m", at(0)).with_channel("WhatsApp")));
        assert!(!p.is_aggregatable(&ArrivalEvent::new("+1", "", at(0)).with_text("hi")));
        assert!(!p.is_aggregatable(&ArrivalEvent::new("+1", "m", at(0)).with_channel("webapp")));
    }

    #[test]
    fn inline_finalize_on_count_cap() {
        let p = policy();
        assert!(!p.should_finalize_inline(&group_with(2, 0, 1), at(1)));
        assert!(p.should_finalize_inline(&group_with(3, 0, 1), at(1)));
    }

    #[test]
    fn inline_finalize_on_quick_threshold_from_first_item() {
        let p = policy();
        let group = group_with(2, 0, 2);
        assert!(!p.should_finalize_inline(&group, at(2)));
        assert!(p.should_finalize_inline(&group, at(3)));
    }

    #[test]
    fn staleness_measured_from_last_update() {
        let p = policy();
        let group = group_with(2, 0, 3);
        assert!(!p.is_stale(&group, at(7)));
        assert!(p.is_stale(&group, at(8)));
    }
}
