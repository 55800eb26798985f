use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_CHANNEL: &str = "whatsapp";

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

/// One inbound arrival, immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrivalEvent {
    pub sender_id: String,
    pub payload_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub received_at: DateTime<Utc>,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl ArrivalEvent {
    pub fn new(
        sender_id: impl Into<String>,
        payload_ref: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            payload_ref: payload_ref.into(),
            text: None,
            received_at,
            channel: default_channel(),
            content_type: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn has_payload(&self) -> bool {
        !self.payload_ref.trim().is_empty()
    }
}

/// Derived identifier of one in-flight aggregation unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Buffered arrivals for one `group_key`, as persisted by a group store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageGroup {
    pub group_key: GroupKey,
    pub sender_id: String,
    pub items: Vec<ArrivalEvent>,
    pub item_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl MessageGroup {
    /// First version of a group holding a single arrival.
    pub fn open(group_key: GroupKey, event: ArrivalEvent, now: DateTime<Utc>) -> Self {
        Self {
            group_key,
            sender_id: event.sender_id.clone(),
            items: vec![event],
            item_count: 1,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Append in arrival order, bumping the version.
    pub fn push(&mut self, event: ArrivalEvent, now: DateTime<Utc>) {
        self.items.push(event);
        self.item_count = self.items.len();
        self.updated_at = now;
        self.version += 1;
    }
}

/// Payload fields of one arrival as carried in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub payload_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl From<&ArrivalEvent> for BatchItem {
    fn from(event: &ArrivalEvent) -> Self {
        Self {
            payload_ref: event.payload_ref.clone(),
            text: event.text.clone(),
            content_type: event.content_type.clone(),
            received_at: event.received_at,
        }
    }
}

/// Canonical downstream unit, produced once per group destruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedBatch {
    pub idempotency_key: String,
    pub sender_id: String,
    pub group_key: GroupKey,
    pub items: Vec<BatchItem>,
    pub item_count: usize,
    pub created_at: DateTime<Utc>,
}

impl FinalizedBatch {
    /// Build a batch with a fresh idempotency key, keeping at most `max_items`.
    pub fn from_group(group: &MessageGroup, max_items: usize, now: DateTime<Utc>) -> Self {
        let items: Vec<BatchItem> = group
            .items
            .iter()
            .take(max_items)
            .map(BatchItem::from)
            .collect();
        Self {
            idempotency_key: fresh_idempotency_key(),
            sender_id: group.sender_id.clone(),
            group_key: group.group_key.clone(),
            item_count: items.len(),
            items,
            created_at: now,
        }
    }

    /// Non-empty item texts joined with `" | "`, in arrival order.
    pub fn combined_text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .items
            .iter()
            .filter_map(|item| item.text.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join(" | "))
        }
    }
}

pub fn fresh_idempotency_key() -> String {
    format!("batch_{}", Uuid::new_v4())
}

/// Terminal outcome of one `ingest` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Non-aggregatable arrival finalized as its own single-item batch.
    Passthrough(FinalizedBatch),
    Buffered { group_key: GroupKey, item_count: usize },
    Finalized(FinalizedBatch),
    /// Overflow or exhausted contention; the arrival is intentionally discarded.
    Dropped { group_key: GroupKey, reason: DropReason },
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passthrough(_) => "passthrough",
            Self::Buffered { .. } => "buffered",
            Self::Finalized(_) => "finalized",
            Self::Dropped { .. } => "dropped",
        }
    }

    pub fn batch(&self) -> Option<&FinalizedBatch> {
        match self {
            Self::Passthrough(batch) | Self::Finalized(batch) => Some(batch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    CapacityExceeded,
    Contention,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapacityExceeded => f.write_str("capacity_exceeded"),
            Self::Contention => f.write_str("contention"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn arrival_event_defaults_channel_when_absent() {
        let event: ArrivalEvent = serde_json::from_value(serde_json::json!({
            "sender_id": "+1",
            "payload_ref": "media/1.jpg",
            "received_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(event.channel, "whatsapp");
        assert!(event.text.is_none());
    }

    #[test]
    fn push_keeps_order_count_and_version_in_step() {
        let mut group =
            MessageGroup::open(GroupKey::new("k"), ArrivalEvent::new("+1", "a", at(0)), at(0));
        group.push(ArrivalEvent::new("+1", "b", at(1)), at(1));
        assert_eq!(group.item_count, 2);
        assert_eq!(group.items.len(), group.item_count);
        assert_eq!(group.version, 2);
        assert_eq!(group.items[1].payload_ref, "b");
        assert_eq!(group.created_at, at(0));
        assert_eq!(group.updated_at, at(1));
    }

    #[test]
    fn batch_caps_items_and_generates_distinct_keys() {
        let mut group =
            MessageGroup::open(GroupKey::new("k"), ArrivalEvent::new("+1", "a", at(0)), at(0));
        for name in ["b", "c", "d"] {
            group.push(ArrivalEvent::new("+1", name, at(1)), at(1));
        }
        let first = FinalizedBatch::from_group(&group, 3, at(2));
        let second = FinalizedBatch::from_group(&group, 3, at(2));
        assert_eq!(first.item_count, 3);
        let refs: Vec<_> = first.items.iter().map(|i| i.payload_ref.as_str()).collect();
        assert_eq!(refs, ["a", "b", "c"]);
        assert_ne!(first.idempotency_key, second.idempotency_key);
    }

    #[test]
    fn combined_text_skips_blank_entries() {
        let mut group = MessageGroup::open(
            GroupKey::new("k"),
            ArrivalEvent::new("+1", "a", at(0)).with_text("first"),
            at(0),
        );
        group.push(ArrivalEvent::new("+1", "b", at(0)).with_text("  "), at(0));
        group.push(ArrivalEvent::new("+1", "c", at(0)).with_text("third"), at(0));
        let batch = FinalizedBatch::from_group(&group, 3, at(0));
        assert_eq!(batch.combined_text().as_deref(), Some("first | third"));
    }

    #[test]
    fn batch_serializes_wire_shape() {
        let group =
            MessageGroup::open(GroupKey::new("k"), ArrivalEvent::new("+1", "a", at(0)), at(0));
        let batch = FinalizedBatch::from_group(&group, 3, at(0));
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["sender_id"], "+1");
        assert_eq!(value["item_count"], 1);
        assert_eq!(value["items"][0]["payload_ref"], "a");
        assert!(value["items"][0].get("text").is_none());
        assert!(value["idempotency_key"].as_str().unwrap().starts_with("batch_"));
    }
}
