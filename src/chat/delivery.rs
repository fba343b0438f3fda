//! Delivery status per sent message, keyed by the message's timestamp.
//!
//! Status only ever advances. For group messages each member's receipts are
//! tracked separately and reduced to one aggregate status: "delivered" once
//! every member has acknowledged delivery, "read" once every member has read
//! it. Receipts can arrive before the message they refer to is known (a
//! message sent from another device is only learned about through a later
//! sync); those are held back and replayed when the timestamp shows up.

use crate::envelope::ReceiptMessage;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Groups larger than this skip per-member tracking.
pub const MAX_GROUP_SIZE: usize = 15;

/// Buffered receipts for messages sent longer ago than this are dropped
/// when history is saved; the message they wait for is not coming.
pub const BUFFERED_RECEIPT_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

/// Declaration order is precedence order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    #[serde(rename = "")]
    Unset,
    ReceivedByMe,
    Sending,
    SendFailed,
    Sent,
    Delivered,
    Read,
    IgnoreReceipts,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unset => "unset",
            Self::ReceivedByMe => "received_by_me",
            Self::Sending => "sending",
            Self::SendFailed => "send_failed",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::IgnoreReceipts => "ignore_receipts",
        };
        f.write_str(s)
    }
}

/// Group members that have not yet acknowledged delivery, and those that
/// have acknowledged delivery but not read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPending {
    pub delivered: BTreeSet<String>,
    pub read: BTreeSet<String>,
}

impl GroupPending {
    fn is_empty(&self) -> bool {
        self.delivered.is_empty() && self.read.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusEntry {
    pub status: DeliveryStatus,
    /// Time of the receipt that set the status, 0 if none.
    pub when: i64,
    pub pending: Option<GroupPending>,
}

impl StatusEntry {
    /// Apply one member's receipt; returns the aggregate status it yields,
    /// if the aggregate changes.
    fn apply_member_receipt(
        &mut self,
        member: &str,
        status: DeliveryStatus,
    ) -> Option<DeliveryStatus> {
        let pending = self.pending.as_mut()?;

        let removed = match status {
            DeliveryStatus::Delivered => pending.delivered.remove(member),
            DeliveryStatus::Read => pending.read.remove(member),
            _ => false,
        };
        if !removed {
            // A read receipt ahead of the delivery receipt, or a duplicate.
            if !pending.delivered.remove(member) {
                return None;
            }
            if pending.delivered.is_empty() && !pending.read.is_empty() {
                return Some(DeliveryStatus::Delivered);
            }
            if status == DeliveryStatus::Delivered {
                pending.read.insert(member.to_string());
                return pending
                    .delivered
                    .is_empty()
                    .then_some(DeliveryStatus::Delivered);
            }
        } else if status == DeliveryStatus::Delivered {
            pending.read.insert(member.to_string());
            return pending
                .delivered
                .is_empty()
                .then_some(DeliveryStatus::Delivered);
        }

        if !pending.is_empty() {
            return None;
        }
        self.pending = None;
        Some(status)
    }

    fn is_empty(&self) -> bool {
        self.status == DeliveryStatus::Unset && self.when == 0 && self.pending.is_none()
    }
}

/// Serialized as `[status, when, [pending delivered, pending read]]` with
/// trailing empty values dropped.
impl Serialize for StatusEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut fields: Vec<Value> = vec![
            serde_json::to_value(self.status).map_err(serde::ser::Error::custom)?,
            Value::from(self.when),
        ];
        if let Some(pending) = &self.pending {
            fields.push(serde_json::json!([pending.delivered, pending.read]));
        } else {
            while fields.last().is_some_and(is_blank) {
                fields.pop();
            }
        }
        fields.serialize(serializer)
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_i64() == Some(0),
        _ => false,
    }
}

impl<'de> Deserialize<'de> for StatusEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Vec::<Value>::deserialize(deserializer)?;
        let mut fields = fields.into_iter();
        let status = match fields.next() {
            Some(v) => serde_json::from_value(v).map_err(D::Error::custom)?,
            None => DeliveryStatus::Unset,
        };
        let when = fields.next().and_then(|v| v.as_i64()).unwrap_or(0);
        let pending = match fields.next() {
            Some(Value::Null) | None => None,
            Some(v) => {
                let (delivered, read): (Option<BTreeSet<String>>, Option<BTreeSet<String>>) =
                    serde_json::from_value(v).map_err(D::Error::custom)?;
                Some(GroupPending {
                    delivered: delivered.unwrap_or_default(),
                    read: read.unwrap_or_default(),
                })
            }
        };
        Ok(Self {
            status,
            when,
            pending,
        })
    }
}

/// A status transition, reported so the caller can redraw or print it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub timestamp: i64,
    pub status: DeliveryStatus,
}

#[derive(Debug, Default)]
pub struct DeliveryStatusTracker {
    entries: HashMap<i64, StatusEntry>,
    /// Receipts for timestamps not tracked yet, in arrival order.
    buffered: HashMap<i64, Vec<(DeliveryStatus, String)>>,
    changes: Vec<StatusChange>,
}

impl DeliveryStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, timestamp: i64) -> StatusEntry {
        self.entries.get(&timestamp).cloned().unwrap_or_default()
    }

    pub fn status(&self, timestamp: i64) -> DeliveryStatus {
        self.entries
            .get(&timestamp)
            .map(|e| e.status)
            .unwrap_or_default()
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.entries.contains_key(&timestamp)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.values().map(Vec::len).sum()
    }

    /// Drain the transitions recorded since the last call.
    pub fn take_changes(&mut self) -> Vec<StatusChange> {
        std::mem::take(&mut self.changes)
    }

    /// Start tracking an outgoing message. With a member list it becomes a
    /// group message with per-member tracking.
    pub fn on_sending_message(&mut self, timestamp: i64, group_members: Option<&BTreeSet<String>>) {
        self.set(timestamp, DeliveryStatus::Sending, None, None);
        let Some(members) = group_members else {
            return;
        };
        if members.len() > MAX_GROUP_SIZE {
            self.set(timestamp, DeliveryStatus::IgnoreReceipts, None, None);
            return;
        }
        if let Some(entry) = self.entries.get_mut(&timestamp) {
            entry.pending = Some(GroupPending {
                delivered: members.clone(),
                read: BTreeSet::new(),
            });
        }
    }

    /// Record the send result. A successful send may move the entry to the
    /// timestamp the daemon actually used.
    pub fn on_sending_done(
        &mut self,
        timestamp: i64,
        status: DeliveryStatus,
        timestamp_adj: Option<i64>,
    ) {
        if !self.entries.contains_key(&timestamp) {
            tracing::error!(timestamp, "sending done for an untracked message");
            return;
        }
        self.set(timestamp, status, None, None);
        if status == DeliveryStatus::SendFailed {
            return;
        }
        if let Some(adj) = timestamp_adj
            && let Some(entry) = self.entries.remove(&timestamp)
        {
            self.entries.insert(adj, entry);
        }
    }

    /// Apply a delivery or read receipt from `sender`.
    pub fn on_receive_receipt(&mut self, sender: &str, receipt: &ReceiptMessage) {
        let status = if receipt.is_delivery {
            DeliveryStatus::Delivered
        } else if receipt.is_read {
            DeliveryStatus::Read
        } else if receipt.is_viewed {
            return;
        } else {
            tracing::error!(sender, "unknown receipt type");
            return;
        };
        for &timestamp in &receipt.timestamps {
            if self.entries.contains_key(&timestamp) {
                self.set(timestamp, status, receipt.when, Some(sender));
            } else {
                tracing::debug!(timestamp, "buffering receipt for unknown timestamp");
                self.buffered
                    .entry(timestamp)
                    .or_default()
                    .push((status, sender.to_string()));
            }
        }
    }

    /// Replay receipts that arrived before `timestamp` was tracked.
    pub fn process_buffered_receipts(&mut self, timestamp: i64) {
        let Some(receipts) = self.buffered.remove(&timestamp) else {
            return;
        };
        tracing::debug!(timestamp, count = receipts.len(), "replaying buffered receipts");
        for (status, contact) in receipts {
            self.set(timestamp, status, None, Some(&contact));
        }
    }

    /// Drop buffered receipts for timestamps older than the retention
    /// window. Returns how many receipts were dropped.
    pub fn prune_buffered(&mut self, now_ms: i64) -> usize {
        let cutoff = now_ms - BUFFERED_RECEIPT_RETENTION_MS;
        let before = self.buffered_len();
        self.buffered.retain(|&timestamp, _| timestamp >= cutoff);
        let dropped = before - self.buffered_len();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped stale buffered receipts");
        }
        dropped
    }

    pub fn delete(&mut self, timestamp: i64) {
        self.entries.remove(&timestamp);
    }

    /// Entries worth persisting.
    pub fn dump(&self) -> BTreeMap<i64, StatusEntry> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_empty())
            .map(|(ts, e)| (*ts, e.clone()))
            .collect()
    }

    pub fn load(&mut self, entries: BTreeMap<i64, StatusEntry>) {
        self.entries.extend(entries);
    }

    fn set(
        &mut self,
        timestamp: i64,
        status: DeliveryStatus,
        when: Option<i64>,
        receipt_contact: Option<&str>,
    ) {
        let entry = self.entries.entry(timestamp).or_default();
        if status <= entry.status {
            return;
        }

        let status = match receipt_contact {
            Some(contact) if entry.pending.is_some() => {
                match entry.apply_member_receipt(contact, status) {
                    Some(aggregate) if aggregate > entry.status => aggregate,
                    _ => return,
                }
            }
            _ => status,
        };

        tracing::info!(timestamp, %status, "delivery status changed");
        entry.status = status;
        if let Some(when) = when {
            entry.when = when;
        }
        self.changes.push(StatusChange { timestamp, status });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(timestamps: &[i64], delivery: bool) -> ReceiptMessage {
        ReceiptMessage {
            when: Some(99),
            is_delivery: delivery,
            is_read: !delivery,
            timestamps: timestamps.to_vec(),
            ..Default::default()
        }
    }

    fn members(n: usize) -> BTreeSet<String> {
        (0..n).map(|i| format!("+1555555{i:04}")).collect()
    }

    #[test]
    fn status_only_advances() {
        let mut t = DeliveryStatusTracker::new();
        t.on_sending_message(1, None);
        t.on_sending_done(1, DeliveryStatus::Sent, None);
        t.on_receive_receipt("+15555550001", &receipt(&[1], false));
        assert_eq!(t.status(1), DeliveryStatus::Read);
        t.on_receive_receipt("+15555550001", &receipt(&[1], true));
        assert_eq!(t.status(1), DeliveryStatus::Read);
        assert_eq!(t.get(1).when, 99);
    }

    #[test]
    fn adjusted_timestamp_rekeys_entry() {
        let mut t = DeliveryStatusTracker::new();
        t.on_sending_message(100, None);
        t.on_sending_done(100, DeliveryStatus::Sent, Some(130));
        assert!(!t.contains(100));
        assert_eq!(t.status(130), DeliveryStatus::Sent);
    }

    #[test]
    fn failed_send_keeps_original_key() {
        let mut t = DeliveryStatusTracker::new();
        t.on_sending_message(100, None);
        t.on_sending_done(100, DeliveryStatus::SendFailed, Some(130));
        assert_eq!(t.status(100), DeliveryStatus::SendFailed);
        assert!(!t.contains(130));
    }

    #[test]
    fn group_fan_out_promotes_when_all_members_ack() {
        let mut t = DeliveryStatusTracker::new();
        let group = members(3);
        t.on_sending_message(5, Some(&group));
        t.on_sending_done(5, DeliveryStatus::Sent, None);

        let mut it = group.iter();
        let (a, b, c) = (it.next().unwrap(), it.next().unwrap(), it.next().unwrap());
        t.on_receive_receipt(a, &receipt(&[5], true));
        t.on_receive_receipt(b, &receipt(&[5], true));
        assert_eq!(t.status(5), DeliveryStatus::Sent);
        t.on_receive_receipt(c, &receipt(&[5], true));
        assert_eq!(t.status(5), DeliveryStatus::Delivered);

        t.on_receive_receipt(a, &receipt(&[5], false));
        t.on_receive_receipt(b, &receipt(&[5], false));
        assert_eq!(t.status(5), DeliveryStatus::Delivered);
        t.on_receive_receipt(c, &receipt(&[5], false));
        assert_eq!(t.status(5), DeliveryStatus::Read);
        assert!(t.get(5).pending.is_none());
    }

    #[test]
    fn read_before_delivered_counts_as_delivered() {
        let mut t = DeliveryStatusTracker::new();
        let group = members(2);
        t.on_sending_message(5, Some(&group));
        t.on_sending_done(5, DeliveryStatus::Sent, None);
        let mut it = group.iter();
        let (a, b) = (it.next().unwrap(), it.next().unwrap());

        t.on_receive_receipt(a, &receipt(&[5], true));
        // b's read receipt overtakes its delivery receipt.
        t.on_receive_receipt(b, &receipt(&[5], false));
        assert_eq!(t.status(5), DeliveryStatus::Delivered);
        t.on_receive_receipt(a, &receipt(&[5], false));
        assert_eq!(t.status(5), DeliveryStatus::Read);
    }

    #[test]
    fn large_group_ignores_receipts() {
        let mut t = DeliveryStatusTracker::new();
        t.on_sending_message(7, Some(&members(20)));
        let entry = t.get(7);
        assert_eq!(entry.status, DeliveryStatus::IgnoreReceipts);
        assert!(entry.pending.is_none());
        t.on_receive_receipt("+15555550001", &receipt(&[7], false));
        assert_eq!(t.status(7), DeliveryStatus::IgnoreReceipts);
    }

    #[test]
    fn early_receipts_are_replayed() {
        let mut t = DeliveryStatusTracker::new();
        t.on_receive_receipt("+15555550001", &receipt(&[42], true));
        assert_eq!(t.buffered_len(), 1);
        assert!(!t.contains(42));

        t.on_sending_message(42, None);
        t.on_sending_done(42, DeliveryStatus::Sent, None);
        t.process_buffered_receipts(42);
        assert_eq!(t.status(42), DeliveryStatus::Delivered);
        assert_eq!(t.buffered_len(), 0);
    }

    #[test]
    fn changes_are_reported_once() {
        let mut t = DeliveryStatusTracker::new();
        t.on_sending_message(1, None);
        t.on_sending_done(1, DeliveryStatus::Sent, None);
        let changes = t.take_changes();
        assert_eq!(
            changes,
            [
                StatusChange { timestamp: 1, status: DeliveryStatus::Sending },
                StatusChange { timestamp: 1, status: DeliveryStatus::Sent },
            ]
        );
        assert!(t.take_changes().is_empty());
    }

    #[test]
    fn serialization_prunes_trailing_empty_values() {
        let sent = StatusEntry {
            status: DeliveryStatus::Sent,
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&sent).unwrap(), serde_json::json!(["sent"]));

        let delivered = StatusEntry {
            status: DeliveryStatus::Delivered,
            when: 12,
            pending: None,
        };
        assert_eq!(
            serde_json::to_value(&delivered).unwrap(),
            serde_json::json!(["delivered", 12])
        );

        let group = StatusEntry {
            status: DeliveryStatus::Sent,
            when: 0,
            pending: Some(GroupPending {
                delivered: ["+15555550002".to_string()].into(),
                read: ["+15555550001".to_string()].into(),
            }),
        };
        let value = serde_json::to_value(&group).unwrap();
        assert_eq!(
            value,
            serde_json::json!(["sent", 0, [["+15555550002"], ["+15555550001"]]])
        );
        let back: StatusEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, group);
    }

    #[test]
    fn dump_skips_unset_and_loads_back() {
        let mut t = DeliveryStatusTracker::new();
        t.on_sending_message(1, None);
        t.on_sending_done(1, DeliveryStatus::Sent, None);
        t.entries.insert(2, StatusEntry::default());
        let dumped = t.dump();
        assert_eq!(dumped.len(), 1);

        let json = serde_json::to_string(&dumped).unwrap();
        assert_eq!(json, r#"{"1":["sent"]}"#);
        let parsed: BTreeMap<i64, StatusEntry> = serde_json::from_str(&json).unwrap();
        let mut restored = DeliveryStatusTracker::new();
        restored.load(parsed);
        assert_eq!(restored.status(1), DeliveryStatus::Sent);
    }
}
