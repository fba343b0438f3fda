//! Delivery status aggregation as seen through the conversation state.

use sigline::chat::delivery::{
    BUFFERED_RECEIPT_RETENTION_MS, DeliveryStatus, DeliveryStatusTracker, MAX_GROUP_SIZE,
};
use sigline::contacts::Contact;
use sigline::envelope::{DataMessage, Envelope, ReceiptMessage, SentMessage, SyncMessage};
use sigline::state::{ConversationState, transcript};
use std::collections::BTreeMap;
use std::time::Duration;

const ME: &str = "+15555550000";
const BOB: &str = "+15555550001";
const CAROL: &str = "+15555550002";
const GROUP: &str = "AQID";

fn receipt(from: &str, ts: i64, delivery: bool) -> Envelope {
    Envelope {
        source: from.into(),
        source_number: Some(from.into()),
        timestamp: Some(ts + 50),
        receipt_message: Some(ReceiptMessage {
            when: Some(ts + 50),
            is_delivery: delivery,
            is_read: !delivery,
            timestamps: vec![ts],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn text_to(target: &str, ts: i64, text: &str) -> Envelope {
    Envelope::outgoing(
        ME,
        target,
        ts,
        DataMessage {
            message: Some(text.into()),
            ..Default::default()
        },
    )
}

/// A message this account sent from another linked device.
fn sync_sent(destination: &str, ts: i64, text: &str) -> Envelope {
    Envelope {
        source: ME.into(),
        source_number: Some(ME.into()),
        timestamp: Some(ts),
        sync_message: Some(SyncMessage {
            sent_message: Some(SentMessage {
                destination: Some(destination.into()),
                data: DataMessage {
                    timestamp: Some(ts),
                    message: Some(text.into()),
                    ..Default::default()
                },
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn state_with_group(members: &[&str]) -> ConversationState {
    let mut state = ConversationState::new(ME, Duration::from_secs(10), false);
    let mut individuals = BTreeMap::new();
    for number in [BOB, CAROL] {
        individuals.insert(number.to_string(), Contact::individual(number, number));
    }
    let mut group = Contact::group(GROUP, "Book Club");
    group.members_ids = members.iter().map(|m| m.to_string()).collect();
    let mut groups = BTreeMap::new();
    groups.insert(GROUP.to_string(), group);
    state.on_contacts_loaded(individuals, groups);
    state
}

#[derive(Clone, Copy, Debug)]
enum Step {
    Sent,
    DeliveredReceipt,
    ReadReceipt,
}

fn permutations(steps: &[Step]) -> Vec<Vec<Step>> {
    if steps.len() <= 1 {
        return vec![steps.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..steps.len() {
        let mut rest = steps.to_vec();
        let first = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, first);
            out.push(tail);
        }
    }
    out
}

#[test]
fn status_is_monotone_in_every_order() {
    let all = permutations(&[Step::Sent, Step::DeliveredReceipt, Step::ReadReceipt]);
    assert_eq!(all.len(), 6);
    for order in all {
        let mut tracker = DeliveryStatusTracker::new();
        tracker.on_sending_message(1000, None);
        let mut last = tracker.status(1000);
        for step in &order {
            match step {
                Step::Sent => tracker.on_sending_done(1000, DeliveryStatus::Sent, None),
                Step::DeliveredReceipt => {
                    if let Some(r) = receipt(BOB, 1000, true).receipt_message {
                        tracker.on_receive_receipt(BOB, &r);
                    }
                }
                Step::ReadReceipt => {
                    if let Some(r) = receipt(BOB, 1000, false).receipt_message {
                        tracker.on_receive_receipt(BOB, &r);
                    }
                }
            }
            let now = tracker.status(1000);
            assert!(now >= last, "{order:?}: {last} -> {now}");
            last = now;
        }
        assert_eq!(last, DeliveryStatus::Read, "{order:?}");
        let changes = tracker.take_changes();
        assert!(changes.windows(2).all(|w| w[0].status < w[1].status));
    }
}

#[test]
fn group_status_needs_every_member() {
    let mut state = state_with_group(&[ME, BOB, CAROL]);
    let env = text_to(GROUP, 2000, "meeting moved");
    state.on_sending_message(env.clone());
    state.on_sending_done(&env, DeliveryStatus::Sent, None);

    state.on_receive_receipt(&receipt(BOB, 2000, true));
    assert_eq!(state.delivery.status(2000), DeliveryStatus::Sent);
    state.on_receive_receipt(&receipt(CAROL, 2000, true));
    assert_eq!(state.delivery.status(2000), DeliveryStatus::Delivered);
    state.on_receive_receipt(&receipt(BOB, 2000, false));
    assert_eq!(state.delivery.status(2000), DeliveryStatus::Delivered);
    state.on_receive_receipt(&receipt(CAROL, 2000, false));
    assert_eq!(state.delivery.status(2000), DeliveryStatus::Read);
    assert!(state.delivery.get(2000).pending.is_none());
}

#[test]
fn large_group_skips_tracking() {
    let numbers: Vec<String> = (0..=MAX_GROUP_SIZE)
        .map(|i| format!("+1555556{i:04}"))
        .collect();
    let members: Vec<&str> = numbers.iter().map(String::as_str).collect();
    let mut state = state_with_group(&members);
    let env = text_to(GROUP, 3000, "hello everyone");
    state.on_sending_message(env.clone());
    state.on_sending_done(&env, DeliveryStatus::Sent, None);
    state.on_receive_receipt(&receipt(&numbers[0], 3000, true));
    assert_eq!(state.delivery.status(3000), DeliveryStatus::IgnoreReceipts);
}

#[test]
fn early_receipts_match_late_receipts() {
    let mut early = state_with_group(&[ME, BOB]);
    early.on_receive_receipt(&receipt(BOB, 4000, true));
    early.on_receive_receipt(&receipt(BOB, 4000, false));
    assert_eq!(early.delivery.buffered_len(), 2);
    early.on_receive_sync_message(sync_sent(BOB, 4000, "from my laptop"));

    let mut late = state_with_group(&[ME, BOB]);
    late.on_receive_sync_message(sync_sent(BOB, 4000, "from my laptop"));
    late.on_receive_receipt(&receipt(BOB, 4000, true));
    late.on_receive_receipt(&receipt(BOB, 4000, false));

    assert_eq!(early.delivery.buffered_len(), 0);
    assert_eq!(early.delivery.status(4000), DeliveryStatus::Read);
    assert_eq!(early.delivery.status(4000), late.delivery.status(4000));
    assert_eq!(early.chats.get(BOB).unwrap().len(), 1);
}

#[test]
fn persisted_table_survives_reload() {
    let mut state = state_with_group(&[ME, BOB, CAROL]);
    let env = text_to(GROUP, 5000, "saved");
    state.on_sending_message(env.clone());
    state.on_sending_done(&env, DeliveryStatus::Sent, None);
    state.on_receive_receipt(&receipt(BOB, 5000, true));

    let json = serde_json::to_string(&state.delivery.dump()).unwrap();
    let table = serde_json::from_str(&json).unwrap();
    let mut restored = DeliveryStatusTracker::new();
    restored.load(table);

    let entry = restored.get(5000);
    assert_eq!(entry.status, DeliveryStatus::Sent);
    let pending = entry.pending.unwrap();
    assert!(pending.delivered.contains(CAROL));
    assert!(pending.read.contains(BOB));

    if let Some(r) = receipt(CAROL, 5000, true).receipt_message {
        restored.on_receive_receipt(CAROL, &r);
    }
    assert_eq!(restored.status(5000), DeliveryStatus::Delivered);
}

#[test]
fn failed_send_marks_conversation_until_opened() {
    let mut state = state_with_group(&[ME, BOB, CAROL]);
    let to_bob = text_to(BOB, 6000, "are you there");
    state.on_sending_message(to_bob.clone());
    state.on_sending_done(&to_bob, DeliveryStatus::SendFailed, None);
    assert!(state.has_send_failure(BOB));
    assert!(!state.has_send_failure(CAROL));
    let header = &transcript::render(&state, Some(BOB), 5)[0];
    assert!(header.ends_with("[send failed] =="), "{header}");

    state.open_conversation(BOB);
    assert!(!state.has_send_failure(BOB));
    assert!(!transcript::render(&state, Some(BOB), 5)[0].contains("send failed"));

    // A failure in the conversation being looked at is not marked.
    let again = text_to(BOB, 6100, "hello?");
    state.on_sending_message(again.clone());
    state.on_sending_done(&again, DeliveryStatus::SendFailed, None);
    assert!(!state.has_send_failure(BOB));
}

#[test]
fn stale_buffered_receipts_are_pruned() {
    let now = 10 * BUFFERED_RECEIPT_RETENTION_MS;
    let stale = now - BUFFERED_RECEIPT_RETENTION_MS - 1;
    let fresh = now - 1000;

    let mut tracker = DeliveryStatusTracker::new();
    for ts in [stale, fresh] {
        if let Some(r) = receipt(BOB, ts, true).receipt_message {
            tracker.on_receive_receipt(BOB, &r);
        }
    }
    assert_eq!(tracker.buffered_len(), 2);
    assert_eq!(tracker.prune_buffered(now), 1);
    assert_eq!(tracker.buffered_len(), 1);

    // The surviving receipt still applies once its message is tracked.
    tracker.on_sending_message(fresh, None);
    tracker.on_sending_done(fresh, DeliveryStatus::Sent, None);
    tracker.process_buffered_receipts(fresh);
    assert_eq!(tracker.status(fresh), DeliveryStatus::Delivered);
}
