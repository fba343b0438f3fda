//! Application state: every conversation, the counters and trackers layered
//! on top of them, and the handlers that apply daemon events to all of it.
//!
//! Handlers never issue commands. Anything worth showing is queued as a
//! [`Notice`] for the caller to drain.

pub mod history;
pub mod transcript;
pub mod unread;

use crate::chat::delivery::{DeliveryStatus, DeliveryStatusTracker, StatusChange};
use crate::chat::typing::TypingIndicators;
use crate::chat::{Conversations, Message, MessageRef};
use crate::contacts::{Contact, Contacts};
use crate::envelope::{DataMessage, Envelope, UNTRUSTED_IDENTITY_MARKER, now_ms};
use history::{HISTORY_VERSION, HistoryDocument};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use unread::UnreadCounts;

const UNKNOWN_CONTACT_NOTE: &str =
    "\n~~~\n[Message from an unknown contact. Accept on the primary device first]\n~~~";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A status line for the user.
    Status(String),
    NewMessage {
        conversation: String,
        sender: String,
        summary: String,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(text) => write!(f, "status: {text}"),
            Self::NewMessage {
                conversation,
                sender,
                summary,
            } if conversation == sender => write!(f, "{sender}: {summary}"),
            Self::NewMessage {
                conversation,
                sender,
                summary,
            } => write!(f, "[{conversation}] {sender}: {summary}"),
        }
    }
}

#[derive(Debug)]
pub struct ConversationState {
    pub chats: Conversations,
    pub unread: UnreadCounts,
    pub delivery: DeliveryStatusTracker,
    pub typing: TypingIndicators,
    pub contacts: Contacts,
    current: Option<String>,
    /// Conversations with a failed send the user has not looked at yet.
    send_failed: BTreeSet<String>,
    notify_on_reactions: bool,
    /// Messages from senders missing from the contacts list, held until
    /// the list is reloaded.
    pending_unknown: Vec<Envelope>,
    notices: Vec<Notice>,
}

impl ConversationState {
    pub fn new(own_number: &str, typing_ttl: Duration, notify_on_reactions: bool) -> Self {
        Self {
            chats: Conversations::new(),
            unread: UnreadCounts::default(),
            delivery: DeliveryStatusTracker::new(),
            typing: TypingIndicators::new(typing_ttl),
            contacts: Contacts::new(own_number),
            current: None,
            send_failed: BTreeSet::new(),
            notify_on_reactions,
            pending_unknown: Vec::new(),
            notices: Vec::new(),
        }
    }

    /// Replace the current state with a saved history document.
    pub fn restore(&mut self, doc: HistoryDocument) {
        self.delivery.load(doc.delivery_status);
        for envelope in doc.envelopes {
            if envelope.reaction().is_some() {
                self.chats.add_reaction_envelope(envelope);
            } else if envelope.remote_delete().is_some() {
                self.chats.add_remote_delete_envelope(envelope);
            } else {
                self.chats.add_envelope(envelope);
            }
        }
        self.unread = UnreadCounts::from_saved(doc.unread_counts);
        self.contacts = Contacts::from_cache(self.contacts.own_number(), doc.contacts_cache);
    }

    pub fn to_history(&self) -> HistoryDocument {
        HistoryDocument {
            version: HISTORY_VERSION,
            envelopes: self.chats.serialize(),
            unread_counts: self.unread.serialize(),
            delivery_status: self.delivery.dump(),
            contacts_cache: self.contacts.serialize(),
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn open_conversation(&mut self, conversation: &str) {
        self.current = Some(conversation.to_string());
        self.unread.clear(conversation);
        self.send_failed.remove(conversation);
    }

    /// Whether a send to `conversation` failed while it was not open.
    pub fn has_send_failure(&self, conversation: &str) -> bool {
        self.send_failed.contains(conversation)
    }

    pub fn set_status(&mut self, text: impl Into<String>) {
        self.notices.push(Notice::Status(text.into()));
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn take_delivery_changes(&mut self) -> Vec<StatusChange> {
        self.delivery.take_changes()
    }

    pub fn has_pending_unknown(&self) -> bool {
        !self.pending_unknown.is_empty()
    }

    pub fn on_sending_message(&mut self, envelope: Envelope) {
        let members = if envelope.is_group() {
            // Absent when a linked device sends to a group we have not
            // loaded yet.
            self.contacts
                .group_members(envelope.conversation_id())
                .cloned()
        } else {
            None
        };
        self.delivery
            .on_sending_message(envelope.timestamp(), members.as_ref());
        self.chats.add_envelope(envelope);
    }

    pub fn on_sending_reaction(&mut self, envelope: Envelope) {
        self.delivery.on_sending_message(envelope.timestamp(), None);
        self.chats.add_reaction_envelope(envelope);
    }

    /// Apply a send result. An adjusted timestamp re-keys the delivery
    /// status and moves the message to where the new timestamp sorts.
    pub fn on_sending_done(
        &mut self,
        envelope: &Envelope,
        status: DeliveryStatus,
        timestamp_adj: Option<i64>,
    ) {
        let timestamp = envelope.timestamp();
        self.delivery
            .on_sending_done(timestamp, status, timestamp_adj);
        let Ok((conversation, index)) = self.chats.locate(envelope) else {
            return;
        };
        let Some(chat) = self.chats.get_mut(&conversation) else {
            return;
        };

        if status == DeliveryStatus::SendFailed {
            if self.current.as_deref() != Some(conversation.as_str()) {
                tracing::info!(%conversation, "marking conversation with a failed send");
                self.send_failed.insert(conversation.clone());
            }
            let text = chat
                .get(index)
                .and_then(Message::text)
                .map(|t| shorten(t, 20))
                .unwrap_or_default();
            self.set_status(format!("Message \"{text}\" failed to send."));
            return;
        }

        let final_timestamp = match timestamp_adj {
            Some(adj) => {
                chat.adjust_timestamp(index, adj);
                adj
            }
            None => timestamp,
        };
        self.delivery.process_buffered_receipts(final_timestamp);
    }

    pub fn on_sending_reaction_done(
        &mut self,
        envelope: &Envelope,
        status: DeliveryStatus,
        timestamp_adj: Option<i64>,
    ) {
        let status = match status {
            DeliveryStatus::Sent => DeliveryStatus::IgnoreReceipts,
            other => other,
        };
        self.delivery
            .on_sending_done(envelope.timestamp(), status, timestamp_adj);
        if status != DeliveryStatus::SendFailed {
            return;
        }
        let mut rollback = envelope.clone();
        let Some(reaction) = rollback.reaction_mut() else {
            return;
        };
        self.notices.push(Notice::Status(format!(
            "Reaction \"{}\" failed to send.",
            reaction.emoji
        )));
        reaction.is_remove = true;
        self.chats.add_reaction_envelope(rollback);
    }

    /// The remote-delete marker is shown as soon as the delete is sent.
    pub fn on_sending_remote_delete(&mut self, envelope: Envelope) {
        self.chats.add_remote_delete_envelope(envelope);
    }

    pub fn on_sending_remote_delete_done(&mut self, envelope: &Envelope, status: DeliveryStatus) {
        if status != DeliveryStatus::SendFailed {
            return;
        }
        self.set_status("Sending remote delete message failed.");
        self.chats.clear_remote_delete(envelope);
    }

    /// Returns `true` when the sender is unknown and the contacts list
    /// should be reloaded before the message can be placed.
    pub fn on_receive_message(&mut self, envelope: Envelope) -> bool {
        if self.contacts.contains(envelope.conversation_id()) {
            self.process_message(envelope);
            return false;
        }
        tracing::info!(sender = envelope.sender(), "message from unknown contact");
        self.pending_unknown.push(envelope);
        true
    }

    pub fn on_receive_sync_message(&mut self, envelope: Envelope) {
        let sent = envelope.clone();
        self.on_sending_message(envelope);
        self.on_sending_done(&sent, DeliveryStatus::Sent, None);
    }

    pub fn on_receive_receipt(&mut self, envelope: &Envelope) {
        if let Some(receipt) = envelope.receipt_message.as_ref() {
            self.delivery.on_receive_receipt(envelope.sender(), receipt);
        }
    }

    pub fn on_receive_reaction(&mut self, envelope: Envelope) {
        let outgoing = envelope.is_outgoing();
        let emoji = envelope
            .reaction()
            .map(|r| r.emoji.clone())
            .unwrap_or_default();
        let sender = envelope.sender().to_string();
        let found = self.chats.add_reaction_envelope(envelope);
        if outgoing {
            return;
        }
        if let Some(msg_ref) = found {
            let increment = self.notify_on_reactions;
            self.on_new_message(&msg_ref, &sender, format!("reacted {emoji}"), increment);
        }
    }

    pub fn on_contact_typing(&mut self, envelope: Envelope) {
        self.typing.on_typing_message(&mut self.chats, envelope);
    }

    /// Drop typing indicators that have run out.
    pub fn expire_typing(&mut self, now: tokio::time::Instant) -> Vec<String> {
        self.typing.expire(&mut self.chats, now)
    }

    pub fn on_call_message(&mut self, envelope: Envelope) {
        let Some(call) = envelope.call_message.as_ref() else {
            return;
        };
        let is_offer = call.get("offerMessage").is_some();
        let shown = is_offer
            || call.get("answerMessage").is_some()
            || call
                .pointer("/hangupMessage/type")
                .and_then(|t| t.as_str())
                == Some("NORMAL");
        if !shown {
            return;
        }
        let sender = envelope.sender().to_string();
        let msg_ref = self.chats.add_envelope(envelope);
        if is_offer {
            self.on_new_message(&msg_ref, &sender, "[incoming call]".into(), true);
        }
    }

    pub fn on_remote_delete(&mut self, envelope: Envelope) {
        self.chats.add_remote_delete_envelope(envelope);
    }

    pub fn on_receive_sticker(&mut self, envelope: Envelope) {
        let sender = envelope.sender().to_string();
        let msg_ref = self.chats.add_envelope(envelope);
        self.on_new_message(&msg_ref, &sender, "[sticker]".into(), true);
    }

    /// A message could not be sent to, or received from, a contact whose
    /// safety number changed.
    pub fn on_untrusted_identity(&mut self, mut envelope: Envelope) {
        if let Some(target) = envelope.target.as_deref() {
            self.set_status(format!(
                "Contact's safety number has changed: {target} (they might have reinstalled signal). \
                 Run `signal-cli trust …` to resolve."
            ));
            return;
        }
        let text = format!(
            "Message not decrypted: safety number with {} has changed",
            envelope.source
        );
        envelope.data_message = Some(DataMessage {
            message: Some(format!("[{text}]")),
            ..Default::default()
        });
        envelope.received_timestamp = Some(now_ms());
        envelope.artificial = Some(UNTRUSTED_IDENTITY_MARKER.to_string());
        let sender = envelope.sender().to_string();
        let msg_ref = self.chats.add_envelope(envelope);
        self.on_new_message(&msg_ref, &sender, format!("[{text}]"), true);
        self.set_status(format!(
            "{text} (they might have reinstalled signal).\nRun `signal-cli trust …` to resolve."
        ));
    }

    pub fn on_user_unregistered(&mut self, envelope: &Envelope) {
        let target = envelope.target.as_deref().unwrap_or_default();
        self.set_status(format!(
            "Contact {target} has unregistered. Can not send messages until they re-register."
        ));
    }

    /// Install a freshly loaded contacts list, then place any messages that
    /// were waiting on it.
    pub fn on_contacts_loaded(
        &mut self,
        individuals: BTreeMap<String, Contact>,
        groups: BTreeMap<String, Contact>,
    ) {
        self.contacts.replace_individuals(individuals);
        self.contacts.add_groups(groups);
        if let Some(current) = self.current.as_deref()
            && !self.contacts.contains(current)
            && self.chats.get(current).is_none()
        {
            tracing::info!(conversation = current, "open conversation no longer exists");
            self.current = None;
        }
        tracing::info!(
            individuals = self.contacts.individuals().count(),
            groups = self.contacts.groups().count(),
            "contacts loaded"
        );
        for envelope in std::mem::take(&mut self.pending_unknown) {
            if self.contacts.contains(envelope.conversation_id()) {
                self.process_message(envelope);
            } else {
                self.accept_unknown(envelope);
            }
        }
    }

    fn process_message(&mut self, envelope: Envelope) {
        self.typing.remove(&mut self.chats, envelope.sender());
        let sender = envelope.sender().to_string();
        let summary = summarize(&envelope);
        let msg_ref = self.chats.add_envelope(envelope);
        self.on_new_message(&msg_ref, &sender, summary, true);
    }

    /// Still unknown after a reload: keep the message under a temporary
    /// contact so it is not lost.
    fn accept_unknown(&mut self, mut envelope: Envelope) {
        tracing::error!(sender = envelope.sender(), "message from unknown contact");
        let sender_info = envelope
            .source_name
            .clone()
            .unwrap_or_else(|| format!("UUID: {}", envelope.conversation_id()));
        let text = envelope.text().unwrap_or_default().to_string();
        self.set_status(format!(
            "Message from an unknown chat: {sender_info:?}\n{text:?}\n\
             Accept this contact on the primary device first."
        ));
        self.contacts.insert_unknown(&envelope);
        if let Some(message) = envelope
            .data_message
            .as_mut()
            .and_then(|d| d.message.as_mut())
        {
            message.push_str(UNKNOWN_CONTACT_NOTE);
        }
        let conversation = envelope.conversation_id().to_string();
        self.chats.add_envelope(envelope);
        self.unread.increment(&conversation);
    }

    fn on_new_message(
        &mut self,
        msg_ref: &MessageRef,
        sender: &str,
        summary: String,
        increment_unread: bool,
    ) {
        let conversation = &msg_ref.conversation;
        if self.current.as_deref() != Some(conversation.as_str()) && increment_unread {
            self.unread.increment(conversation);
        }
        self.notices.push(Notice::NewMessage {
            conversation: conversation.clone(),
            sender: sender.to_string(),
            summary,
        });
    }
}

/// One-line description of an envelope's payload.
pub(crate) fn summarize(envelope: &Envelope) -> String {
    if let Some(text) = envelope.text() {
        return text.lines().next().unwrap_or_default().to_string();
    }
    let names: Vec<String> = envelope.attachments().iter().map(|a| a.name()).collect();
    if names.is_empty() {
        String::new()
    } else {
        format!("[attached: {}]", names.join(", "))
    }
}

/// Collapse whitespace and cut `text` at a word boundary so it fits in
/// `width` characters, marking the cut with `[...]`.
fn shorten(text: &str, width: usize) -> String {
    const PLACEHOLDER: &str = " [...]";
    let words: Vec<&str> = text.split_whitespace().collect();
    let full = words.join(" ");
    if full.chars().count() <= width {
        return full;
    }
    let mut out = String::new();
    for word in words {
        let extra = if out.is_empty() { 0 } else { 1 } + word.chars().count();
        if out.chars().count() + extra + PLACEHOLDER.len() > width {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    if out.is_empty() {
        PLACEHOLDER.trim_start().to_string()
    } else {
        out + PLACEHOLDER
    }
}
