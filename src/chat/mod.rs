//! Conversations: messages grouped per contact or group, plus the delivery
//! and typing state layered on top of them.

pub mod delivery;
pub mod store;
pub mod typing;

use crate::envelope::Envelope;
use std::collections::BTreeMap;
use store::{Conversation, StoreError};

/// Message identity: who sent it and the timestamp they sent it with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub sender: String,
    pub timestamp: i64,
}

/// Where to find a message later: its conversation, identity and the
/// ordering key it was stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub conversation: String,
    pub id: MessageId,
    pub key: i64,
}

/// One envelope plus the reactions and remote delete that refer to it.
#[derive(Debug, Clone)]
pub struct Message {
    pub envelope: Envelope,
    /// Latest reaction per sender, oldest first.
    reactions: Vec<Envelope>,
    remote_delete: Option<Envelope>,
}

impl Message {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            reactions: Vec::new(),
            remote_delete: None,
        }
    }

    pub fn id(&self) -> MessageId {
        MessageId {
            sender: self.sender().to_string(),
            timestamp: self.timestamp(),
        }
    }

    pub fn sender(&self) -> &str {
        self.envelope.sender()
    }

    pub fn timestamp(&self) -> i64 {
        self.envelope.timestamp()
    }

    pub fn ordering_key(&self) -> i64 {
        self.envelope.ordering_key()
    }

    pub fn conversation_id(&self) -> &str {
        self.envelope.conversation_id()
    }

    pub fn text(&self) -> Option<&str> {
        self.envelope.text()
    }

    pub fn reactions(&self) -> &[Envelope] {
        &self.reactions
    }

    /// Record `envelope` as its sender's reaction, replacing any earlier
    /// one. A removal drops that sender's reaction.
    pub fn add_reaction(&mut self, envelope: Envelope) {
        let sender = envelope.sender().to_string();
        self.reactions.retain(|r| r.sender() != sender);
        if envelope.reaction().is_some_and(|r| !r.is_remove) {
            self.reactions.push(envelope);
        }
    }

    pub fn remote_delete(&self) -> Option<&Envelope> {
        self.remote_delete.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.remote_delete.is_some()
    }

    /// Typing indicators, calls and deleted messages cannot be replied to.
    pub fn not_repliable(&self) -> bool {
        self.envelope.is_typing() || self.envelope.call_message.is_some() || self.is_deleted()
    }
}

/// All conversations, keyed by contact number or group id.
#[derive(Debug, Default)]
pub struct Conversations {
    chats: BTreeMap<String, Conversation>,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation: &str) -> Option<&Conversation> {
        self.chats.get(conversation)
    }

    pub fn get_mut(&mut self, conversation: &str) -> Option<&mut Conversation> {
        self.chats.get_mut(conversation)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.chats.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Conversation)> {
        self.chats.iter().map(|(id, c)| (id.as_str(), c))
    }

    /// Total messages across every conversation.
    pub fn message_count(&self) -> usize {
        self.chats.values().map(Conversation::len).sum()
    }

    /// Store `envelope` as a new message in its conversation.
    pub fn add_envelope(&mut self, envelope: Envelope) -> MessageRef {
        let msg = Message::new(envelope);
        let msg_ref = MessageRef {
            conversation: msg.conversation_id().to_string(),
            id: msg.id(),
            key: msg.ordering_key(),
        };
        self.chats
            .entry(msg_ref.conversation.clone())
            .or_default()
            .add(msg);
        msg_ref
    }

    pub fn message(&self, msg_ref: &MessageRef) -> Option<&Message> {
        let chat = self.chats.get(&msg_ref.conversation)?;
        let index = chat.position(&msg_ref.id, msg_ref.key).ok()?;
        chat.get(index)
    }

    /// Locate the stored message corresponding to `envelope`.
    pub fn locate(&self, envelope: &Envelope) -> Result<(String, usize), StoreError> {
        let conversation = envelope.conversation_id();
        let msg = Message::new(envelope.clone());
        let not_found = || StoreError::NotFound {
            sender: Some(msg.sender().to_string()),
            timestamp: msg.timestamp(),
        };
        let chat = self.chats.get(conversation).ok_or_else(not_found)?;
        let index = chat.index_of(&msg).inspect_err(|e| {
            tracing::error!(error = %e, conversation, "no stored message for envelope");
        })?;
        Ok((conversation.to_string(), index))
    }

    /// Attach a reaction to the message it targets. Returns that message, or
    /// `None` (after logging) when the target is unknown.
    pub fn add_reaction_envelope(&mut self, envelope: Envelope) -> Option<MessageRef> {
        let reaction = envelope.reaction()?;
        let (timestamp, author) = (reaction.target_sent_timestamp, reaction.target_author.clone());
        let conversation = envelope.conversation_id().to_string();
        let Some(msg) = self.find_mut(&conversation, timestamp, Some(&author)) else {
            tracing::error!(%conversation, timestamp, %author, "message not found for reaction");
            return None;
        };
        msg.add_reaction(envelope);
        Some(msg_ref(&conversation, msg))
    }

    /// Mark the targeted message as remotely deleted.
    pub fn add_remote_delete_envelope(&mut self, envelope: Envelope) -> Option<MessageRef> {
        let timestamp = envelope.remote_delete()?.timestamp;
        let sender = envelope.sender().to_string();
        let conversation = envelope.conversation_id().to_string();
        let Some(msg) = self.find_mut(&conversation, timestamp, Some(&sender)) else {
            tracing::error!(
                %conversation,
                timestamp,
                %sender,
                "message not found for remote delete"
            );
            return None;
        };
        msg.remote_delete = Some(envelope);
        Some(msg_ref(&conversation, msg))
    }

    /// Undo a local remote-delete marker after the delete failed to send.
    pub fn clear_remote_delete(&mut self, envelope: &Envelope) -> Option<MessageRef> {
        let timestamp = envelope.remote_delete()?.timestamp;
        let conversation = envelope.conversation_id().to_string();
        let msg = self.find_mut(&conversation, timestamp, Some(envelope.sender()))?;
        msg.remote_delete = None;
        Some(msg_ref(&conversation, msg))
    }

    pub fn delete_message(&mut self, msg_ref: &MessageRef) -> Result<Message, StoreError> {
        let not_found = || StoreError::NotFound {
            sender: Some(msg_ref.id.sender.clone()),
            timestamp: msg_ref.id.timestamp,
        };
        let chat = self
            .chats
            .get_mut(&msg_ref.conversation)
            .ok_or_else(not_found)?;
        let index = chat.position(&msg_ref.id, msg_ref.key)?;
        Ok(chat.remove_at(index))
    }

    /// Every envelope worth persisting: messages, then their reactions and
    /// remote deletes. Typing indicators and local placeholders are skipped.
    pub fn serialize(&self) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        for msg in self.chats.values().flat_map(Conversation::iter) {
            if msg.envelope.is_ephemeral() {
                continue;
            }
            envelopes.push(msg.envelope.clone());
            envelopes.extend(msg.reactions.iter().cloned());
            envelopes.extend(msg.remote_delete.iter().cloned());
        }
        envelopes
    }

    fn find_mut(
        &mut self,
        conversation: &str,
        timestamp: i64,
        sender: Option<&str>,
    ) -> Option<&mut Message> {
        let chat = self.chats.get_mut(conversation)?;
        let index = chat.lookup(timestamp, sender).ok()?;
        chat.get_mut(index)
    }
}

fn msg_ref(conversation: &str, msg: &Message) -> MessageRef {
    MessageRef {
        conversation: conversation.to_string(),
        id: msg.id(),
        key: msg.ordering_key(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{DataMessage, Reaction, RemoteDelete};

    const ME: &str = "+15555550000";
    const BOB: &str = "+15555550001";

    fn inbound(ts: i64, text: &str) -> Envelope {
        Envelope {
            source: BOB.into(),
            source_number: Some(BOB.into()),
            timestamp: Some(ts),
            received_timestamp: Some(ts + 5),
            data_message: Some(DataMessage {
                timestamp: Some(ts),
                message: Some(text.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn reaction_from(sender: &str, emoji: &str, target_ts: i64, remove: bool) -> Envelope {
        Envelope {
            source: sender.into(),
            source_number: Some(sender.into()),
            timestamp: Some(target_ts + 100),
            data_message: Some(DataMessage {
                reaction: Some(Reaction {
                    emoji: emoji.into(),
                    is_remove: remove,
                    target_author: BOB.into(),
                    target_sent_timestamp: target_ts,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn reactions_replace_per_sender_and_removal_drops() {
        let mut chats = Conversations::new();
        let r = chats.add_envelope(inbound(1000, "hello"));
        assert_eq!(r.conversation, BOB);

        assert!(chats.add_reaction_envelope(reaction_from(BOB, "👍", 1000, false)).is_some());
        assert!(chats.add_reaction_envelope(reaction_from(BOB, "🎉", 1000, false)).is_some());
        let msg = chats.message(&r).unwrap();
        assert_eq!(msg.reactions().len(), 1);
        assert_eq!(msg.reactions()[0].reaction().unwrap().emoji, "🎉");

        chats.add_reaction_envelope(reaction_from(BOB, "🎉", 1000, true));
        assert!(chats.message(&r).unwrap().reactions().is_empty());
    }

    #[test]
    fn reaction_to_unknown_message_is_dropped() {
        let mut chats = Conversations::new();
        chats.add_envelope(inbound(1000, "hello"));
        assert!(chats.add_reaction_envelope(reaction_from(BOB, "👍", 999, false)).is_none());
    }

    #[test]
    fn remote_delete_marks_and_clears() {
        let mut chats = Conversations::new();
        let r = chats.add_envelope(inbound(1000, "oops"));
        let delete = Envelope {
            source: BOB.into(),
            source_number: Some(BOB.into()),
            timestamp: Some(2000),
            data_message: Some(DataMessage {
                remote_delete: Some(RemoteDelete { timestamp: 1000 }),
                ..Default::default()
            }),
            ..Default::default()
        };
        chats.add_remote_delete_envelope(delete.clone()).unwrap();
        assert!(chats.message(&r).unwrap().is_deleted());
        assert!(chats.message(&r).unwrap().not_repliable());

        // Serialized after the message it deletes.
        let saved = chats.serialize();
        assert_eq!(saved.len(), 2);
        assert!(saved[1].remote_delete().is_some());

        chats.clear_remote_delete(&delete).unwrap();
        assert!(!chats.message(&r).unwrap().is_deleted());
    }

    #[test]
    fn outgoing_envelope_goes_to_target_conversation() {
        let mut chats = Conversations::new();
        let env = Envelope::outgoing(ME, BOB, 5000, DataMessage::default());
        let r = chats.add_envelope(env.clone());
        assert_eq!(r.conversation, BOB);
        assert_eq!(chats.locate(&env).unwrap(), (BOB.to_string(), 0));
        chats.delete_message(&r).unwrap();
        assert_eq!(chats.message_count(), 0);
    }
}
