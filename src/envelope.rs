//! Envelope type: one decoded event from the signal-cli daemon.
//!
//! The struct mirrors the daemon's JSON closely. Fields the client never
//! looks at are kept in `extra` maps so an envelope written to history and
//! read back is unchanged.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

static PHONE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9][0-9]{6,14}$").expect("valid regex"));

/// Whether `id` is an E.164 phone number (as opposed to a group id).
pub fn is_number(id: &str) -> bool {
    PHONE_NUMBER.is_match(id)
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Marker for envelopes synthesized locally when an incoming message could
/// not be decrypted.
pub const UNTRUSTED_IDENTITY_MARKER: &str = "untrustedIdentity";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    /// Recipient of a locally sent envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_message: Option<DataMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_message: Option<SyncMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_message: Option<ReceiptMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing_message: Option<TypingMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_message: Option<Value>,
    /// Local receive time, stamped when the envelope arrives on stdout.
    #[serde(
        rename = "_received_timestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub received_timestamp: Option<i64>,
    #[serde(
        rename = "_artificialEnvelope",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub artificial: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_delete: Option<RemoteDelete>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticker: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_info: Option<GroupInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Received attachments are described by the daemon; outgoing ones are
/// plain local paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attachment {
    Local(String),
    Received(ReceivedAttachment),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Attachment {
    /// File name for display: the given filename, else the content type,
    /// else the last path component.
    pub fn name(&self) -> String {
        match self {
            Self::Local(path) => std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.clone()),
            Self::Received(a) => a
                .filename
                .clone()
                .filter(|f| !f.is_empty())
                .or_else(|| a.content_type.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    #[serde(default)]
    pub is_remove: bool,
    pub target_author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_author_number: Option<String>,
    pub target_sent_timestamp: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteDelete {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_message: Option<SentMessage>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A message sent from another linked device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(flatten)]
    pub data: DataMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptMessage {
    #[serde(default)]
    pub when: Option<i64>,
    #[serde(default)]
    pub is_delivery: bool,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_viewed: bool,
    #[serde(default)]
    pub timestamps: Vec<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TypingAction {
    Started,
    Stopped,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingMessage {
    pub action: TypingAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload kind, in the priority order the daemon's events are tested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Text or attachments sent from another linked device.
    SyncSent,
    /// Inbound text or attachments.
    Message,
    Receipt,
    Typing,
    Reaction,
    Call,
    /// Contacts or groups changed (sync markers, group `UPDATE`).
    ContactsSync,
    RemoteDelete,
    Sticker,
    None,
}

impl Envelope {
    /// Envelope for something this client is about to send.
    pub fn outgoing(source: &str, target: &str, timestamp: i64, mut data: DataMessage) -> Self {
        data.timestamp = Some(timestamp);
        if !is_number(target) {
            data.group_info = Some(GroupInfo {
                group_id: Some(target.to_string()),
                ..Default::default()
            });
        }
        Self {
            source: source.to_string(),
            target: Some(target.to_string()),
            timestamp: Some(timestamp),
            data_message: Some(data),
            ..Default::default()
        }
    }

    /// Both places message data can live: inbound `dataMessage` first, then
    /// a sync-sent message.
    fn data(&self) -> impl Iterator<Item = &DataMessage> {
        self.data_message.iter().chain(
            self.sync_message
                .as_ref()
                .and_then(|s| s.sent_message.as_ref())
                .map(|s| &s.data),
        )
    }

    pub fn sent_message(&self) -> Option<&SentMessage> {
        self.sync_message.as_ref()?.sent_message.as_ref()
    }

    /// Sender-assigned timestamp.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
            .filter(|ts| *ts != 0)
            .or_else(|| self.data().find_map(|d| d.timestamp.filter(|ts| *ts != 0)))
            .unwrap_or(0)
    }

    /// Replace the sender timestamp everywhere it is recorded.
    pub fn set_timestamp(&mut self, ts: i64) {
        self.timestamp = Some(ts);
        if let Some(data) = self.data_message.as_mut() {
            data.timestamp = Some(ts);
        } else if let Some(sent) = self
            .sync_message
            .as_mut()
            .and_then(|s| s.sent_message.as_mut())
        {
            sent.data.timestamp = Some(ts);
        }
    }

    /// Receive time if known, else the sender timestamp.
    pub fn ordering_key(&self) -> i64 {
        self.received_timestamp
            .filter(|ts| *ts != 0)
            .unwrap_or_else(|| self.timestamp())
    }

    pub fn sender(&self) -> &str {
        &self.source
    }

    /// The conversation this envelope belongs to: a phone number or a
    /// group id.
    pub fn conversation_id(&self) -> &str {
        self.target
            .as_deref()
            .or_else(|| self.group_id())
            .or_else(|| self.sent_message().and_then(|s| s.destination.as_deref()))
            .or_else(|| {
                self.typing_message
                    .as_ref()
                    .and_then(|t| t.group_id.as_deref())
            })
            .or(self.source_number.as_deref())
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.source)
    }

    pub fn group_id(&self) -> Option<&str> {
        self.data()
            .find_map(|d| d.group_info.as_ref()?.group_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn is_outgoing(&self) -> bool {
        self.target.is_some()
            || self.sent_message().is_some()
            || self
                .call_message
                .as_ref()
                .is_some_and(|c| c.get("answerMessage").is_some_and(|a| !a.is_null()))
    }

    pub fn is_group(&self) -> bool {
        self.data().any(|d| d.group_info.is_some())
            || self.target.as_deref().is_some_and(|t| !is_number(t))
            || self
                .typing_message
                .as_ref()
                .is_some_and(|t| t.group_id.is_some())
    }

    /// Message text, if the envelope carries any.
    pub fn text(&self) -> Option<&str> {
        self.data()
            .find_map(|d| d.message.as_deref())
            .filter(|m| !m.is_empty())
    }

    pub fn attachments(&self) -> &[Attachment] {
        self.data()
            .map(|d| d.attachments.as_slice())
            .find(|a| !a.is_empty())
            .unwrap_or_default()
    }

    pub fn reaction(&self) -> Option<&Reaction> {
        self.data().find_map(|d| d.reaction.as_ref())
    }

    pub fn reaction_mut(&mut self) -> Option<&mut Reaction> {
        if let Some(r) = self.data_message.as_mut().and_then(|d| d.reaction.as_mut()) {
            return Some(r);
        }
        self.sync_message
            .as_mut()?
            .sent_message
            .as_mut()?
            .data
            .reaction
            .as_mut()
    }

    pub fn remote_delete(&self) -> Option<&RemoteDelete> {
        self.data().find_map(|d| d.remote_delete.as_ref())
    }

    pub fn sticker(&self) -> Option<&Value> {
        self.data().find_map(|d| d.sticker.as_ref().filter(|s| !s.is_null()))
    }

    pub fn is_typing(&self) -> bool {
        self.typing_message.is_some()
    }

    pub fn is_untrusted_placeholder(&self) -> bool {
        self.artificial.as_deref() == Some(UNTRUSTED_IDENTITY_MARKER)
    }

    /// Typing indicators and locally synthesized placeholders are never
    /// written to history.
    pub fn is_ephemeral(&self) -> bool {
        self.is_typing() || self.is_untrusted_placeholder()
    }

    fn is_contacts_sync(&self) -> bool {
        let sync_marker = self
            .sync_message
            .as_ref()
            .and_then(|s| s.kind.as_deref())
            .is_some_and(|k| k == "CONTACTS_SYNC" || k == "GROUPS_SYNC");
        sync_marker
            || self
                .data()
                .find_map(|d| d.group_info.as_ref()?.kind.as_deref())
                .is_some_and(|k| k == "UPDATE")
    }

    pub fn kind(&self) -> EnvelopeKind {
        if self.text().is_some() || !self.attachments().is_empty() {
            if self.sent_message().is_some() {
                EnvelopeKind::SyncSent
            } else {
                EnvelopeKind::Message
            }
        } else if self.receipt_message.is_some() {
            EnvelopeKind::Receipt
        } else if self.typing_message.is_some() {
            EnvelopeKind::Typing
        } else if self.reaction().is_some() {
            EnvelopeKind::Reaction
        } else if self.call_message.as_ref().is_some_and(|c| !c.is_null()) {
            EnvelopeKind::Call
        } else if self.is_contacts_sync() {
            EnvelopeKind::ContactsSync
        } else if self.remote_delete().is_some() {
            EnvelopeKind::RemoteDelete
        } else if self.sticker().is_some() {
            EnvelopeKind::Sticker
        } else {
            EnvelopeKind::None
        }
    }
}
