//! Plain-text rendering of conversations for `sigline history`.

use super::{ConversationState, summarize};
use crate::chat::Message;
use crate::chat::delivery::DeliveryStatus;
use chrono::DateTime;

fn format_time(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

/// One line per message: time, sender, content, reactions, and the
/// delivery status of outgoing messages.
pub fn format_message(msg: &Message, status: DeliveryStatus) -> String {
    let body = if msg.is_deleted() {
        "[deleted]".to_string()
    } else if msg.envelope.call_message.is_some() {
        "[call]".to_string()
    } else if msg.envelope.sticker().is_some() {
        "[sticker]".to_string()
    } else {
        summarize(&msg.envelope)
    };
    let mut line = format!(
        "{} {}: {body}",
        format_time(msg.ordering_key()),
        msg.sender()
    );
    if !msg.reactions().is_empty() {
        let reactions: Vec<String> = msg
            .reactions()
            .iter()
            .filter_map(|r| r.reaction().map(|re| format!("{} {}", re.emoji, r.sender())))
            .collect();
        line.push_str(&format!(" ({})", reactions.join(", ")));
    }
    if !matches!(status, DeliveryStatus::Unset | DeliveryStatus::ReceivedByMe) {
        line.push_str(&format!(" [{status}]"));
    }
    line
}

/// Render the last `limit` messages of each conversation, or only of
/// `conversation` when given.
pub fn render(state: &ConversationState, conversation: Option<&str>, limit: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for (id, chat) in state.chats.iter() {
        if conversation.is_some_and(|c| c != id) || chat.is_empty() {
            continue;
        }
        let name = state.contacts.get(id).map_or(id, |c| c.name_or_id());
        let unread = state.unread.get(id);
        let mut header = format!("== {name}");
        if unread > 0 {
            header.push_str(&format!(" ({unread} unread)"));
        }
        if state.has_send_failure(id) {
            header.push_str(" [send failed]");
        }
        header.push_str(" ==");
        lines.push(header);
        let skip = chat.len().saturating_sub(limit);
        for msg in chat.iter().skip(skip) {
            let status = if msg.envelope.is_outgoing() {
                state.delivery.status(msg.timestamp())
            } else {
                DeliveryStatus::Unset
            };
            lines.push(format_message(msg, status));
        }
    }
    lines
}
