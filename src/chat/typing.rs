//! Typing indicators.
//!
//! A "started typing" event is shown as a temporary message in the sender's
//! conversation. It disappears when the sender stops typing, sends a real
//! message, or after a fixed time without a refresh.

use super::{Conversations, MessageRef};
use crate::envelope::{Envelope, TypingAction};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Indicator {
    message: MessageRef,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct TypingIndicators {
    ttl: Duration,
    active: HashMap<String, Indicator>,
}

impl Default for TypingIndicators {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl TypingIndicators {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            active: HashMap::new(),
        }
    }

    pub fn is_typing(&self, sender: &str) -> bool {
        self.active.contains_key(sender)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn on_typing_message(&mut self, chats: &mut Conversations, envelope: Envelope) {
        let sender = envelope.sender().to_string();
        let Some(action) = envelope.typing_message.as_ref().map(|t| t.action) else {
            return;
        };
        self.remove(chats, &sender);
        match action {
            TypingAction::Started => {
                let message = chats.add_envelope(envelope);
                self.active.insert(
                    sender,
                    Indicator {
                        message,
                        expires_at: Instant::now() + self.ttl,
                    },
                );
            }
            TypingAction::Stopped => {}
            TypingAction::Unknown => {
                tracing::warn!(%sender, "unknown typing action");
            }
        }
    }

    /// Drop `sender`'s indicator, if shown.
    pub fn remove(&mut self, chats: &mut Conversations, sender: &str) -> bool {
        let Some(indicator) = self.active.remove(sender) else {
            return false;
        };
        if let Err(e) = chats.delete_message(&indicator.message) {
            tracing::warn!(error = %e, sender, "typing indicator already gone");
        }
        true
    }

    /// When the next indicator runs out.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.active.values().map(|i| i.expires_at).min()
    }

    /// Remove every indicator that has run out by `now`; returns their
    /// senders.
    pub fn expire(&mut self, chats: &mut Conversations, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, i)| i.expires_at <= now)
            .map(|(sender, _)| sender.clone())
            .collect();
        for sender in &expired {
            self.remove(chats, sender);
        }
        expired
    }
}
