//! Per-conversation message sequence, kept sorted by ordering key.
//!
//! Messages are ordered by receive time when it is known, else by the
//! sender's timestamp. The two clocks disagree, so a message's position can
//! imply a different timestamp than the one a reaction or remote delete will
//! later refer to it by. Whenever an insertion reveals such a straddle, the
//! correction `(sender, sent timestamp) -> receive time` is recorded so
//! identity lookups can still seek to the right place.

use super::{Message, MessageId};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("message not found: timestamp {timestamp} from {}", sender.as_deref().unwrap_or("anyone"))]
    NotFound {
        sender: Option<String>,
        timestamp: i64,
    },
}

impl StoreError {
    fn not_found(sender: Option<&str>, timestamp: i64) -> Self {
        Self::NotFound {
            sender: sender.map(str::to_string),
            timestamp,
        }
    }
}

#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    /// (sender, sent timestamp) -> corrected ordering key.
    corrections: HashMap<(String, i64), i64>,
    /// (sender, timestamp before adjustment) -> adjusted timestamp.
    adjusted: HashMap<(String, i64), i64>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Message> {
        self.messages.get_mut(index)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    /// Corrected ordering key recorded for a message, if any.
    pub fn correction(&self, sender: &str, timestamp: i64) -> Option<i64> {
        self.corrections
            .get(&(sender.to_string(), timestamp))
            .copied()
    }

    pub fn corrections_len(&self) -> usize {
        self.corrections.len()
    }

    /// Insert keeping the sequence sorted; returns the new message's index.
    /// Equal keys keep arrival order.
    pub fn add(&mut self, msg: Message) -> usize {
        let Some(last) = self.messages.last() else {
            self.messages.push(msg);
            return 0;
        };

        let index = if last.ordering_key() <= msg.ordering_key() {
            self.messages.push(msg);
            self.messages.len() - 1
        } else {
            let key = msg.ordering_key();
            let index = self.messages.partition_point(|m| m.ordering_key() <= key);
            self.messages.insert(index, msg);
            index
        };
        self.record_neighbor_corrections(index);
        index
    }

    /// Position of the message with identity `id` whose current ordering key
    /// is `key`.
    pub fn position(&self, id: &MessageId, key: i64) -> Result<usize, StoreError> {
        let not_found = || StoreError::not_found(Some(&id.sender), id.timestamp);
        let last = self.messages.last().ok_or_else(not_found)?;
        if last.id() == *id {
            return Ok(self.messages.len() - 1);
        }
        let start = self.messages.partition_point(|m| m.ordering_key() < key);
        self.messages[start..]
            .iter()
            .take_while(|m| m.ordering_key() == key)
            .position(|m| m.id() == *id)
            .map(|offset| start + offset)
            .ok_or_else(not_found)
    }

    pub fn index_of(&self, msg: &Message) -> Result<usize, StoreError> {
        self.position(&msg.id(), msg.ordering_key())
    }

    /// Find a message by its sent timestamp (and sender, when given). Used
    /// for reactions, remote deletes and receipts, which only know the
    /// sender's timestamp.
    ///
    /// A message whose timestamp was adjusted after sending is still found
    /// by the timestamp it was created with.
    pub fn lookup(&self, timestamp: i64, sender: Option<&str>) -> Result<usize, StoreError> {
        let mut result = self.lookup_exact(timestamp, sender);
        let Some(sender) = sender else {
            return result;
        };
        let mut timestamp = timestamp;
        // Bounded so that an alias cycle cannot loop forever.
        for _ in 0..self.adjusted.len() {
            if result.is_ok() {
                break;
            }
            let Some(&next) = self.adjusted.get(&(sender.to_string(), timestamp)) else {
                break;
            };
            timestamp = next;
            result = self.lookup_exact(timestamp, Some(sender));
        }
        result
    }

    fn lookup_exact(&self, timestamp: i64, sender: Option<&str>) -> Result<usize, StoreError> {
        let matches = |m: &Message| {
            m.timestamp() == timestamp && sender.is_none_or(|s| m.sender() == s)
        };
        let not_found = || StoreError::not_found(sender, timestamp);

        let last = self.messages.last().ok_or_else(not_found)?;
        if matches(last) {
            return Ok(self.messages.len() - 1);
        }

        let key = sender
            .and_then(|s| self.correction(s, timestamp))
            .unwrap_or(timestamp);
        let index = self.messages.partition_point(|m| m.ordering_key() < key);
        if index == self.messages.len() {
            return Err(not_found());
        }

        // Most likely first: the bisection point, the one before it (its
        // receive time may precede `timestamp`), then same-key messages from
        // other senders after it.
        let before = index.checked_sub(1);
        let candidates = std::iter::once(index)
            .chain(before)
            .chain(index + 1..self.messages.len());
        for ind in candidates {
            let msg = &self.messages[ind];
            if matches(msg) {
                return Ok(ind);
            }
            if ind > index && msg.ordering_key() > key {
                break;
            }
        }
        Err(not_found())
    }

    /// Remove `msg`. A known `hint` index skips the search when it points at
    /// the right message.
    pub fn delete(&mut self, msg: &Message, hint: Option<usize>) -> Result<Message, StoreError> {
        let index = match hint {
            Some(i) if self.messages.get(i).is_some_and(|m| m.id() == msg.id()) => i,
            _ => self.index_of(msg).inspect_err(|e| {
                tracing::warn!(error = %e, "delete: message not in conversation");
            })?,
        };
        Ok(self.remove_at(index))
    }

    /// Remove the message at `index` and repair the corrections around the
    /// gap it leaves.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove_at(&mut self, index: usize) -> Message {
        let removed = self.messages.remove(index);
        self.forget_corrections_after_removal(&removed, index);
        let target = removed.timestamp();
        self.adjusted
            .retain(|(sender, _), ts| !(*ts == target && sender == removed.sender()));
        removed
    }

    /// Change the sent timestamp of the message at `index`, relocating it if
    /// its neighbours are no longer in order. Returns its new index.
    pub fn adjust_timestamp(&mut self, index: usize, timestamp: i64) -> usize {
        let Some(msg) = self.messages.get_mut(index) else {
            return index;
        };
        let original = msg.timestamp();
        let sender = msg.sender().to_string();
        msg.envelope.set_timestamp(timestamp);
        let index = if self.is_locally_sorted(index) {
            index
        } else {
            tracing::debug!(timestamp, "relocating message to keep conversation sorted");
            let msg = self.remove_at(index);
            self.add(msg)
        };
        if original != timestamp {
            self.adjusted.insert((sender, original), timestamp);
        }
        index
    }

    fn is_locally_sorted(&self, index: usize) -> bool {
        let key = self.messages[index].ordering_key();
        let prev_ok = index
            .checked_sub(1)
            .and_then(|i| self.messages.get(i))
            .is_none_or(|prev| prev.ordering_key() <= key);
        let next_ok = self
            .messages
            .get(index + 1)
            .is_none_or(|next| key <= next.ordering_key());
        prev_ok && next_ok
    }

    /// Check the pairs adjacent to `index` for a message whose ordering key
    /// lies between its neighbour's sent and receive times.
    fn record_neighbor_corrections(&mut self, index: usize) {
        let len = self.messages.len();
        if len < 2 {
            return;
        }
        let pairs: &[(usize, usize)] = if index + 1 >= len {
            &[(len - 2, len - 1)]
        } else if index == 0 {
            &[(0, 1)]
        } else {
            &[(index - 1, index), (index, index + 1)]
        };
        for &(pre, post) in pairs {
            self.check_straddle(pre, post, true);
            self.check_straddle(post, pre, false);
        }
    }

    /// `received` carries both timestamps; `local` is its neighbour. When
    /// `received` sorts after `local` the interval is (sent, received],
    /// otherwise [received, sent).
    fn check_straddle(&mut self, local: usize, received: usize, received_is_later: bool) {
        let received_msg = &self.messages[received];
        let Some(received_ts) = received_msg.envelope.received_timestamp else {
            return;
        };
        let original_ts = received_msg.timestamp();
        let (left, right) = if received_is_later {
            (original_ts, received_ts)
        } else {
            (received_ts, original_ts)
        };
        let local_key = self.messages[local].ordering_key();
        if left <= local_key && local_key <= right {
            let sender = received_msg.sender().to_string();
            self.corrections.insert((sender, original_ts), received_ts);
        }
    }

    /// Drop corrections that involved the removed message's former
    /// neighbours and recompute them for the pair that is now adjacent.
    /// Only the left-side neighbours are cleared; the right-hand one keeps
    /// whatever it had.
    fn forget_corrections_after_removal(&mut self, removed: &Message, index: usize) {
        self.corrections
            .remove(&(removed.sender().to_string(), removed.timestamp()));

        let len = self.messages.len();
        let (anchor, neighbors): (usize, Vec<usize>) = if index >= len {
            (len.saturating_sub(1), vec![len.saturating_sub(1)])
        } else if index == 0 {
            (0, vec![0])
        } else {
            let anchor = index - 1;
            (anchor, anchor.checked_sub(1).into_iter().chain([anchor]).collect())
        };

        let mut modified = false;
        for i in neighbors {
            let Some(neighbor) = self.messages.get(i) else {
                continue;
            };
            let key = (neighbor.sender().to_string(), neighbor.timestamp());
            if self.corrections.remove(&key).is_some() {
                modified = true;
            }
        }
        if modified {
            self.record_neighbor_corrections(anchor);
        }
    }
}

impl<'a> IntoIterator for &'a Conversation {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
