use std::collections::BTreeMap;

/// Unread message counters per conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadCounts {
    counts: BTreeMap<String, u32>,
}

impl UnreadCounts {
    pub fn from_saved(counts: BTreeMap<String, u32>) -> Self {
        Self { counts }
    }

    pub fn get(&self, conversation: &str) -> u32 {
        self.counts.get(conversation).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, conversation: &str) -> u32 {
        let count = self.counts.entry(conversation.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear(&mut self, conversation: &str) {
        self.counts.remove(conversation);
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    /// Non-zero counters only.
    pub fn serialize(&self) -> BTreeMap<String, u32> {
        self.counts
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(id, n)| (id.clone(), *n))
            .collect()
    }
}
