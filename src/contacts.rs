//! Contacts cache: individuals and groups as reported by the daemon.

use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// An individual (keyed by `number`) or a group (keyed by `groupId`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        rename = "members_ids",
        default,
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub members_ids: BTreeSet<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Contact {
    pub fn individual(number: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            number: Some(number.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn group(group_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn id(&self) -> &str {
        self.number
            .as_deref()
            .or(self.group_id.as_deref())
            .unwrap_or_default()
    }

    pub fn is_group(&self) -> bool {
        self.group_id.is_some()
    }

    pub fn name_or_id(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.id())
    }
}

#[derive(Debug, Default)]
pub struct Contacts {
    own_number: String,
    map: BTreeMap<String, Contact>,
}

impl Contacts {
    pub fn new(own_number: impl Into<String>) -> Self {
        Self {
            own_number: own_number.into(),
            map: BTreeMap::new(),
        }
    }

    /// Restore from the history's `contacts_cache`.
    pub fn from_cache(own_number: impl Into<String>, cache: BTreeMap<String, Contact>) -> Self {
        let mut contacts = Self::new(own_number);
        contacts.map = cache;
        contacts
    }

    pub fn own_number(&self) -> &str {
        &self.own_number
    }

    pub fn get(&self, id: &str) -> Option<&Contact> {
        self.map.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn individuals(&self) -> impl Iterator<Item = &Contact> {
        self.map.values().filter(|c| !c.is_group())
    }

    pub fn groups(&self) -> impl Iterator<Item = &Contact> {
        self.map.values().filter(|c| c.is_group())
    }

    pub fn group_members(&self, group_id: &str) -> Option<&BTreeSet<String>> {
        self.map
            .get(group_id)
            .filter(|c| c.is_group())
            .map(|c| &c.members_ids)
    }

    /// Replace everything with a freshly loaded set of individuals.
    pub fn replace_individuals(&mut self, individuals: BTreeMap<String, Contact>) {
        self.map = individuals;
    }

    /// Add freshly loaded groups, dropping our own number from their
    /// member lists.
    pub fn add_groups(&mut self, groups: BTreeMap<String, Contact>) {
        for (id, mut group) in groups {
            group.members_ids.remove(&self.own_number);
            self.map.insert(id, group);
        }
    }

    /// Register a sender the daemon does not know about yet, so its
    /// messages have somewhere to go.
    pub fn insert_unknown(&mut self, envelope: &Envelope) -> &Contact {
        let id = envelope.conversation_id().to_string();
        let label = envelope
            .source_name
            .as_deref()
            .or(envelope.source_number.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| envelope.sender().chars().take(10).collect::<String>() + "...");
        let contact = Contact::individual(id.clone(), format!("{label} [UNKNOWN CONTACT]"));
        self.map.entry(id).or_insert(contact)
    }

    pub fn serialize(&self) -> BTreeMap<String, Contact> {
        self.map.clone()
    }
}
