//! Bridge to the signal-cli daemon.
//!
//! Inbound, the daemon writes one JSON object per line on stdout and its
//! log on stderr; [`DaemonBridge`] turns both into [`DaemonEvent`]s.
//! Outbound, every request is a one-shot `dbus-send` submitted to a
//! [`CommandSink`]. Command callbacks never touch state: they post a
//! [`BridgeEvent`] on a channel, and the loop hands it back to
//! [`DaemonBridge::on_event`], which may submit follow-up commands.

pub mod classify;
pub mod dbus;

use crate::contacts::Contact;
use crate::envelope::{
    Attachment, DataMessage, Envelope, EnvelopeKind, Reaction, RemoteDelete, now_ms,
};
use crate::proc::{CommandSink, DoneCallback, ProcessOutput};
use classify::{SendOutcome, classify_send};
use dbus::{DbusError, DbusSend, Recipient};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::LazyLock;
use thiserror::Error;
use tokio::sync::mpsc;

static LOG_LEVEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(2.*? \[.*\] )?(?P<level>[A-Z]+) .*$").expect("valid regex")
});

const STARTUP_MARKERS: [&str; 2] = ["DBus daemon running", "Started DBus server"];

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("attached file does not exist: {0}")]
    MissingAttachment(String),
    #[error("message to react to has no author")]
    MissingAuthor,
    #[error(transparent)]
    Dbus(#[from] DbusError),
}

/// Noteworthy daemon log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonLog {
    AnotherInstanceRunning,
    AnotherInstanceStopped,
    DaemonStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Message,
    Reaction,
    RemoteDelete,
}

/// Everything the application state has to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    ReceiveMessage(Envelope),
    ReceiveSyncMessage(Envelope),
    ReceiveReceipt(Envelope),
    ContactTyping(Envelope),
    ReceiveReaction(Envelope),
    CallMessage(Envelope),
    ContactsSync,
    RemoteDelete(Envelope),
    ReceiveSticker(Envelope),
    UntrustedIdentity(Envelope),
    SendDone {
        kind: SendKind,
        envelope: Envelope,
        outcome: SendOutcome,
    },
    ContactsLoaded {
        individuals: BTreeMap<String, Contact>,
        groups: BTreeMap<String, Contact>,
    },
    DaemonStarted,
    DaemonLog {
        event: DaemonLog,
        line: String,
    },
}

/// Command completions, posted by callbacks and fed back through
/// [`DaemonBridge::on_event`].
#[derive(Debug)]
pub enum BridgeEvent {
    ServiceProbe {
        registered: bool,
    },
    NumbersListed(Vec<String>),
    IndividualsLoaded(BTreeMap<String, Contact>),
    GroupIdsListed(BTreeSet<String>),
    GroupsLoaded(BTreeMap<String, Contact>),
    Version(String),
    Renamed {
        id: String,
        ok: bool,
    },
    SendDone {
        kind: SendKind,
        envelope: Envelope,
        outcome: SendOutcome,
    },
}

#[derive(Deserialize)]
struct DaemonLine {
    envelope: Envelope,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    exception: Option<Value>,
}

pub struct DaemonBridge {
    own_number: String,
    dbus: DbusSend,
    events: mpsc::UnboundedSender<BridgeEvent>,
    /// Stdout is held back while paused: before the D-Bus service is up and
    /// while contacts are reloading.
    paused: bool,
    stdout_buf: Vec<u8>,
    startup_marker_seen: bool,
    probe_in_flight: bool,
    service_running: bool,
    reloading: bool,
    loaded_individuals: Option<BTreeMap<String, Contact>>,
}

impl DaemonBridge {
    pub fn new(
        own_number: impl Into<String>,
        dbus: DbusSend,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let bridge = Self {
            own_number: own_number.into(),
            dbus,
            events,
            paused: true,
            stdout_buf: Vec::new(),
            startup_marker_seen: false,
            probe_in_flight: false,
            service_running: false,
            reloading: false,
            loaded_individuals: None,
        };
        (bridge, rx)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn service_running(&self) -> bool {
        self.service_running
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume processing and drain whatever stdout was held back.
    pub fn unpause(&mut self) -> Vec<DaemonEvent> {
        self.paused = false;
        self.feed_stdout(&[])
    }

    /// Take a chunk of daemon stdout. Complete lines are parsed; a trailing
    /// partial line waits for the next chunk.
    pub fn feed_stdout(&mut self, chunk: &[u8]) -> Vec<DaemonEvent> {
        self.stdout_buf.extend_from_slice(chunk);
        if self.paused {
            return Vec::new();
        }
        let Some(end) = self.stdout_buf.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.stdout_buf.drain(..=end).collect();
        let mut events = Vec::new();
        for line in complete.split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(line);
            if line.trim().is_empty() {
                continue;
            }
            events.extend(parse_line(&line));
        }
        events
    }

    /// Take a block of daemon stderr: re-log it and look for lifecycle
    /// markers.
    pub fn handle_stderr(&mut self, output: &str) -> Vec<DaemonEvent> {
        let lines = output.trim();
        let mut events = Vec::new();
        if lines.is_empty() {
            return events;
        }
        if self.paused {
            if STARTUP_MARKERS.iter().any(|m| lines.contains(m)) {
                tracing::debug!("daemon startup marker seen");
                self.startup_marker_seen = true;
            } else if lines.contains("in use by another instance") {
                events.push(DaemonEvent::DaemonLog {
                    event: DaemonLog::AnotherInstanceRunning,
                    line: lines.to_string(),
                });
            } else if lines.contains("Config file lock acquired") {
                events.push(DaemonEvent::DaemonLog {
                    event: DaemonLog::AnotherInstanceStopped,
                    line: lines.to_string(),
                });
            }
        }
        for line in lines.lines() {
            relog(line);
            if line.starts_with("ERROR") && !self.service_running {
                events.push(DaemonEvent::DaemonLog {
                    event: DaemonLog::DaemonStopped,
                    line: line.to_string(),
                });
            }
        }
        events
    }

    /// Whether the loop should poll the bus for the daemon's service.
    pub fn wants_probe(&self) -> bool {
        self.startup_marker_seen && !self.service_running && !self.probe_in_flight
    }

    pub fn probe_service(&mut self, sink: &mut dyn CommandSink) {
        self.probe_in_flight = true;
        let tx = self.events.clone();
        sink.submit(
            self.dbus.list_names(),
            Some(Box::new(move |out: &ProcessOutput| {
                let registered = out.success() && dbus::service_registered(&out.stdout);
                let _ = tx.send(BridgeEvent::ServiceProbe { registered });
            })),
        );
    }

    /// Apply a command completion. Returns the events it produced for the
    /// application state.
    pub fn on_event(&mut self, event: BridgeEvent, sink: &mut dyn CommandSink) -> Vec<DaemonEvent> {
        match event {
            BridgeEvent::ServiceProbe { registered } => {
                self.probe_in_flight = false;
                if !registered || self.service_running {
                    return Vec::new();
                }
                tracing::info!("signal-cli dbus service started");
                self.service_running = true;
                self.reload_contacts(sink);
                self.request_version(sink);
                vec![DaemonEvent::DaemonStarted]
            }
            BridgeEvent::NumbersListed(numbers) => {
                self.load_contact_names(numbers, sink);
                Vec::new()
            }
            BridgeEvent::IndividualsLoaded(individuals) => {
                self.loaded_individuals = Some(individuals);
                let tx = self.events.clone();
                sink.submit(
                    self.dbus.list_groups(),
                    Some(Box::new(move |out: &ProcessOutput| {
                        let _ = tx.send(BridgeEvent::GroupIdsListed(dbus::parse_group_ids(
                            &out.stdout,
                        )));
                    })),
                );
                Vec::new()
            }
            BridgeEvent::GroupIdsListed(ids) => {
                self.load_groups(ids, sink);
                Vec::new()
            }
            BridgeEvent::GroupsLoaded(groups) => {
                self.reloading = false;
                let individuals = self.loaded_individuals.take().unwrap_or_default();
                let mut events = vec![DaemonEvent::ContactsLoaded {
                    individuals,
                    groups,
                }];
                events.extend(self.unpause());
                events
            }
            BridgeEvent::Version(version) => {
                tracing::info!(%version, "daemon version");
                Vec::new()
            }
            BridgeEvent::Renamed { id, ok } => {
                if ok {
                    self.reload_contacts(sink);
                } else {
                    tracing::error!(%id, "rename failed");
                }
                Vec::new()
            }
            BridgeEvent::SendDone {
                kind,
                envelope,
                outcome,
            } => vec![DaemonEvent::SendDone {
                kind,
                envelope,
                outcome,
            }],
        }
    }

    /// Reload individuals and groups from the daemon. Message processing is
    /// paused until both are in.
    pub fn reload_contacts(&mut self, sink: &mut dyn CommandSink) {
        if !self.service_running {
            tracing::warn!("reload skipped: signal-cli daemon is not running");
            return;
        }
        if self.reloading {
            tracing::debug!("contacts reload already in progress");
            return;
        }
        self.reloading = true;
        self.pause();
        let tx = self.events.clone();
        sink.submit(
            self.dbus.list_numbers(),
            Some(Box::new(move |out: &ProcessOutput| {
                let _ = tx.send(BridgeEvent::NumbersListed(dbus::parse_numbers(&out.stdout)));
            })),
        );
    }

    fn load_contact_names(&mut self, numbers: Vec<String>, sink: &mut dyn CommandSink) {
        let loaded: Rc<RefCell<BTreeMap<String, Contact>>> = Rc::default();
        let tx = self.events.clone();
        let all = Rc::clone(&loaded);
        let scope = sink.open_scope(
            Box::new(move || {
                let _ = tx.send(BridgeEvent::IndividualsLoaded(all.take()));
            }),
            None,
        );
        for number in numbers {
            let loaded = Rc::clone(&loaded);
            let command = self.dbus.contact_name(&number);
            sink.submit(
                command,
                Some(Box::new(move |out: &ProcessOutput| {
                    let name = dbus::parse_contact_name(&out.stdout);
                    loaded
                        .borrow_mut()
                        .insert(number.clone(), Contact::individual(number, name));
                })),
            );
        }
        sink.close_scope(scope);
    }

    fn load_groups(&mut self, ids: BTreeSet<String>, sink: &mut dyn CommandSink) {
        let loaded: Rc<RefCell<BTreeMap<String, Contact>>> = Rc::default();
        let tx = self.events.clone();
        let all = Rc::clone(&loaded);
        let scope = sink.open_scope(
            Box::new(move || {
                let _ = tx.send(BridgeEvent::GroupsLoaded(all.take()));
            }),
            None,
        );
        for id in ids {
            let (name_cmd, members_cmd) =
                match (self.dbus.group_name(&id), self.dbus.group_members(&id)) {
                    (Ok(name), Ok(members)) => (name, members),
                    (Err(e), _) | (_, Err(e)) => {
                        tracing::warn!(error = %e, "skipping group");
                        continue;
                    }
                };
            loaded
                .borrow_mut()
                .insert(id.clone(), Contact::group(id.clone(), String::new()));

            let names = Rc::clone(&loaded);
            let group_id = id.clone();
            sink.submit(
                name_cmd,
                Some(Box::new(move |out: &ProcessOutput| {
                    if let Some(group) = names.borrow_mut().get_mut(&group_id) {
                        group.name = Some(dbus::parse_group_name(&out.stdout, &group_id));
                    }
                })),
            );
            let members = Rc::clone(&loaded);
            sink.submit(
                members_cmd,
                Some(Box::new(move |out: &ProcessOutput| {
                    if let Some(group) = members.borrow_mut().get_mut(&id) {
                        group.members_ids = dbus::parse_group_members(&out.stdout);
                    }
                })),
            );
        }
        sink.close_scope(scope);
    }

    pub fn request_version(&mut self, sink: &mut dyn CommandSink) {
        let tx = self.events.clone();
        sink.submit(
            self.dbus.version(),
            Some(Box::new(move |out: &ProcessOutput| {
                if out.success() {
                    let _ = tx.send(BridgeEvent::Version(dbus::parse_version(&out.stdout)));
                }
            })),
        );
    }

    /// Send a text message. Returns the local envelope to show while the
    /// send is in flight.
    pub fn send_message(
        &mut self,
        sink: &mut dyn CommandSink,
        target: &str,
        message: &str,
        attachments: Vec<String>,
    ) -> Result<Envelope, BridgeError> {
        if let Some(missing) = attachments
            .iter()
            .find(|a| !std::path::Path::new(a).exists())
        {
            tracing::error!(attachment = %missing, "attached file does not exist");
            return Err(BridgeError::MissingAttachment(missing.clone()));
        }
        let recipient = Recipient::new(target);
        let command = self.dbus.send_message(recipient, message, &attachments)?;
        let envelope = Envelope::outgoing(
            &self.own_number,
            target,
            now_ms(),
            DataMessage {
                message: Some(message.to_string()),
                attachments: attachments.into_iter().map(Attachment::Local).collect(),
                ..Default::default()
            },
        );
        tracing::info!(target, timestamp = envelope.timestamp(), "sending message");
        sink.submit(
            command,
            Some(self.send_done(SendKind::Message, envelope.clone(), recipient.is_group())),
        );
        Ok(envelope)
    }

    pub fn send_reaction(
        &mut self,
        sink: &mut dyn CommandSink,
        target: &str,
        emoji: &str,
        target_author: &str,
        target_sent_timestamp: i64,
        remove: bool,
    ) -> Result<Envelope, BridgeError> {
        if target_author.is_empty() {
            return Err(BridgeError::MissingAuthor);
        }
        let recipient = Recipient::new(target);
        let command = self.dbus.send_reaction(
            recipient,
            emoji,
            remove,
            target_author,
            target_sent_timestamp,
        )?;
        let envelope = Envelope::outgoing(
            &self.own_number,
            target,
            now_ms(),
            DataMessage {
                reaction: Some(Reaction {
                    emoji: emoji.to_string(),
                    is_remove: remove,
                    target_author: target_author.to_string(),
                    target_author_number: Some(target_author.to_string()),
                    target_sent_timestamp,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        tracing::info!(target, emoji, "sending reaction");
        sink.submit(
            command,
            Some(self.send_done(SendKind::Reaction, envelope.clone(), recipient.is_group())),
        );
        Ok(envelope)
    }

    pub fn send_remote_delete(
        &mut self,
        sink: &mut dyn CommandSink,
        target: &str,
        target_sent_timestamp: i64,
    ) -> Result<Envelope, BridgeError> {
        let recipient = Recipient::new(target);
        let command = self
            .dbus
            .send_remote_delete(recipient, target_sent_timestamp)?;
        let envelope = Envelope::outgoing(
            &self.own_number,
            target,
            now_ms(),
            DataMessage {
                remote_delete: Some(RemoteDelete {
                    timestamp: target_sent_timestamp,
                }),
                ..Default::default()
            },
        );
        sink.submit(
            command,
            Some(self.send_done(
                SendKind::RemoteDelete,
                envelope.clone(),
                recipient.is_group(),
            )),
        );
        Ok(envelope)
    }

    /// Rename a contact or group; contacts are reloaded once it succeeds.
    pub fn rename(
        &mut self,
        sink: &mut dyn CommandSink,
        id: &str,
        name: &str,
    ) -> Result<(), BridgeError> {
        let command = self.dbus.rename(Recipient::new(id), name)?;
        let tx = self.events.clone();
        let id = id.to_string();
        sink.submit(
            command,
            Some(Box::new(move |out: &ProcessOutput| {
                let _ = tx.send(BridgeEvent::Renamed {
                    id,
                    ok: out.success(),
                });
            })),
        );
        Ok(())
    }

    fn send_done(&self, kind: SendKind, envelope: Envelope, is_group: bool) -> DoneCallback {
        let tx = self.events.clone();
        Box::new(move |out: &ProcessOutput| {
            let outcome = classify_send(out, is_group);
            let _ = tx.send(BridgeEvent::SendDone {
                kind,
                envelope,
                outcome,
            });
        })
    }
}

/// Parse one stdout line. Malformed lines are logged and dropped.
fn parse_line(line: &str) -> Vec<DaemonEvent> {
    let parsed: DaemonLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(error = %e, line, "could not parse daemon output");
            return Vec::new();
        }
    };
    tracing::debug!(line, "daemon output");

    let errors: Vec<Value> = [parsed.error, parsed.exception]
        .into_iter()
        .flatten()
        .collect();
    if errors.is_empty() {
        return handle_envelope(parsed.envelope).into_iter().collect();
    }
    errors
        .into_iter()
        .filter_map(|error| {
            tracing::error!(%error, "daemon reported an error");
            let untrusted = error.get("type").and_then(Value::as_str)
                == Some("UntrustedIdentityException");
            untrusted.then(|| DaemonEvent::UntrustedIdentity(parsed.envelope.clone()))
        })
        .collect()
}

/// Stamp the local receive time and turn an envelope into its event.
fn handle_envelope(mut envelope: Envelope) -> Option<DaemonEvent> {
    envelope.received_timestamp = Some(now_ms());
    let event = match envelope.kind() {
        EnvelopeKind::SyncSent => DaemonEvent::ReceiveSyncMessage(envelope),
        EnvelopeKind::Message => DaemonEvent::ReceiveMessage(envelope),
        EnvelopeKind::Receipt => DaemonEvent::ReceiveReceipt(envelope),
        EnvelopeKind::Typing => DaemonEvent::ContactTyping(envelope),
        EnvelopeKind::Reaction => DaemonEvent::ReceiveReaction(envelope),
        EnvelopeKind::Call => DaemonEvent::CallMessage(envelope),
        EnvelopeKind::ContactsSync => DaemonEvent::ContactsSync,
        EnvelopeKind::RemoteDelete => DaemonEvent::RemoteDelete(envelope),
        EnvelopeKind::Sticker => DaemonEvent::ReceiveSticker(envelope),
        EnvelopeKind::None => {
            tracing::info!(?envelope, "no action for received envelope");
            return None;
        }
    };
    Some(event)
}

/// Re-emit a daemon log line at the level it was logged with.
fn relog(line: &str) {
    let level = LOG_LEVEL
        .captures(line)
        .and_then(|c| c.name("level"))
        .map(|m| m.as_str());
    match level {
        Some("ERROR") => tracing::error!(target: "signal_cli", "{line}"),
        Some("WARN" | "WARNING") => tracing::warn!(target: "signal_cli", "{line}"),
        Some("DEBUG") => tracing::debug!(target: "signal_cli", "{line}"),
        Some("TRACE") => tracing::trace!(target: "signal_cli", "{line}"),
        _ => tracing::info!(target: "signal_cli", "{line}"),
    }
}
