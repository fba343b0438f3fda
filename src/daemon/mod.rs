//! The foreground sync loop behind `sigline run`.
//!
//! One `tokio::select!` loop drives everything:
//! 1. signal-cli daemon stdout (JSON envelopes) and stderr (log lines)
//! 2. exits of background `dbus-send` commands
//! 3. completions posted back by command callbacks
//! 4. typing indicator expiry
//! 5. the startup probe for the daemon's D-Bus service
//! 6. lines typed on stdin
//! 7. shutdown signals (SIGTERM/SIGINT)

pub mod config;
pub mod input;

use crate::bridge::classify::{SendFailure, SendOutcome};
use crate::bridge::dbus::DbusSend;
use crate::bridge::{BridgeEvent, DaemonBridge, DaemonEvent, DaemonLog, SendKind};
use crate::envelope::{Envelope, now_ms};
use crate::proc::{BoundedProcessQueue, ScopedCompletionTracker};
use crate::state::{ConversationState, history};
use color_eyre::eyre::{Result, WrapErr, eyre};
use config::DaemonConfig;
use input::Input;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const STDOUT_CHUNK: usize = 8192;

/// What the loop still has to do after an event was applied to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    Nothing,
    ReloadContacts,
}

/// Apply one daemon event to the conversation state.
pub fn apply_event(state: &mut ConversationState, event: DaemonEvent) -> Followup {
    match event {
        DaemonEvent::ReceiveMessage(envelope) => {
            if state.on_receive_message(envelope) {
                return Followup::ReloadContacts;
            }
        }
        DaemonEvent::ReceiveSyncMessage(envelope) => state.on_receive_sync_message(envelope),
        DaemonEvent::ReceiveReceipt(envelope) => state.on_receive_receipt(&envelope),
        DaemonEvent::ContactTyping(envelope) => state.on_contact_typing(envelope),
        DaemonEvent::ReceiveReaction(envelope) => state.on_receive_reaction(envelope),
        DaemonEvent::CallMessage(envelope) => state.on_call_message(envelope),
        DaemonEvent::ContactsSync => {
            tracing::info!("contacts sync received");
            return Followup::ReloadContacts;
        }
        DaemonEvent::RemoteDelete(envelope) => state.on_remote_delete(envelope),
        DaemonEvent::ReceiveSticker(envelope) => state.on_receive_sticker(envelope),
        DaemonEvent::UntrustedIdentity(envelope) => state.on_untrusted_identity(envelope),
        DaemonEvent::SendDone {
            kind,
            envelope,
            outcome,
        } => apply_send_done(state, kind, &envelope, &outcome),
        DaemonEvent::ContactsLoaded {
            individuals,
            groups,
        } => state.on_contacts_loaded(individuals, groups),
        DaemonEvent::DaemonStarted => {
            state.set_status("Initializing signal-cli daemon... Done");
        }
        DaemonEvent::DaemonLog { event, line } => state.set_status(daemon_log_status(event, &line)),
    }
    Followup::Nothing
}

fn apply_send_done(
    state: &mut ConversationState,
    kind: SendKind,
    envelope: &Envelope,
    outcome: &SendOutcome,
) {
    match outcome {
        SendOutcome::Failed(SendFailure::UntrustedIdentity) => {
            state.on_untrusted_identity(envelope.clone());
        }
        SendOutcome::Failed(SendFailure::UserUnregistered) => state.on_user_unregistered(envelope),
        SendOutcome::Failed(failure) => {
            tracing::warn!(%failure, timestamp = envelope.timestamp(), "send did not fully succeed");
        }
        SendOutcome::Sent { .. } => {}
    }
    let (status, timestamp_adj) = outcome.delivery();
    match kind {
        SendKind::Message => state.on_sending_done(envelope, status, timestamp_adj),
        SendKind::Reaction => state.on_sending_reaction_done(envelope, status, timestamp_adj),
        SendKind::RemoteDelete => state.on_sending_remote_delete_done(envelope, status),
    }
}

fn daemon_log_status(event: DaemonLog, line: &str) -> String {
    match event {
        DaemonLog::DaemonStopped => format!(
            "signal-cli daemon has stopped:\n    {line}\nRestart sigline to restart the daemon."
        ),
        DaemonLog::AnotherInstanceRunning => {
            "signal-cli: Config file is in use by another instance, waiting…\n\
             Stop previously launched signal-cli processes to continue."
                .to_string()
        }
        DaemonLog::AnotherInstanceStopped => "Initializing signal-cli daemon... ".to_string(),
    }
}

pub struct DaemonRunner {
    config: DaemonConfig,
    tracker: ScopedCompletionTracker,
    bridge: DaemonBridge,
    bridge_rx: mpsc::UnboundedReceiver<BridgeEvent>,
    state: ConversationState,
}

impl DaemonRunner {
    /// Build the runner and restore saved history, if any.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let queue = match config.max_concurrent_processes {
            Some(max) => BoundedProcessQueue::with_max_concurrent(max),
            None => BoundedProcessQueue::new(),
        };
        let (bridge, bridge_rx) =
            DaemonBridge::new(config.username.as_str(), DbusSend::new(config.dbus_send.as_str()));
        let mut state = ConversationState::new(
            &config.username,
            config.typing_ttl(),
            config.notify_on_reactions,
        );
        if let Some(path) = &config.history_file
            && let Some(doc) = history::load(path)
                .wrap_err_with(|| format!("failed to load history from {}", path.display()))?
        {
            state.restore(doc);
        }
        Ok(Self {
            config,
            tracker: ScopedCompletionTracker::new(queue),
            bridge,
            bridge_rx,
            state,
        })
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    fn spawn_daemon(&self) -> Result<Child> {
        let argv = self.config.daemon_argv();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| eyre!("daemon_command is empty"))?;
        tracing::info!(command = %self.config.daemon_command, "starting signal-cli daemon");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .wrap_err_with(|| format!("failed to start `{}`", self.config.daemon_command))
    }

    pub async fn run(&mut self) -> Result<()> {
        let cancel = CancellationToken::new();
        spawn_shutdown_listener(cancel.clone());

        let mut child = self.spawn_daemon()?;
        let mut daemon_stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("daemon stdout was not captured"))?;
        let daemon_stderr = child
            .stderr
            .take()
            .ok_or_else(|| eyre!("daemon stderr was not captured"))?;
        let mut stderr_lines = BufReader::new(daemon_stderr).lines();
        let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut stdin_open = true;
        let mut chunk = vec![0u8; STDOUT_CHUNK];

        let mut probe_timer = tokio::time::interval(self.config.startup_poll());
        probe_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the first immediate tick.
        probe_timer.tick().await;

        self.state.set_status("Initializing signal-cli daemon... ");
        self.flush();

        loop {
            let typing_deadline = self.state.typing.next_expiry();
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutting down");
                    break;
                }

                read = daemon_stdout.read(&mut chunk), if stdout_open => {
                    match read {
                        Ok(0) => {
                            tracing::warn!("daemon closed its stdout");
                            stdout_open = false;
                        }
                        Ok(n) => {
                            let events = self.bridge.feed_stdout(&chunk[..n]);
                            self.apply_all(events);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to read daemon stdout");
                            stdout_open = false;
                        }
                    }
                }

                line = stderr_lines.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            let events = self.bridge.handle_stderr(&line);
                            self.apply_all(events);
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to read daemon stderr");
                            stderr_open = false;
                        }
                    }
                }

                Some(output) = self.tracker.next_exit() => {
                    self.tracker.complete(&output);
                }

                Some(event) = self.bridge_rx.recv() => {
                    let events = self.bridge.on_event(event, &mut self.tracker);
                    self.apply_all(events);
                }

                _ = tokio::time::sleep_until(typing_deadline.unwrap_or_else(Instant::now)),
                    if typing_deadline.is_some() =>
                {
                    let expired = self.state.expire_typing(Instant::now());
                    tracing::debug!(?expired, "typing indicators expired");
                }

                _ = probe_timer.tick(), if self.bridge.wants_probe() => {
                    self.bridge.probe_service(&mut self.tracker);
                }

                line = stdin_lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) => self.handle_input(&line),
                        Ok(None) => {
                            tracing::debug!("stdin closed");
                            stdin_open = false;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to read stdin");
                            stdin_open = false;
                        }
                    }
                }

                status = child.wait() => {
                    match status {
                        Ok(status) => tracing::error!(%status, "signal-cli daemon exited"),
                        Err(e) => tracing::error!(error = %e, "lost track of signal-cli daemon"),
                    }
                    self.state.set_status(
                        "signal-cli daemon has stopped. Restart sigline to restart the daemon.",
                    );
                    self.flush();
                    break;
                }
            }
            self.flush();
        }

        self.tracker.kill_all();
        if let Err(e) = child.start_kill() {
            tracing::debug!(error = %e, "daemon already gone");
        }
        self.save_history()?;
        tracing::info!("state saved, goodbye");
        Ok(())
    }

    fn apply_all(&mut self, events: Vec<DaemonEvent>) {
        for event in events {
            if apply_event(&mut self.state, event) == Followup::ReloadContacts {
                self.bridge.reload_contacts(&mut self.tracker);
            }
        }
    }

    fn handle_input(&mut self, line: &str) {
        let input = match input::parse(line) {
            Ok(Some(input)) => input,
            Ok(None) => return,
            Err(e) => {
                self.state.set_status(e.to_string());
                return;
            }
        };
        let sends = matches!(
            input,
            Input::Send { .. } | Input::React { .. } | Input::Delete { .. } | Input::Rename { .. }
        );
        if sends && !self.bridge.service_running() {
            self.state
                .set_status("signal-cli daemon is not running yet, try again shortly.");
            return;
        }

        let sink = &mut self.tracker;
        let result = match input {
            Input::Send {
                to,
                text,
                attachments,
            } => self
                .bridge
                .send_message(sink, &to, &text, attachments)
                .map(|envelope| self.state.on_sending_message(envelope)),
            Input::React {
                to,
                author,
                timestamp,
                emoji,
                remove,
            } => self
                .bridge
                .send_reaction(sink, &to, &emoji, &author, timestamp, remove)
                .map(|envelope| self.state.on_sending_reaction(envelope)),
            Input::Delete { to, timestamp } => self
                .bridge
                .send_remote_delete(sink, &to, timestamp)
                .map(|envelope| self.state.on_sending_remote_delete(envelope)),
            Input::Rename { id, name } => self.bridge.rename(sink, &id, &name),
            Input::Open(id) => {
                self.state.open_conversation(&id);
                self.state.set_status(format!("Opened {id}"));
                Ok(())
            }
            Input::Reload => {
                self.bridge.reload_contacts(sink);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "command refused");
            self.state.set_status(format!("Not sent: {e}"));
        }
    }

    /// Print what changed since the last flush.
    fn flush(&mut self) {
        for notice in self.state.take_notices() {
            println!("{notice}");
        }
        for change in self.state.take_delivery_changes() {
            println!("delivery {}: {}", change.timestamp, change.status);
        }
    }

    pub fn save_history(&mut self) -> Result<()> {
        let Some(path) = &self.config.history_file else {
            return Ok(());
        };
        self.state.delivery.prune_buffered(now_ms());
        history::save(path, &self.state.to_history())
            .wrap_err_with(|| format!("failed to save history to {}", path.display()))?;
        tracing::info!(path = %path.display(), "history saved");
        Ok(())
    }
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}

/// Load config, restore history and run until shut down.
pub async fn run(config: DaemonConfig) -> Result<()> {
    DaemonRunner::new(config)?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::delivery::DeliveryStatus;
    use crate::contacts::Contact;
    use crate::envelope::{DataMessage, Reaction};
    use crate::state::Notice;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const ME: &str = "+15555550000";
    const BOB: &str = "+15555550001";

    fn state_with_bob() -> ConversationState {
        let mut state = ConversationState::new(ME, Duration::from_secs(10), false);
        let mut individuals = BTreeMap::new();
        individuals.insert(BOB.to_string(), Contact::individual(BOB, "Bob"));
        state.on_contacts_loaded(individuals, BTreeMap::new());
        state
    }

    fn inbound(from: &str, ts: i64, text: &str) -> Envelope {
        Envelope {
            source: from.into(),
            source_number: Some(from.into()),
            timestamp: Some(ts),
            received_timestamp: Some(ts),
            data_message: Some(DataMessage {
                timestamp: Some(ts),
                message: Some(text.into()),
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

    fn statuses(state: &mut ConversationState) -> Vec<String> {
        state
            .take_notices()
            .into_iter()
            .filter_map(|n| match n {
                Notice::Status(text) => Some(text),
                Notice::NewMessage { .. } => None,
            })
            .collect()
    }

    #[test]
    fn unknown_sender_asks_for_reload() {
        let mut state = state_with_bob();
        assert_eq!(
            apply_event(&mut state, DaemonEvent::ReceiveMessage(inbound(BOB, 1, "hi"))),
            Followup::Nothing
        );
        assert_eq!(
            apply_event(
                &mut state,
                DaemonEvent::ReceiveMessage(inbound("+15555550999", 2, "who dis"))
            ),
            Followup::ReloadContacts
        );
        assert!(state.has_pending_unknown());
        assert_eq!(
            apply_event(&mut state, DaemonEvent::ContactsSync),
            Followup::ReloadContacts
        );

        apply_event(
            &mut state,
            DaemonEvent::ContactsLoaded {
                individuals: BTreeMap::new(),
                groups: BTreeMap::new(),
            },
        );
        assert!(!state.has_pending_unknown());
        assert_eq!(state.unread.get("+15555550999"), 1);
    }

    #[test]
    fn send_done_routes_by_kind() {
        let mut state = state_with_bob();
        let message = text_to(BOB, 100, "hello");
        state.on_sending_message(message.clone());
        apply_event(
            &mut state,
            DaemonEvent::SendDone {
                kind: SendKind::Message,
                envelope: message,
                outcome: SendOutcome::Sent {
                    timestamp_adj: Some(105),
                },
            },
        );
        assert_eq!(state.delivery.status(105), DeliveryStatus::Sent);
        assert!(!state.delivery.contains(100));

        let reaction = Envelope::outgoing(
            ME,
            BOB,
            200,
            DataMessage {
                reaction: Some(Reaction {
                    emoji: "👍".into(),
                    target_author: ME.into(),
                    target_author_number: Some(ME.into()),
                    target_sent_timestamp: 105,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        state.on_sending_reaction(reaction.clone());
        apply_event(
            &mut state,
            DaemonEvent::SendDone {
                kind: SendKind::Reaction,
                envelope: reaction,
                outcome: SendOutcome::Sent {
                    timestamp_adj: None,
                },
            },
        );
        assert_eq!(state.delivery.status(200), DeliveryStatus::IgnoreReceipts);
    }

    #[test]
    fn untrusted_send_reports_and_fails() {
        let mut state = state_with_bob();
        let message = text_to(BOB, 100, "hello");
        state.on_sending_message(message.clone());
        state.take_notices();
        apply_event(
            &mut state,
            DaemonEvent::SendDone {
                kind: SendKind::Message,
                envelope: message,
                outcome: SendOutcome::Failed(SendFailure::UntrustedIdentity),
            },
        );
        assert_eq!(state.delivery.status(100), DeliveryStatus::SendFailed);
        let statuses = statuses(&mut state);
        assert!(statuses[0].contains("safety number has changed"));
        assert_eq!(statuses[1], "Message \"hello\" failed to send.");
    }

    #[test]
    fn unregistered_recipient_is_reported() {
        let mut state = state_with_bob();
        let message = text_to(BOB, 100, "hello");
        state.on_sending_message(message.clone());
        state.take_notices();
        apply_event(
            &mut state,
            DaemonEvent::SendDone {
                kind: SendKind::Message,
                envelope: message,
                outcome: SendOutcome::Failed(SendFailure::UserUnregistered),
            },
        );
        assert!(statuses(&mut state)[0].starts_with(&format!("Contact {BOB} has unregistered")));
    }

    #[test]
    fn daemon_lifecycle_statuses() {
        let mut state = state_with_bob();
        apply_event(&mut state, DaemonEvent::DaemonStarted);
        apply_event(
            &mut state,
            DaemonEvent::DaemonLog {
                event: DaemonLog::DaemonStopped,
                line: "ERROR boom".into(),
            },
        );
        apply_event(
            &mut state,
            DaemonEvent::DaemonLog {
                event: DaemonLog::AnotherInstanceRunning,
                line: String::new(),
            },
        );
        let statuses = statuses(&mut state);
        assert_eq!(statuses[0], "Initializing signal-cli daemon... Done");
        assert!(statuses[1].contains("    ERROR boom\n"));
        assert!(statuses[2].contains("in use by another instance"));
    }

    #[tokio::test]
    async fn runner_restores_and_saves_history() {
        let dir = tempfile::tempdir().unwrap();
        let history_file = dir.path().join("history");
        let config: DaemonConfig = toml::from_str(&format!(
            "username = \"{ME}\"\nhistory_file = \"{}\"\nmax_concurrent_processes = 2",
            history_file.display()
        ))
        .unwrap();

        let mut state = state_with_bob();
        state.on_receive_message(inbound(BOB, 1000, "saved"));
        history::save(&history_file, &state.to_history()).unwrap();

        let mut runner = DaemonRunner::new(config).unwrap();
        assert_eq!(runner.state().chats.message_count(), 1);
        assert_eq!(runner.state().unread.get(BOB), 1);
        assert!(runner.state().contacts.contains(BOB));

        runner.save_history().unwrap();
        let saved = history::read(&history_file).unwrap().unwrap();
        assert_eq!(saved.envelopes.len(), 1);
        assert_eq!(saved.envelopes[0].text(), Some("saved"));
    }

    #[tokio::test]
    async fn input_before_startup_is_refused() {
        let config: DaemonConfig = toml::from_str(&format!("username = \"{ME}\"")).unwrap();
        let mut runner = DaemonRunner::new(config).unwrap();
        runner.handle_input(&format!("{BOB} hello"));
        runner.handle_input("/open +15555550001");
        let notices = runner.state.take_notices();
        assert_eq!(
            notices,
            [
                Notice::Status("signal-cli daemon is not running yet, try again shortly.".into()),
                Notice::Status(format!("Opened {BOB}")),
            ]
        );
        assert_eq!(runner.state().current(), Some(BOB));
        assert_eq!(runner.state().chats.message_count(), 0);
    }
}
