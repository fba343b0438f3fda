//! Background process execution.
//!
//! Commands sent to the signal-cli daemon are one-shot subprocesses. This
//! module launches them without blocking the event loop and reports every
//! exit back through a single completion channel:
//!
//! - [`ProcessRunner`] spawns a child and watches it from a small task.
//! - [`queue::BoundedProcessQueue`] caps how many children run at once.
//! - [`scope::ScopedCompletionTracker`] groups submissions so a caller can
//!   run "N commands, then do X".

pub mod limits;
pub mod queue;
pub mod scope;

pub use queue::{BoundedProcessQueue, DoneCallback, Promotion, Submitted, TicketId};
pub use scope::{AllDoneCallback, CommandSink, EachDoneCallback, ScopeId, ScopedCompletionTracker};

use std::process::Stdio;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A program plus its arguments, run without a shell unless built with
/// [`ProcessCommand::shell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Run `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl std::fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Identifies one launched child for the lifetime of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    #[cfg(test)]
    pub(crate) const fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// What a finished child left behind.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub id: ProcessId,
    pub command: ProcessCommand,
    /// `None` when the child could not be spawned or was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Combined captured output (stdout, then stderr) without the trailing
    /// newline. dbus-send prints replies on stdout and errors on stderr, so
    /// classifiers look at both.
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len());
        text.push_str(self.stdout.trim_end_matches('\n'));
        let stderr = self.stderr.trim_end_matches('\n');
        if !text.is_empty() && !stderr.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr);
        text
    }

    fn spawn_failed(id: ProcessId, command: ProcessCommand, error: String) -> Self {
        Self {
            id,
            command,
            exit_code: None,
            stdout: String::new(),
            stderr: error,
        }
    }
}

/// Launches children and funnels their exits into one channel.
///
/// Each child is awaited by a spawned task that owns nothing but the child
/// and a sender, so all bookkeeping stays with whoever owns the runner.
/// Children are spawned with `kill_on_drop`, and [`ProcessRunner::kill_all`]
/// drops every watcher, so nothing outlives the program.
pub struct ProcessRunner {
    exits_tx: mpsc::UnboundedSender<ProcessOutput>,
    exits_rx: mpsc::UnboundedReceiver<ProcessOutput>,
    shutdown: CancellationToken,
    next_id: u64,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            exits_tx,
            exits_rx,
            shutdown: CancellationToken::new(),
            next_id: 0,
        }
    }

    /// Start `command` in the background. Must be called from within a
    /// tokio runtime. A spawn failure is reported as an ordinary exit with
    /// no exit code, so callers always get exactly one completion per id.
    pub fn launch(&mut self, command: ProcessCommand) -> ProcessId {
        let id = ProcessId(self.next_id);
        self.next_id += 1;

        tracing::debug!(process = %id, command = %command, "launching");

        let spawned = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let tx = self.exits_tx.clone();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(process = %id, command = %command, error = %e, "failed to spawn");
                let _ = tx.send(ProcessOutput::spawn_failed(id, command, e.to_string()));
                return id;
            }
        };

        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = child.wait_with_output() => {
                    let output = match result {
                        Ok(out) => ProcessOutput {
                            id,
                            command,
                            exit_code: out.status.code(),
                            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                        },
                        Err(e) => ProcessOutput::spawn_failed(id, command, e.to_string()),
                    };
                    if !output.success() {
                        tracing::error!(
                            process = %id,
                            command = %output.command,
                            exit_code = ?output.exit_code,
                            stderr = %output.stderr.trim_end(),
                            "background process failed"
                        );
                    }
                    let _ = tx.send(output);
                }
                _ = cancel.cancelled() => {
                    // Dropping the wait future drops the child, which kills it.
                    tracing::debug!(process = %id, "killed at shutdown");
                }
            }
        });

        id
    }

    /// Wait for the next child to exit, in actual exit order.
    pub async fn next_exit(&mut self) -> Option<ProcessOutput> {
        self.exits_rx.recv().await
    }

    /// Kill every child that is still running.
    pub fn kill_all(&self) {
        self.shutdown.cancel();
    }
}
