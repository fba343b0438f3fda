//! FIFO admission of background processes under a concurrency cap.

use super::{ProcessCommand, ProcessId, ProcessOutput, ProcessRunner, limits};
use std::collections::{HashMap, VecDeque};

/// Invoked once with the output of the process it was submitted with.
pub type DoneCallback = Box<dyn FnOnce(&ProcessOutput)>;

/// Identifies a submission that is waiting for a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketId(u64);

/// Where a submission went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Launched(ProcessId),
    Queued(TicketId),
}

/// A queued submission that has just been launched into a freed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promotion {
    pub ticket: TicketId,
    pub process: ProcessId,
}

struct QueuedRun {
    ticket: TicketId,
    command: ProcessCommand,
    on_done: Option<DoneCallback>,
}

/// Runs at most `max_concurrent` processes; overflow waits in an unbounded
/// FIFO and is never rejected.
pub struct BoundedProcessQueue {
    runner: ProcessRunner,
    max_concurrent: usize,
    running: HashMap<ProcessId, Option<DoneCallback>>,
    queued: VecDeque<QueuedRun>,
    next_ticket: u64,
}

impl Default for BoundedProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundedProcessQueue {
    /// Queue with the cap derived from the current resource limits.
    pub fn new() -> Self {
        Self::with_max_concurrent(limits::max_concurrent_processes())
    }

    pub fn with_max_concurrent(max_concurrent: usize) -> Self {
        tracing::debug!(max_concurrent, "process queue created");
        Self {
            runner: ProcessRunner::new(),
            max_concurrent: max_concurrent.max(1),
            running: HashMap::new(),
            queued: VecDeque::new(),
            next_ticket: 0,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of processes currently running.
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Number of submissions waiting for a slot.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.queued.is_empty()
    }

    /// Launch `command` now if a slot is free, otherwise queue it.
    pub fn submit(&mut self, command: ProcessCommand, on_done: Option<DoneCallback>) -> Submitted {
        if self.running.len() < self.max_concurrent {
            let id = self.runner.launch(command);
            self.running.insert(id, on_done);
            return Submitted::Launched(id);
        }

        let ticket = TicketId(self.next_ticket);
        self.next_ticket += 1;
        tracing::debug!(
            command = %command,
            queued = self.queued.len() + 1,
            "process cap reached; queueing"
        );
        self.queued.push_back(QueuedRun {
            ticket,
            command,
            on_done,
        });
        Submitted::Queued(ticket)
    }

    /// Wait for the next running process to exit.
    pub async fn next_exit(&mut self) -> Option<ProcessOutput> {
        self.runner.next_exit().await
    }

    /// Book-keep an exit: refill the freed slot from the queue first, then
    /// run the submission's callback. Returns the launched queued entry, if
    /// any, so scope tracking can follow it.
    pub fn complete(&mut self, output: &ProcessOutput) -> Option<Promotion> {
        let Some(on_done) = self.running.remove(&output.id) else {
            tracing::warn!(process = %output.id, "exit for unknown process");
            return None;
        };

        let promoted = self.launch_next();

        if let Some(on_done) = on_done {
            on_done(output);
        }
        promoted
    }

    /// Drive the queue until nothing is running or waiting.
    pub async fn run_until_idle(&mut self) {
        while !self.is_idle() {
            match self.next_exit().await {
                Some(output) => {
                    self.complete(&output);
                }
                None => break,
            }
        }
    }

    /// Drop everything queued and kill everything running.
    pub fn kill_all(&mut self) {
        if !self.queued.is_empty() {
            tracing::info!(dropped = self.queued.len(), "discarding queued processes");
        }
        self.queued.clear();
        self.running.clear();
        self.runner.kill_all();
    }

    fn launch_next(&mut self) -> Option<Promotion> {
        let next = self.queued.pop_front()?;
        let process = self.runner.launch(next.command);
        self.running.insert(process, next.on_done);
        Some(Promotion {
            ticket: next.ticket,
            process,
        })
    }
}
