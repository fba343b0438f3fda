//! Scope-grouped completion tracking on top of [`BoundedProcessQueue`].
//!
//! A scope collects every command submitted while it is the innermost open
//! scope. Once the scope is closed and all of its commands (including the
//! ones still waiting for a slot when the scope closed) have exited, its
//! `on_all_done` callback fires exactly once.

use super::{
    BoundedProcessQueue, DoneCallback, ProcessCommand, ProcessId, ProcessOutput, Submitted,
    TicketId,
};
use std::collections::HashMap;

/// Fired once, after the last command of a closed scope has exited.
pub type AllDoneCallback = Box<dyn FnOnce()>;

/// Fired after each command of a scope exits, in exit order.
pub type EachDoneCallback = Box<dyn FnMut(&ProcessOutput)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Where commands go. The bridge only issues commands through this seam so
/// it can be exercised without spawning anything.
#[cfg_attr(test, mockall::automock)]
pub trait CommandSink {
    /// Submit a command to the innermost open scope (if any).
    fn submit(&mut self, command: ProcessCommand, on_done: Option<DoneCallback>);

    /// Open a scope and make it the innermost one.
    fn open_scope(
        &mut self,
        on_all_done: AllDoneCallback,
        on_each_done: Option<EachDoneCallback>,
    ) -> ScopeId;

    /// Stop attaching new submissions to `scope`.
    fn close_scope(&mut self, scope: ScopeId);
}

struct ScopeRecord {
    /// Launched and not yet exited.
    attached: usize,
    /// Still waiting in the queue.
    buffered: usize,
    open: bool,
    on_all_done: Option<AllDoneCallback>,
    on_each_done: Option<EachDoneCallback>,
}

impl ScopeRecord {
    fn finished(&self) -> bool {
        !self.open && self.attached == 0 && self.buffered == 0
    }
}

pub struct ScopedCompletionTracker {
    queue: BoundedProcessQueue,
    scopes: HashMap<ScopeId, ScopeRecord>,
    stack: Vec<ScopeId>,
    owners: HashMap<ProcessId, ScopeId>,
    buffered_owners: HashMap<TicketId, ScopeId>,
    next_scope: u64,
}

impl ScopedCompletionTracker {
    pub fn new(queue: BoundedProcessQueue) -> Self {
        Self {
            queue,
            scopes: HashMap::new(),
            stack: Vec::new(),
            owners: HashMap::new(),
            buffered_owners: HashMap::new(),
            next_scope: 0,
        }
    }

    pub fn queue(&self) -> &BoundedProcessQueue {
        &self.queue
    }

    /// Scopes that have not fired yet.
    pub fn pending_scopes(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    /// Run `body` with a fresh scope innermost, then close it.
    pub fn with_scope<R>(
        &mut self,
        on_all_done: AllDoneCallback,
        on_each_done: Option<EachDoneCallback>,
        body: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let scope = self.open_scope(on_all_done, on_each_done);
        let result = body(self);
        self.close_scope(scope);
        result
    }

    /// Submit and report whether the command started or was queued.
    pub fn submit_tracked(
        &mut self,
        command: ProcessCommand,
        on_done: Option<DoneCallback>,
    ) -> Submitted {
        let submitted = self.queue.submit(command, on_done);
        let Some(&scope) = self.stack.last() else {
            return submitted;
        };
        let Some(record) = self.scopes.get_mut(&scope) else {
            return submitted;
        };
        match submitted {
            Submitted::Launched(process) => {
                record.attached += 1;
                self.owners.insert(process, scope);
            }
            Submitted::Queued(ticket) => {
                record.buffered += 1;
                self.buffered_owners.insert(ticket, scope);
            }
        }
        submitted
    }

    pub async fn next_exit(&mut self) -> Option<ProcessOutput> {
        self.queue.next_exit().await
    }

    /// Book-keep one exit: the command's own callback, then its scope's
    /// per-completion callback, then the scope's `on_all_done` if this was
    /// the last one.
    pub fn complete(&mut self, output: &ProcessOutput) {
        if let Some(promotion) = self.queue.complete(output)
            && let Some(scope) = self.buffered_owners.remove(&promotion.ticket)
        {
            self.owners.insert(promotion.process, scope);
            if let Some(record) = self.scopes.get_mut(&scope) {
                record.buffered -= 1;
                record.attached += 1;
            }
        }

        let Some(scope) = self.owners.remove(&output.id) else {
            return;
        };
        let Some(record) = self.scopes.get_mut(&scope) else {
            return;
        };
        record.attached -= 1;
        if let Some(on_each_done) = record.on_each_done.as_mut() {
            on_each_done(output);
        }
        if record.finished() {
            self.fire(scope);
        }
    }

    /// Drive everything until no process is running or waiting.
    pub async fn run_until_idle(&mut self) {
        while !self.queue.is_idle() {
            match self.next_exit().await {
                Some(output) => self.complete(&output),
                None => break,
            }
        }
    }

    /// Kill every process. Pending scopes are dropped without firing.
    pub fn kill_all(&mut self) {
        self.queue.kill_all();
        if !self.scopes.is_empty() {
            tracing::debug!(scopes = self.scopes.len(), "dropping unfinished scopes");
        }
        self.scopes.clear();
        self.stack.clear();
        self.owners.clear();
        self.buffered_owners.clear();
    }

    fn fire(&mut self, scope: ScopeId) {
        if let Some(record) = self.scopes.remove(&scope)
            && let Some(on_all_done) = record.on_all_done
        {
            on_all_done();
        }
    }
}

impl CommandSink for ScopedCompletionTracker {
    fn submit(&mut self, command: ProcessCommand, on_done: Option<DoneCallback>) {
        self.submit_tracked(command, on_done);
    }

    fn open_scope(
        &mut self,
        on_all_done: AllDoneCallback,
        on_each_done: Option<EachDoneCallback>,
    ) -> ScopeId {
        let scope = ScopeId(self.next_scope);
        self.next_scope += 1;
        self.scopes.insert(
            scope,
            ScopeRecord {
                attached: 0,
                buffered: 0,
                open: true,
                on_all_done: Some(on_all_done),
                on_each_done,
            },
        );
        self.stack.push(scope);
        scope
    }

    fn close_scope(&mut self, scope: ScopeId) {
        match self.stack.iter().rposition(|s| *s == scope) {
            Some(pos) if pos + 1 == self.stack.len() => {
                self.stack.pop();
            }
            Some(pos) => {
                tracing::warn!(?scope, "closing a scope that is not innermost");
                self.stack.remove(pos);
            }
            None => {
                tracing::warn!(?scope, "closing an unknown scope");
                return;
            }
        }
        let Some(record) = self.scopes.get_mut(&scope) else {
            return;
        };
        record.open = false;
        if record.finished() {
            self.fire(scope);
        }
    }
}
