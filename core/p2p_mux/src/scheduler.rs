//! Per-peer deferred tasks
//!
//! Time-based actions never block. A task is a deadline stored against a
//! peer; the engine asks for due tasks once per pump and runs them. Each
//! peer has at most one pending task, so scheduling a new one replaces (and
//! thereby cancels) the old one.

use std::collections::HashMap;
use std::time::Instant;

use crate::substrate::PeerId;

/// Deferred action for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Tear down the substrate session after the disconnect grace period
    CloseSession,
    /// Give up on a CONNECT that was never accepted
    ConnectTimeout,
    /// Drop an accepted session whose peer never sent CONNECT
    IdleTimeout,
}

#[derive(Debug, Clone, Copy)]
struct Task {
    kind: TaskKind,
    deadline: Instant,
}

/// Cancellable tasks keyed by peer
#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: HashMap<PeerId, Task>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `kind` for `peer` at `deadline`, replacing any pending task
    ///
    /// Returns the replaced task kind, if any.
    pub fn schedule(&mut self, peer: PeerId, kind: TaskKind, deadline: Instant) -> Option<TaskKind> {
        self.tasks
            .insert(peer, Task { kind, deadline })
            .map(|old| old.kind)
    }

    /// Cancel whatever is pending for `peer`
    pub fn cancel(&mut self, peer: PeerId) -> Option<TaskKind> {
        self.tasks.remove(&peer).map(|t| t.kind)
    }

    /// Cancel the task for `peer` only if it is of `kind`
    pub fn cancel_kind(&mut self, peer: PeerId, kind: TaskKind) -> bool {
        if self.pending(peer) == Some(kind) {
            self.tasks.remove(&peer);
            true
        } else {
            false
        }
    }

    /// Kind of task pending for `peer`
    pub fn pending(&self, peer: PeerId) -> Option<TaskKind> {
        self.tasks.get(&peer).map(|t| t.kind)
    }

    /// Remove and return every task whose deadline has passed, earliest first
    pub fn take_due(&mut self, now: Instant) -> Vec<(PeerId, TaskKind)> {
        let mut due: Vec<(PeerId, Task)> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(peer, t)| (*peer, *t))
            .collect();

        due.sort_by_key(|(_, t)| t.deadline);

        for (peer, _) in &due {
            self.tasks.remove(peer);
        }

        due.into_iter().map(|(peer, t)| (peer, t.kind)).collect()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.values().map(|t| t.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
