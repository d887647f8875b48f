//! Failure-recovery bookkeeping
//!
//! Every acquired resource pushes a rollback action onto a single undo
//! stack the moment it is acquired, before anything that could fail next.
//! Teardown pops the stack in reverse acquisition order, so sidecars stop
//! before tuning is undone and the cache partition is dismantled last.

use crate::system::SidecarHandle;
use crate::tune::RaplDomainKind;

/// One undoable acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackAction {
    /// Remove the resctrl groups and restore the full root mask
    CachePartition,
    /// Restore per-CPU governor and frequency limits
    Frequency,
    /// Restore a RAPL domain's power limit
    PowerCap(RaplDomainKind),
    /// Restore turbo/boost knobs
    Turbo,
    /// Restore idle-state availability
    IdleStates,
    /// Restore uncore frequency limits
    Uncore,
    /// Restore prefetcher register values
    Prefetcher,
    /// Stop a supervised sidecar process
    Sidecar(SidecarHandle),
}

/// Undo stack for everything the session has acquired so far
#[derive(Debug, Default)]
pub struct RecoveryCoordinator {
    stack: Vec<RollbackAction>,
}

impl RecoveryCoordinator {
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acquisition
    pub fn push(&mut self, action: RollbackAction) {
        self.stack.push(action);
    }

    /// Whether anything is outstanding
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Take every recorded action, most recent first.
    ///
    /// The stack is left empty, so running teardown twice unwinds nothing
    /// the second time.
    pub fn drain_reverse(&mut self) -> Vec<RollbackAction> {
        let mut actions = std::mem::take(&mut self.stack);
        actions.reverse();
        actions
    }
}
