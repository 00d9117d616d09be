//! Per-batch registry of pending changes
//!
//! Coalesces overlapping changes as they are registered so that a coarser
//! restart/delete subsumes any finer one below it. No two entries in the
//! registry ever target the same entity or lie one below the other.

use tracing::debug;

use crate::reconcile::change::{ChangeAction, ChangeOperation, ChangeTarget};

/// A change accepted into the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub operation: ChangeOperation,
    pub target: ChangeTarget,
    pub action: ChangeAction,
}

/// What registering a change did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Replaced the entry for the same entity (last writer wins)
    Overwrote,
    /// Already covered by a coarser entry
    Discarded,
    /// Added; `absorbed` finer entries were dropped in its favour
    Added { absorbed: usize },
}

#[derive(Debug, Default)]
pub struct ChangeRegistry {
    entries: Vec<PendingChange>,
}

impl ChangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, change: PendingChange) -> Registration {
        let mut absorbed = 0;
        let mut i = 0;

        while i < self.entries.len() {
            let registered = &self.entries[i];

            if registered.target.same_entity(&change.target) {
                debug!(
                    "Change of {} '{}' overwrites pending {}",
                    change.target.level,
                    change.target.name(),
                    registered.action
                );
                self.entries[i] = change;
                return Registration::Overwrote;
            }

            if registered.target.covers(&change.target) {
                debug!(
                    "Change of {} '{}' covered by pending change of {} '{}'",
                    change.target.level,
                    change.target.name(),
                    registered.target.level,
                    registered.target.name()
                );
                return Registration::Discarded;
            }

            if change.target.covers(&registered.target) {
                debug!(
                    "Pending change of {} '{}' absorbed by {} '{}'",
                    registered.target.level,
                    registered.target.name(),
                    change.target.level,
                    change.target.name()
                );
                self.entries.remove(i);
                absorbed += 1;
                continue;
            }

            i += 1;
        }

        self.entries.push(change);
        Registration::Added { absorbed }
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[PendingChange] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<PendingChange> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
