//! Pure participant state machine
//!
//! Per item: `free -> pending -> {consumed, free}`. An item is pending while
//! this node has voted yes on a task whose outcome it has not applied yet.

use std::collections::BTreeSet;

use crate::log::{ListTable, MapTable};
use crate::messages::ItemName;

/// Names of the participant's logged tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParticipantTable {
    Pending,
    Tasks,
    Approved,
}

impl ParticipantTable {
    pub const ALL: [Self; 3] = [Self::Pending, Self::Tasks, Self::Approved];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Tasks => "tasks",
            Self::Approved => "approved",
        }
    }
}

/// Why an item forces a no vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    Missing(ItemName),
    Reserved(ItemName),
    /// EXEC or ABORT was applied while the approval was outstanding.
    Decided,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantTables {
    /// Items reserved by a yes vote.
    pending: ListTable,
    /// Items each artifact asked this node about.
    tasks: MapTable,
    /// Artifacts this node voted yes on and has not applied yet.
    approved: ListTable,
    dirty: Vec<ParticipantTable>,
}

impl ParticipantTables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_snapshots(pending: ListTable, tasks: MapTable, approved: ListTable) -> Self {
        Self {
            pending,
            tasks,
            approved,
            dirty: Vec::new(),
        }
    }

    #[must_use]
    pub fn pending(&self) -> &ListTable {
        &self.pending
    }

    #[must_use]
    pub fn tasks(&self) -> &MapTable {
        &self.tasks
    }

    #[must_use]
    pub fn approved(&self) -> &ListTable {
        &self.approved
    }

    #[must_use]
    pub fn items(&self, artifact: &str) -> Option<&BTreeSet<ItemName>> {
        self.tasks.get(artifact)
    }

    fn mark(&mut self, table: ParticipantTable) {
        if !self.dirty.contains(&table) {
            self.dirty.push(table);
        }
    }

    fn mark_ahead_of(&mut self, table: ParticipantTable, later: ParticipantTable) {
        if self.dirty.contains(&table) {
            return;
        }
        match self.dirty.iter().position(|t| *t == later) {
            Some(i) => self.dirty.insert(i, table),
            None => self.dirty.push(table),
        }
    }

    pub fn mark_dirty(&mut self, tables: &[ParticipantTable]) {
        for &table in tables {
            self.mark(table);
        }
    }

    pub fn take_dirty(&mut self) -> Vec<ParticipantTable> {
        std::mem::take(&mut self.dirty)
    }

    /// Remember which items `artifact` covers, whatever this node votes.
    pub fn record_task(&mut self, artifact: &str, items: &[ItemName]) {
        let items: BTreeSet<ItemName> = items.iter().cloned().collect();
        if self.tasks.get(artifact) != Some(&items) {
            self.tasks.insert(artifact.to_owned(), items);
            self.mark(ParticipantTable::Tasks);
        }
    }

    /// First item that rules out a yes vote: one that `exists` does not know,
    /// or one already reserved.
    pub fn check(&self, items: &[ItemName], exists: impl Fn(&str) -> bool) -> Result<(), Refusal> {
        for item in items {
            if !exists(item.as_str()) {
                return Err(Refusal::Missing(item.clone()));
            }
            if self.pending.contains(item) {
                return Err(Refusal::Reserved(item.clone()));
            }
        }
        Ok(())
    }

    /// Reserve `items` for `artifact`. Fails without side effects if any item
    /// was reserved in the meantime, or if the task was already decided.
    ///
    /// The approval is logged before the reservation: `release` only frees
    /// items of approved artifacts, so a reservation must never reach the log
    /// without one.
    pub fn reserve(&mut self, artifact: &str, items: &[ItemName]) -> Result<(), Refusal> {
        if !self.tasks.contains_key(artifact) {
            return Err(Refusal::Decided);
        }
        if let Some(item) = items.iter().find(|item| self.pending.contains(*item)) {
            return Err(Refusal::Reserved(item.clone()));
        }
        if self.approved.insert(artifact.to_owned()) {
            self.mark_ahead_of(ParticipantTable::Approved, ParticipantTable::Pending);
        }
        self.pending.extend(items.iter().cloned());
        self.mark(ParticipantTable::Pending);
        Ok(())
    }

    /// Apply the decision for `artifact`: drop its reservation if this node
    /// voted yes on it, then forget the task. Returns false when nothing was
    /// reserved.
    ///
    /// The task record goes last so a crash part way through replays with
    /// enough state to release again.
    pub fn release(&mut self, artifact: &str) -> bool {
        let released = self.approved.remove(artifact);
        if released {
            if let Some(items) = self.tasks.get(artifact) {
                let before = self.pending.len();
                self.pending.retain(|item| !items.contains(item));
                if self.pending.len() != before {
                    self.mark(ParticipantTable::Pending);
                }
            }
            self.mark(ParticipantTable::Approved);
        }
        if self.tasks.remove(artifact).is_some() {
            self.mark(ParticipantTable::Tasks);
        }
        released
    }
}
