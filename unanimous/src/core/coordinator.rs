//! Pure coordinator state machine
//!
//! A task moves `Voting -> {Executing, Aborting} -> Finished`. The master
//! `tasks` table maps every artifact ever started to its participant set;
//! each phase table maps an in-flight artifact to the participants that have
//! voted yes (`voting`) or acknowledged the decision (`executing`,
//! `aborting`).

use std::collections::{BTreeMap, BTreeSet};

use crate::log::MapTable;
use crate::messages::{ArtifactId, NodeId};

/// Names of the coordinator's logged tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoordinatorTable {
    Tasks,
    Voting,
    Executing,
    Aborting,
}

impl CoordinatorTable {
    pub const ALL: [Self; 4] = [Self::Tasks, Self::Voting, Self::Executing, Self::Aborting];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Voting => "voting",
            Self::Executing => "executing",
            Self::Aborting => "aborting",
        }
    }
}

/// Where a task currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPhase {
    Voting,
    Executing,
    Aborting,
    /// Every participant acknowledged the decision.
    Finished,
}

/// Outcome of the vote phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Execute,
    Abort,
}

/// Result of recording a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The task is not in the vote phase (late or unknown vote).
    NotVoting,
    /// The sender is not a participant of this task.
    Stranger,
    /// A yes vote was recorded; other votes are outstanding.
    Recorded,
    /// This yes vote was already recorded.
    Duplicate,
    /// The vote phase ended with this decision.
    Decided(Decision),
}

/// Result of recording an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The task is not executing or aborting.
    NotActive,
    /// The sender is not a participant of this task.
    Stranger,
    Recorded,
    Duplicate,
}

/// Progress of a decided task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settle {
    /// The task is not executing or aborting.
    NotActive,
    /// All participants acknowledged; the phase entry was just cleared.
    Completed,
    /// These participants have not acknowledged yet.
    Waiting { missing: Vec<NodeId> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorTables {
    tasks: MapTable,
    voting: MapTable,
    executing: MapTable,
    aborting: MapTable,
    dirty: Vec<CoordinatorTable>,
}

impl CoordinatorTables {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from replayed snapshots.
    #[must_use]
    pub fn from_snapshots(
        tasks: MapTable,
        voting: MapTable,
        executing: MapTable,
        aborting: MapTable,
    ) -> Self {
        Self {
            tasks,
            voting,
            executing,
            aborting,
            dirty: Vec::new(),
        }
    }

    #[must_use]
    pub fn table(&self, table: CoordinatorTable) -> &MapTable {
        match table {
            CoordinatorTable::Tasks => &self.tasks,
            CoordinatorTable::Voting => &self.voting,
            CoordinatorTable::Executing => &self.executing,
            CoordinatorTable::Aborting => &self.aborting,
        }
    }

    fn mark(&mut self, table: CoordinatorTable) {
        if !self.dirty.contains(&table) {
            self.dirty.push(table);
        }
    }

    /// Mark `table`, placing it before `later` if that is already waiting to
    /// be written.
    fn mark_ahead_of(&mut self, table: CoordinatorTable, later: CoordinatorTable) {
        if self.dirty.contains(&table) {
            return;
        }
        match self.dirty.iter().position(|t| *t == later) {
            Some(i) => self.dirty.insert(i, table),
            None => self.dirty.push(table),
        }
    }

    /// Re-mark tables whose snapshot could not be written.
    pub fn mark_dirty(&mut self, tables: &[CoordinatorTable]) {
        for &table in tables {
            self.mark(table);
        }
    }

    /// Drain the tables mutated since the last call, in mutation order.
    pub fn take_dirty(&mut self) -> Vec<CoordinatorTable> {
        std::mem::take(&mut self.dirty)
    }

    #[must_use]
    pub fn contains(&self, artifact: &str) -> bool {
        self.tasks.contains_key(artifact)
    }

    #[must_use]
    pub fn participants(&self, artifact: &str) -> Option<&BTreeSet<NodeId>> {
        self.tasks.get(artifact)
    }

    #[must_use]
    pub fn phase(&self, artifact: &str) -> Option<TaskPhase> {
        if !self.tasks.contains_key(artifact) {
            None
        } else if self.executing.contains_key(artifact) {
            Some(TaskPhase::Executing)
        } else if self.aborting.contains_key(artifact) {
            Some(TaskPhase::Aborting)
        } else if self.voting.contains_key(artifact) {
            Some(TaskPhase::Voting)
        } else {
            Some(TaskPhase::Finished)
        }
    }

    /// Create a task in the vote phase. Returns false if the artifact id is
    /// already known.
    ///
    /// The vote entry is logged before the task record. A task record with
    /// no phase entry reads as finished, while a vote entry with no task
    /// record is dropped on recovery.
    pub fn create(&mut self, artifact: ArtifactId, participants: BTreeSet<NodeId>) -> bool {
        if self.tasks.contains_key(&artifact) {
            return false;
        }
        self.voting.insert(artifact.clone(), BTreeSet::new());
        self.mark(CoordinatorTable::Voting);
        self.tasks.insert(artifact, participants);
        self.mark(CoordinatorTable::Tasks);
        true
    }

    /// Leave the vote phase. The decision table is always logged ahead of
    /// the vote table, so a crash between the two appends replays with the
    /// decision intact.
    fn decide(&mut self, artifact: &str, decision: Decision) {
        let (table, name) = match decision {
            Decision::Execute => (&mut self.executing, CoordinatorTable::Executing),
            Decision::Abort => (&mut self.aborting, CoordinatorTable::Aborting),
        };
        if !table.contains_key(artifact) {
            table.insert(artifact.to_owned(), BTreeSet::new());
            self.mark_ahead_of(name, CoordinatorTable::Voting);
        }
        if self.voting.remove(artifact).is_some() {
            self.mark(CoordinatorTable::Voting);
        }
    }

    pub fn record_vote(&mut self, artifact: &str, from: &str, approve: bool) -> VoteOutcome {
        let Some(participants) = self.tasks.get(artifact) else {
            return VoteOutcome::NotVoting;
        };
        let Some(votes) = self.voting.get_mut(artifact) else {
            return VoteOutcome::NotVoting;
        };
        if !participants.contains(from) {
            return VoteOutcome::Stranger;
        }

        if !approve {
            self.decide(artifact, Decision::Abort);
            return VoteOutcome::Decided(Decision::Abort);
        }

        let inserted = votes.insert(from.to_owned());
        if *votes == *participants {
            self.decide(artifact, Decision::Execute);
            return VoteOutcome::Decided(Decision::Execute);
        }

        if inserted {
            self.mark(CoordinatorTable::Voting);
            VoteOutcome::Recorded
        } else {
            VoteOutcome::Duplicate
        }
    }

    /// The vote window closed. A task still voting is aborted, as if a no
    /// vote had arrived. Returns the decision the task ended up with, or
    /// `None` if it is no longer in flight.
    pub fn expire_vote(&mut self, artifact: &str) -> Option<Decision> {
        if self.voting.contains_key(artifact) && self.decision(artifact).is_none() {
            self.decide(artifact, Decision::Abort);
        }
        self.decision(artifact)
    }

    /// The decision of an executing or aborting task.
    #[must_use]
    pub fn decision(&self, artifact: &str) -> Option<Decision> {
        if self.executing.contains_key(artifact) {
            Some(Decision::Execute)
        } else if self.aborting.contains_key(artifact) {
            Some(Decision::Abort)
        } else {
            None
        }
    }

    pub fn record_ack(&mut self, artifact: &str, from: &str) -> AckOutcome {
        let (acks, name) = if let Some(acks) = self.aborting.get_mut(artifact) {
            (acks, CoordinatorTable::Aborting)
        } else if let Some(acks) = self.executing.get_mut(artifact) {
            (acks, CoordinatorTable::Executing)
        } else {
            return AckOutcome::NotActive;
        };
        if !self
            .tasks
            .get(artifact)
            .is_some_and(|participants| participants.contains(from))
        {
            return AckOutcome::Stranger;
        }
        if acks.insert(from.to_owned()) {
            self.mark(name);
            AckOutcome::Recorded
        } else {
            AckOutcome::Duplicate
        }
    }

    /// Clear the phase entry once every participant has acknowledged,
    /// otherwise report who is missing.
    pub fn settle(&mut self, artifact: &str) -> Settle {
        let (table, name) = match self.decision(artifact) {
            Some(Decision::Execute) => (&mut self.executing, CoordinatorTable::Executing),
            Some(Decision::Abort) => (&mut self.aborting, CoordinatorTable::Aborting),
            None => return Settle::NotActive,
        };
        let acks = table.get(artifact).cloned().unwrap_or_default();
        let missing: Vec<NodeId> = self
            .tasks
            .get(artifact)
            .into_iter()
            .flatten()
            .filter(|p| !acks.contains(*p))
            .cloned()
            .collect();

        if missing.is_empty() {
            table.remove(artifact);
            self.mark(name);
            Settle::Completed
        } else {
            Settle::Waiting { missing }
        }
    }

    /// Resolve state replayed after a crash.
    ///
    /// Tasks caught in the vote phase are aborted, unless the decision was
    /// already logged. Vote entries of tasks that were never recorded are
    /// dropped. The vote table is cleared. Returns every task whose decision
    /// still has to be driven to completion.
    pub fn recover(&mut self) -> Vec<(ArtifactId, Decision)> {
        let voting = std::mem::take(&mut self.voting);
        for artifact in voting.into_keys() {
            if self.tasks.contains_key(&artifact) && self.decision(&artifact).is_none() {
                self.aborting.insert(artifact, BTreeSet::new());
            }
        }
        self.mark(CoordinatorTable::Aborting);
        self.mark(CoordinatorTable::Voting);

        let executing = self
            .executing
            .keys()
            .map(|a| (a.clone(), Decision::Execute));
        let aborting = self.aborting.keys().map(|a| (a.clone(), Decision::Abort));
        executing.chain(aborting).collect()
    }

    /// Number of tasks per phase, for logging.
    #[must_use]
    pub fn in_flight(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            (CoordinatorTable::Voting.name(), self.voting.len()),
            (CoordinatorTable::Executing.name(), self.executing.len()),
            (CoordinatorTable::Aborting.name(), self.aborting.len()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| (*id).to_owned()).collect()
    }

    fn two_node_task() -> CoordinatorTables {
        let mut tables = CoordinatorTables::new();
        assert!(tables.create("pic1".into(), nodes(&["n1", "n2"])));
        tables.take_dirty();
        tables
    }

    #[test]
    fn create_logs_voting_then_tasks() {
        let mut tables = CoordinatorTables::new();
        assert!(tables.create("pic1".into(), nodes(&["n1"])));
        assert_eq!(
            tables.take_dirty(),
            vec![CoordinatorTable::Voting, CoordinatorTable::Tasks]
        );
        assert_eq!(tables.phase("pic1"), Some(TaskPhase::Voting));
        assert!(!tables.create("pic1".into(), nodes(&["n2"])));
    }

    #[test]
    fn unanimous_yes_executes() {
        let mut tables = two_node_task();
        assert_eq!(tables.record_vote("pic1", "n1", true), VoteOutcome::Recorded);
        assert_eq!(tables.record_vote("pic1", "n1", true), VoteOutcome::Duplicate);
        assert_eq!(tables.phase("pic1"), Some(TaskPhase::Voting));
        assert_eq!(
            tables.record_vote("pic1", "n2", true),
            VoteOutcome::Decided(Decision::Execute)
        );
        assert_eq!(tables.phase("pic1"), Some(TaskPhase::Executing));
        assert!(tables.table(CoordinatorTable::Voting).is_empty());
    }

    #[test]
    fn single_no_aborts_despite_other_yes() {
        let mut tables = two_node_task();
        tables.record_vote("pic1", "n1", true);
        assert_eq!(
            tables.record_vote("pic1", "n2", false),
            VoteOutcome::Decided(Decision::Abort)
        );
        assert_eq!(tables.phase("pic1"), Some(TaskPhase::Aborting));

        // Late votes are ignored once decided.
        assert_eq!(tables.record_vote("pic1", "n2", true), VoteOutcome::NotVoting);
        assert_eq!(tables.phase("pic1"), Some(TaskPhase::Aborting));
    }

    #[test]
    fn decision_logged_before_vote_entry_dropped() {
        let mut tables = two_node_task();
        tables.record_vote("pic1", "n1", false);
        assert_eq!(
            tables.take_dirty(),
            vec![CoordinatorTable::Aborting, CoordinatorTable::Voting]
        );
    }

    #[test]
    fn execute_decision_logged_before_vote_entry_dropped() {
        let mut tables = two_node_task();
        tables.record_vote("pic1", "n1", true);
        tables.take_dirty();
        tables.record_vote("pic1", "n2", true);
        assert_eq!(
            tables.take_dirty(),
            vec![CoordinatorTable::Executing, CoordinatorTable::Voting]
        );

        // Same order when the earlier yes was never written out.
        let mut tables = two_node_task();
        tables.record_vote("pic1", "n1", true);
        tables.record_vote("pic1", "n2", true);
        assert_eq!(
            tables.take_dirty(),
            vec![CoordinatorTable::Executing, CoordinatorTable::Voting]
        );
    }

    #[test]
    fn expiry_logs_abort_before_vote_entry_dropped() {
        let mut tables = two_node_task();
        tables.record_vote("pic1", "n1", true);
        tables.expire_vote("pic1");
        assert_eq!(
            tables.take_dirty(),
            vec![CoordinatorTable::Aborting, CoordinatorTable::Voting]
        );
    }

    #[test]
    fn votes_from_strangers_are_ignored() {
        let mut tables = two_node_task();
        assert_eq!(tables.record_vote("pic1", "n9", false), VoteOutcome::Stranger);
        assert_eq!(tables.phase("pic1"), Some(TaskPhase::Voting));
        assert_eq!(tables.record_vote("nope", "n1", true), VoteOutcome::NotVoting);
    }

    #[test]
    fn expiry_aborts_only_undecided_tasks() {
        let mut tables = two_node_task();
        tables.record_vote("pic1", "n1", true);
        assert_eq!(tables.expire_vote("pic1"), Some(Decision::Abort));

        let mut tables = two_node_task();
        tables.record_vote("pic1", "n1", true);
        tables.record_vote("pic1", "n2", true);
        assert_eq!(tables.expire_vote("pic1"), Some(Decision::Execute));
    }

    #[test]
    fn settle_waits_for_every_ack() {
        let mut tables = two_node_task();
        tables.record_vote("pic1", "n1", true);
        tables.record_vote("pic1", "n2", true);

        assert_eq!(
            tables.settle("pic1"),
            Settle::Waiting {
                missing: vec!["n1".into(), "n2".into()]
            }
        );
        assert_eq!(tables.record_ack("pic1", "n2"), AckOutcome::Recorded);
        assert_eq!(tables.record_ack("pic1", "n2"), AckOutcome::Duplicate);
        assert_eq!(
            tables.settle("pic1"),
            Settle::Waiting {
                missing: vec!["n1".into()]
            }
        );
        tables.record_ack("pic1", "n1");
        assert_eq!(tables.settle("pic1"), Settle::Completed);
        assert_eq!(tables.phase("pic1"), Some(TaskPhase::Finished));
        assert_eq!(tables.settle("pic1"), Settle::NotActive);
        assert_eq!(tables.record_ack("pic1", "n1"), AckOutcome::NotActive);
    }

    #[test]
    fn recovery_aborts_voting_tasks() {
        let mut tables = CoordinatorTables::from_snapshots(
            MapTable::from([
                ("a".into(), nodes(&["n1"])),
                ("b".into(), nodes(&["n1"])),
                ("c".into(), nodes(&["n1"])),
            ]),
            MapTable::from([("a".into(), nodes(&["n1"])), ("b".into(), nodes(&[]))]),
            MapTable::from([("b".into(), nodes(&[])), ("c".into(), nodes(&["n1"]))]),
            MapTable::new(),
        );

        let resumed = tables.recover();
        assert_eq!(
            resumed,
            vec![
                ("b".into(), Decision::Execute),
                ("c".into(), Decision::Execute),
                ("a".into(), Decision::Abort),
            ]
        );
        assert!(tables.table(CoordinatorTable::Voting).is_empty());
        assert_eq!(
            tables.take_dirty(),
            vec![CoordinatorTable::Aborting, CoordinatorTable::Voting]
        );
        // Acks recorded before the crash survive.
        assert_eq!(tables.settle("c"), Settle::Completed);
    }

    #[test]
    fn recovery_drops_votes_of_unrecorded_tasks() {
        let mut tables = CoordinatorTables::from_snapshots(
            MapTable::new(),
            MapTable::from([("a".into(), nodes(&[]))]),
            MapTable::new(),
            MapTable::new(),
        );
        assert!(tables.recover().is_empty());
        assert_eq!(tables.phase("a"), None);
        assert!(tables.table(CoordinatorTable::Aborting).is_empty());
        assert!(tables.create("a".into(), nodes(&["n1"])));
    }
}
