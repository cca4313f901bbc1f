//! Coordinator runtime
//!
//! Wraps [`CoordinatorTables`] with a mutex and the durable log, and runs one
//! tokio task per in-flight commit: a vote-wait loop, followed by an
//! EXEC/ABORT resend loop that only ends once every participant has
//! acknowledged.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use futures::{Stream, StreamExt};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::codec;
use crate::config::CommitConfig;
use crate::core::coordinator::{
    AckOutcome, CoordinatorTable, CoordinatorTables, Decision, Settle, TaskPhase, VoteOutcome,
};
use crate::error::{CommitError, LogError, StorageError};
use crate::log::{DurableLog, Snapshot};
use crate::messages::{ArtifactId, Envelope, ItemName, Message, NodeId};
use crate::traits::{ArtifactStore, Transport};

struct State {
    tables: CoordinatorTables,
    log: DurableLog,
}

impl State {
    /// Append a snapshot of every table mutated since the last call.
    fn persist(&mut self) -> Result<(), Report<LogError>> {
        let dirty = self.tables.take_dirty();
        for (i, &table) in dirty.iter().enumerate() {
            let snapshot = Snapshot::Map(self.tables.table(table));
            if let Err(report) = self.log.append(table.name(), snapshot) {
                self.tables.mark_dirty(&dirty[i..]);
                return Err(report);
            }
        }
        Ok(())
    }
}

struct Inner<T, A> {
    id: NodeId,
    transport: T,
    artifacts: A,
    config: CommitConfig,
    state: Mutex<State>,
}

/// Drives commits across participants.
///
/// Cheap to clone; all clones share the same tables.
pub struct Coordinator<T, A> {
    inner: Arc<Inner<T, A>>,
}

impl<T, A> Clone for Coordinator<T, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, A> Coordinator<T, A>
where
    T: Transport,
    A: ArtifactStore,
{
    /// Replay the log at `log_path` and resume every decided task.
    ///
    /// Tasks that were still collecting votes are aborted. A fresh log
    /// starts empty.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn recover(
        id: impl Into<NodeId>,
        log_path: impl AsRef<Path>,
        transport: T,
        artifacts: A,
        config: CommitConfig,
    ) -> Result<Self, Report<LogError>> {
        let id = id.into();
        let log_path = log_path.as_ref();
        let names = CoordinatorTable::ALL.map(CoordinatorTable::name);
        let replay = DurableLog::replay(log_path, &names)?;

        let mut tables = CoordinatorTables::from_snapshots(
            replay.map(CoordinatorTable::Tasks.name()),
            replay.map(CoordinatorTable::Voting.name()),
            replay.map(CoordinatorTable::Executing.name()),
            replay.map(CoordinatorTable::Aborting.name()),
        );
        let resumed = tables.recover();

        let mut state = State {
            tables,
            log: DurableLog::open(log_path)?,
        };
        state.persist()?;

        info!(
            %id,
            log = %log_path.display(),
            in_flight = ?state.tables.in_flight(),
            "coordinator recovered"
        );

        let coordinator = Self {
            inner: Arc::new(Inner {
                id,
                transport,
                artifacts,
                config,
                state: Mutex::new(state),
            }),
        };

        for (artifact, decision) in resumed {
            debug!(%artifact, ?decision, "resuming decided task");
            coordinator.spawn_decision(artifact, decision);
        }

        Ok(coordinator)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    /// Where `artifact` is in the protocol, if it was ever started.
    #[must_use]
    pub fn phase(&self, artifact: &str) -> Option<TaskPhase> {
        self.lock().tables.phase(artifact)
    }

    /// Start committing `artifact` built from the items in `owners`.
    ///
    /// Each owner is `"address:item"`. The task is durably created, then the
    /// payload staged, before this returns; voting and the decision run in
    /// the background. The outcome is only observable through the artifact
    /// store: the artifact is published on commit and never appears on abort.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn start_commit<I>(
        &self,
        artifact: impl Into<ArtifactId>,
        payload: Bytes,
        owners: I,
    ) -> Result<(), Report<CommitError>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let artifact = artifact.into();
        if !codec::is_valid_identifier(&artifact) {
            return Err(Report::new(CommitError)
                .attach(format!("invalid artifact id {artifact:?}")));
        }
        let by_owner = group_owners(owners)?;
        let participants: BTreeSet<NodeId> = by_owner.keys().cloned().collect();

        {
            let mut state = self.lock();
            if state.tables.contains(&artifact) {
                return Err(Report::new(CommitError)
                    .attach(format!("artifact {artifact:?} was already committed or is in progress")));
            }
            state.tables.create(artifact.clone(), participants);
            if let Err(report) = state.persist() {
                drop(state);
                self.abort_unstarted(artifact);
                return Err(report.change_context(CommitError));
            }
        }

        // Logged first: a crash before staging leaves nothing behind that
        // recovery's abort would not discard.
        let staged = self
            .inner
            .artifacts
            .stage(&artifact, &payload)
            .change_context(CommitError)
            .attach_with(|| format!("staging payload for {artifact}"));
        if let Err(report) = staged {
            self.abort_unstarted(artifact);
            return Err(report);
        }

        info!(%artifact, participants = by_owner.len(), "commit started");

        let votes: Vec<Envelope> = by_owner
            .into_iter()
            .map(|(owner, items)| {
                let vote = Message::Vote {
                    artifact: artifact.clone(),
                    items: items.into_iter().collect(),
                    payload: payload.clone(),
                };
                Envelope::new(owner, &vote)
            })
            .collect();

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(report) = this.drive_vote(artifact.clone(), votes).await {
                error!(?report, %artifact, "vote phase failed");
            }
        });

        Ok(())
    }

    /// Send the votes, then wait for the task to leave the vote phase. If the
    /// window closes first, the task is aborted.
    #[instrument(skip(self, votes), fields(coordinator = %self.inner.id))]
    async fn drive_vote(
        &self,
        artifact: ArtifactId,
        votes: Vec<Envelope>,
    ) -> Result<(), Report<StorageError>> {
        for vote in votes {
            trace!(to = %vote.to, "sending VOTE");
            self.inner.transport.send(vote);
        }

        let config = &self.inner.config;
        for _ in 0..config.vote_poll_attempts {
            tokio::time::sleep(config.vote_poll_interval).await;
            if self.lock().tables.decision(&artifact).is_some() {
                break;
            }
        }

        let decision = {
            let mut state = self.lock();
            let decision = state.tables.expire_vote(&artifact);
            state.persist().change_context(StorageError)?;
            decision
        };

        match decision {
            Some(decision) => {
                debug!(?decision, "vote phase over");
                self.drive_decision(artifact, decision).await
            }
            None => Ok(()),
        }
    }

    /// Abort a task whose votes were never sent, discarding anything staged.
    fn abort_unstarted(&self, artifact: ArtifactId) {
        {
            let mut state = self.lock();
            state.tables.expire_vote(&artifact);
            if let Err(report) = state.persist() {
                error!(?report, %artifact, "failed to log abort of unstarted task");
            }
        }
        self.spawn_decision(artifact, Decision::Abort);
    }

    fn spawn_decision(&self, artifact: ArtifactId, decision: Decision) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(report) = this.drive_decision(artifact.clone(), decision).await {
                error!(?report, %artifact, ?decision, "decision phase failed");
            }
        });
    }

    /// Publish or discard the payload, then send EXEC or ABORT until every
    /// participant has acknowledged. Never gives up.
    #[instrument(skip(self), fields(coordinator = %self.inner.id))]
    async fn drive_decision(
        &self,
        artifact: ArtifactId,
        decision: Decision,
    ) -> Result<(), Report<StorageError>> {
        let artifacts = &self.inner.artifacts;
        let message = match decision {
            Decision::Execute => {
                artifacts
                    .publish(&artifact)
                    .change_context(StorageError)
                    .attach_with(|| format!("publishing {artifact}"))?;
                Message::Exec {
                    artifact: artifact.clone(),
                }
            }
            Decision::Abort => {
                artifacts
                    .discard(&artifact)
                    .change_context(StorageError)
                    .attach_with(|| format!("discarding staged {artifact}"))?;
                Message::Abort {
                    artifact: artifact.clone(),
                }
            }
        };

        let mut targets = match self.lock().tables.participants(&artifact) {
            Some(participants) => participants.iter().cloned().collect::<Vec<_>>(),
            None => return Ok(()),
        };

        loop {
            for target in targets {
                trace!(to = %target, kind = %message.kind(), "sending decision");
                self.inner.transport.send(Envelope::new(target, &message));
            }

            tokio::time::sleep(self.inner.config.resend_interval).await;

            let settled = {
                let mut state = self.lock();
                let settled = state.tables.settle(&artifact);
                if settled == Settle::Completed {
                    state.persist().change_context(StorageError)?;
                }
                settled
            };

            match settled {
                Settle::NotActive => return Ok(()),
                Settle::Completed => {
                    info!(?decision, "task finished");
                    return Ok(());
                }
                Settle::Waiting { missing } => {
                    trace!(?missing, "resending to participants without ACK");
                    targets = missing;
                }
            }
        }
    }

    /// Route one inbound payload.
    pub fn handle(&self, body: &Bytes) {
        let message = match codec::decode(body) {
            Ok(message) => message,
            Err(report) => {
                warn!(?report, "dropping malformed message");
                return;
            }
        };

        match message {
            Message::VoteResponse {
                artifact,
                participant,
                approve,
            } => self.on_vote(&artifact, &participant, approve),
            Message::Ack {
                artifact,
                participant,
            } => self.on_ack(&artifact, &participant),
            other => warn!(kind = %other.kind(), artifact = other.artifact(), "unexpected message at coordinator"),
        }
    }

    fn on_vote(&self, artifact: &str, participant: &str, approve: bool) {
        let mut state = self.lock();
        let outcome = state.tables.record_vote(artifact, participant, approve);
        match outcome {
            VoteOutcome::NotVoting => {
                debug!(artifact, participant, approve, "vote for task not in vote phase");
            }
            VoteOutcome::Stranger => {
                warn!(artifact, participant, "vote from node outside the task");
            }
            VoteOutcome::Recorded | VoteOutcome::Duplicate => {
                trace!(artifact, participant, ?outcome, "yes vote");
            }
            VoteOutcome::Decided(decision) => {
                debug!(artifact, participant, ?decision, "vote phase decided");
            }
        }
        if let Err(report) = state.persist() {
            error!(?report, artifact, "failed to log vote");
        }
    }

    fn on_ack(&self, artifact: &str, participant: &str) {
        let mut state = self.lock();
        match state.tables.record_ack(artifact, participant) {
            AckOutcome::Recorded => trace!(artifact, participant, "ACK"),
            AckOutcome::Duplicate | AckOutcome::NotActive => {
                trace!(artifact, participant, "late or duplicate ACK");
            }
            AckOutcome::Stranger => warn!(artifact, participant, "ACK from node outside the task"),
        }
        if let Err(report) = state.persist() {
            error!(?report, artifact, "failed to log ACK");
        }
    }

    /// Dispatch inbound payloads until the stream ends.
    #[instrument(skip_all, fields(coordinator = %self.inner.id))]
    pub async fn serve(self, inbound: impl Stream<Item = Bytes>) {
        debug!("coordinator dispatcher started");
        let mut inbound = pin!(inbound);
        while let Some(body) = inbound.next().await {
            self.handle(&body);
        }
        debug!("inbound stream closed");
    }
}

/// Group `"address:item"` pairs by address.
fn group_owners<I>(owners: I) -> Result<BTreeMap<NodeId, BTreeSet<ItemName>>, Report<CommitError>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut by_owner: BTreeMap<NodeId, BTreeSet<ItemName>> = BTreeMap::new();
    for pair in owners {
        let pair = pair.as_ref();
        let Some((owner, item)) = pair.split_once(':') else {
            return Err(Report::new(CommitError).attach(format!("owner pair {pair:?} has no ':'")));
        };
        if !codec::is_valid_identifier(owner) || !codec::is_valid_identifier(item) {
            return Err(Report::new(CommitError)
                .attach(format!("owner pair {pair:?} has an empty or reserved field")));
        }
        by_owner
            .entry(owner.to_owned())
            .or_default()
            .insert(item.to_owned());
    }
    if by_owner.is_empty() {
        return Err(Report::new(CommitError).attach("commit needs at least one item"));
    }
    Ok(by_owner)
}
