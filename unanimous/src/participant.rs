//! Participant runtime
//!
//! Votes on the items this node owns, consumes them on EXEC and releases
//! them on ABORT. EXEC and ABORT are idempotent and always acknowledged, so
//! the coordinator can resend them as often as it likes.

use std::path::Path;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use futures::{Stream, StreamExt};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::codec;
use crate::core::participant::{ParticipantTable, ParticipantTables};
use crate::error::{LogError, ParticipantError};
use crate::log::{DurableLog, Snapshot};
use crate::messages::{ArtifactId, Envelope, ItemName, Message, NodeId};
use crate::traits::{Approver, ItemStore, Transport};

struct State {
    tables: ParticipantTables,
    log: DurableLog,
}

impl State {
    fn persist(&mut self) -> Result<(), Report<LogError>> {
        let dirty = self.tables.take_dirty();
        for (i, &table) in dirty.iter().enumerate() {
            let snapshot = match table {
                ParticipantTable::Pending => Snapshot::List(self.tables.pending()),
                ParticipantTable::Tasks => Snapshot::Map(self.tables.tasks()),
                ParticipantTable::Approved => Snapshot::List(self.tables.approved()),
            };
            if let Err(report) = self.log.append(table.name(), snapshot) {
                self.tables.mark_dirty(&dirty[i..]);
                return Err(report);
            }
        }
        Ok(())
    }
}

struct Inner<T, I, P> {
    id: NodeId,
    coordinator: NodeId,
    transport: T,
    items: I,
    approver: P,
    state: Mutex<State>,
}

/// One node owning a subset of items.
///
/// Cheap to clone; all clones share the same tables.
pub struct Participant<T, I, P> {
    inner: Arc<Inner<T, I, P>>,
}

impl<T, I, P> Clone for Participant<T, I, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, I, P> Participant<T, I, P>
where
    T: Transport,
    I: ItemStore,
    P: Approver,
{
    /// Replay the log at `log_path`. Nothing else happens on recovery: the
    /// coordinator resends EXEC or ABORT for anything left undecided.
    pub fn recover(
        id: impl Into<NodeId>,
        coordinator: impl Into<NodeId>,
        log_path: impl AsRef<Path>,
        transport: T,
        items: I,
        approver: P,
    ) -> Result<Self, Report<LogError>> {
        let id = id.into();
        let log_path = log_path.as_ref();
        let names = ParticipantTable::ALL.map(ParticipantTable::name);
        let replay = DurableLog::replay(log_path, &names)?;

        let tables = ParticipantTables::from_snapshots(
            replay.list(ParticipantTable::Pending.name()),
            replay.map(ParticipantTable::Tasks.name()),
            replay.list(ParticipantTable::Approved.name()),
        );
        info!(
            %id,
            log = %log_path.display(),
            pending = tables.pending().len(),
            tasks = tables.tasks().len(),
            "participant recovered"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                coordinator: coordinator.into(),
                transport,
                items,
                approver,
                state: Mutex::new(State {
                    tables,
                    log: DurableLog::open(log_path)?,
                }),
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    /// Whether `item` is reserved by an undecided yes vote.
    #[must_use]
    pub fn is_pending(&self, item: &str) -> bool {
        self.lock().tables.pending().contains(item)
    }

    /// Items reserved by undecided yes votes.
    #[must_use]
    pub fn pending(&self) -> Vec<ItemName> {
        self.lock().tables.pending().iter().cloned().collect()
    }

    /// Apply one message and return the reply for the coordinator.
    ///
    /// Returns `Ok(None)` for messages a participant does not act on. An
    /// error means nothing was acknowledged; the coordinator will resend.
    pub async fn process(&self, message: Message) -> Result<Option<Message>, Report<ParticipantError>> {
        let reply = match message {
            Message::Vote {
                artifact,
                items,
                payload,
            } => {
                let approve = self.vote(&artifact, &items, &payload).await?;
                Message::VoteResponse {
                    artifact,
                    participant: self.inner.id.clone(),
                    approve,
                }
            }
            Message::Exec { artifact } => {
                self.execute(&artifact)?;
                self.ack(artifact)
            }
            Message::Abort { artifact } => {
                self.abort(&artifact)?;
                self.ack(artifact)
            }
            other @ (Message::VoteResponse { .. } | Message::Ack { .. }) => {
                warn!(kind = %other.kind(), artifact = other.artifact(), "unexpected message at participant");
                return Ok(None);
            }
        };
        Ok(Some(reply))
    }

    fn ack(&self, artifact: ArtifactId) -> Message {
        Message::Ack {
            artifact,
            participant: self.inner.id.clone(),
        }
    }

    #[instrument(skip(self, items, payload), fields(participant = %self.inner.id))]
    async fn vote(
        &self,
        artifact: &str,
        items: &[ItemName],
        payload: &Bytes,
    ) -> Result<bool, Report<ParticipantError>> {
        let checked = {
            let mut state = self.lock();
            state.tables.record_task(artifact, items);
            state
                .persist()
                .change_context(ParticipantError)
                .attach_with(|| format!("recording task {artifact}"))?;
            state
                .tables
                .check(items, |item| self.inner.items.contains(item))
        };
        if let Err(refusal) = checked {
            debug!(?refusal, "voting no");
            return Ok(false);
        }

        if !self.inner.approver.approve(payload, items).await {
            debug!("approval declined, voting no");
            return Ok(false);
        }

        let mut state = self.lock();
        match state.tables.reserve(artifact, items) {
            Ok(()) => {
                state
                    .persist()
                    .change_context(ParticipantError)
                    .attach_with(|| format!("reserving items for {artifact}"))?;
                debug!(?items, "items reserved, voting yes");
                Ok(true)
            }
            Err(refusal) => {
                debug!(?refusal, "task changed while awaiting approval, voting no");
                Ok(false)
            }
        }
    }

    #[instrument(skip(self), fields(participant = %self.inner.id))]
    fn execute(&self, artifact: &str) -> Result<(), Report<ParticipantError>> {
        let Some(items) = self.lock().tables.items(artifact).cloned() else {
            debug!("EXEC for unknown or finished task, acknowledging");
            return Ok(());
        };

        for item in &items {
            self.inner
                .items
                .consume(item)
                .change_context(ParticipantError)
                .attach_with(|| format!("consuming {item} for {artifact}"))?;
        }

        let mut state = self.lock();
        let released = state.tables.release(artifact);
        state
            .persist()
            .change_context(ParticipantError)
            .attach_with(|| format!("releasing items of executed {artifact}"))?;
        debug!(?items, released, "executed");
        Ok(())
    }

    #[instrument(skip(self), fields(participant = %self.inner.id))]
    fn abort(&self, artifact: &str) -> Result<(), Report<ParticipantError>> {
        let mut state = self.lock();
        if state.tables.items(artifact).is_none() {
            debug!("ABORT for unknown or finished task, acknowledging");
        }
        let released = state.tables.release(artifact);
        state
            .persist()
            .change_context(ParticipantError)
            .attach_with(|| format!("releasing items of aborted {artifact}"))?;
        debug!(released, "aborted");
        Ok(())
    }

    /// Decode, apply and answer one inbound payload.
    pub async fn handle(&self, body: Bytes) -> Result<(), Report<ParticipantError>> {
        let message = codec::decode(&body).change_context(ParticipantError)?;
        trace!(kind = %message.kind(), artifact = message.artifact(), "received");
        if let Some(reply) = self.process(message).await? {
            self.inner
                .transport
                .send(Envelope::new(self.inner.coordinator.clone(), &reply));
        }
        Ok(())
    }

    /// Handle inbound payloads until the stream ends. Each message runs on
    /// its own task so a slow approval does not hold up other artifacts.
    #[instrument(skip_all, fields(participant = %self.inner.id))]
    pub async fn serve(self, inbound: impl Stream<Item = Bytes>) {
        debug!("participant dispatcher started");
        let mut inbound = pin!(inbound);
        while let Some(body) = inbound.next().await {
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(report) = this.handle(body).await {
                    error!(?report, "failed to handle message");
                }
            });
        }
        debug!("inbound stream closed");
    }
}
