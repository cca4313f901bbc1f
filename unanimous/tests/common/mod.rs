//! In-memory network, stores and approvers for driving whole clusters.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing_subscriber::{EnvFilter, fmt};
use unanimous::{
    Approver, ArtifactStore, CommitConfig, Coordinator, Envelope, ItemName, ItemStore,
    MessageKind, Participant, Transport, codec,
};

pub const COORDINATOR: &str = "server";

/// Initialize tracing for tests
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("unanimous=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Fast timings so paused-clock tests stay short.
pub fn test_config() -> CommitConfig {
    CommitConfig::default()
        .with_vote_poll_interval(Duration::from_millis(50))
        .with_vote_poll_attempts(10)
        .with_resend_interval(Duration::from_millis(100))
}

#[derive(Default)]
struct Routes {
    inboxes: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    /// Remaining drops per (destination, message kind).
    drops: HashMap<(String, MessageKind), usize>,
    sent: Vec<(String, MessageKind)>,
}

/// A lossy, in-process message router.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `node` a fresh inbox, replacing any previous one.
    pub fn register(&self, node: &str) -> UnboundedReceiverStream<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .unwrap()
            .inboxes
            .insert(node.to_owned(), tx);
        UnboundedReceiverStream::new(rx)
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
        }
    }

    /// Silently drop the next `count` messages of `kind` sent to `node`.
    pub fn drop_next(&self, node: &str, kind: MessageKind, count: usize) {
        self.routes
            .lock()
            .unwrap()
            .drops
            .insert((node.to_owned(), kind), count);
    }

    /// How many messages of `kind` were delivered to `node`.
    pub fn delivered(&self, node: &str, kind: MessageKind) -> usize {
        self.routes
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(to, k)| to == node && *k == kind)
            .count()
    }

    /// Deliver raw bytes, bypassing drop rules.
    pub fn inject(&self, node: &str, body: Bytes) {
        if let Some(inbox) = self.routes.lock().unwrap().inboxes.get(node) {
            let _ = inbox.send(body);
        }
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn send(&self, envelope: Envelope) {
        let kind = codec::decode(&envelope.body)
            .expect("engine only sends well-formed messages")
            .kind();
        let mut guard = self.network.routes.lock().unwrap();
        let routes = &mut *guard;

        if let Some(remaining) = routes.drops.get_mut(&(envelope.to.clone(), kind))
            && *remaining > 0
        {
            *remaining -= 1;
            return;
        }

        if let Some(inbox) = routes.inboxes.get(&envelope.to)
            && inbox.send(envelope.body).is_ok()
        {
            routes.sent.push((envelope.to, kind));
        }
    }
}

/// Coordinator-side artifact store kept in memory.
#[derive(Clone, Default)]
pub struct MemoryArtifacts {
    inner: Arc<Mutex<ArtifactState>>,
}

#[derive(Default)]
struct ArtifactState {
    staged: HashMap<String, Vec<u8>>,
    published: HashMap<String, Vec<u8>>,
    fail_staging: bool,
}

impl MemoryArtifacts {
    pub fn published(&self, artifact: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().published.get(artifact).cloned()
    }

    pub fn is_staged(&self, artifact: &str) -> bool {
        self.inner.lock().unwrap().staged.contains_key(artifact)
    }

    /// Make every later `stage` call fail.
    pub fn fail_staging(&self) {
        self.inner.lock().unwrap().fail_staging = true;
    }

    pub fn stage_directly(&self, artifact: &str, payload: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .staged
            .insert(artifact.to_owned(), payload.to_vec());
    }
}

impl ArtifactStore for MemoryArtifacts {
    fn stage(&self, artifact: &str, payload: &[u8]) -> io::Result<()> {
        if self.inner.lock().unwrap().fail_staging {
            return Err(io::Error::other("disk full"));
        }
        self.stage_directly(artifact, payload);
        Ok(())
    }

    fn publish(&self, artifact: &str) -> io::Result<()> {
        let mut state = self.inner.lock().unwrap();
        if let Some(payload) = state.staged.remove(artifact) {
            state.published.insert(artifact.to_owned(), payload);
        }
        Ok(())
    }

    fn discard(&self, artifact: &str) -> io::Result<()> {
        self.inner.lock().unwrap().staged.remove(artifact);
        Ok(())
    }
}

/// Participant-side items kept in memory.
#[derive(Clone, Default)]
pub struct MemoryItems {
    items: Arc<Mutex<BTreeSet<ItemName>>>,
}

impl MemoryItems {
    pub fn new<const N: usize>(items: [&str; N]) -> Self {
        Self {
            items: Arc::new(Mutex::new(
                items.into_iter().map(str::to_owned).collect(),
            )),
        }
    }

    pub fn has(&self, item: &str) -> bool {
        self.items.lock().unwrap().contains(item)
    }
}

impl ItemStore for MemoryItems {
    fn contains(&self, item: &str) -> bool {
        self.has(item)
    }

    fn consume(&self, item: &str) -> io::Result<()> {
        self.items.lock().unwrap().remove(item);
        Ok(())
    }
}

/// Answers every approval the same way, optionally after a delay.
#[derive(Clone)]
pub struct FixedApprover {
    approve: bool,
    delay: Duration,
    asked: Arc<Mutex<usize>>,
}

impl FixedApprover {
    pub fn yes() -> Self {
        Self {
            approve: true,
            delay: Duration::ZERO,
            asked: Arc::default(),
        }
    }

    pub fn no() -> Self {
        Self {
            approve: false,
            ..Self::yes()
        }
    }

    #[must_use]
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn asked(&self) -> usize {
        *self.asked.lock().unwrap()
    }
}

impl Approver for FixedApprover {
    async fn approve(&self, _payload: &Bytes, _items: &[ItemName]) -> bool {
        *self.asked.lock().unwrap() += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.approve
    }
}

pub type TestCoordinator = Coordinator<MemoryTransport, MemoryArtifacts>;
pub type TestParticipant = Participant<MemoryTransport, MemoryItems, FixedApprover>;

/// Recover a coordinator from `dir/log<id>` and serve its inbox.
pub fn start_coordinator(
    network: &MemoryNetwork,
    dir: &Path,
    artifacts: &MemoryArtifacts,
    config: CommitConfig,
) -> TestCoordinator {
    let inbox = network.register(COORDINATOR);
    let coordinator = Coordinator::recover(
        COORDINATOR,
        dir.join(format!("log{COORDINATOR}")),
        network.transport(),
        artifacts.clone(),
        config,
    )
    .expect("coordinator should recover");
    tokio::spawn(coordinator.clone().serve(inbox));
    coordinator
}

/// Recover participant `id` from `dir/log<id>` and serve its inbox.
pub fn start_participant(
    network: &MemoryNetwork,
    dir: &Path,
    id: &str,
    items: &MemoryItems,
    approver: &FixedApprover,
) -> TestParticipant {
    let inbox = network.register(id);
    let participant = Participant::recover(
        id,
        COORDINATOR,
        dir.join(format!("log{id}")),
        network.transport(),
        items.clone(),
        approver.clone(),
    )
    .expect("participant should recover");
    tokio::spawn(participant.clone().serve(inbox));
    participant
}

/// Poll `condition` on the paused clock until it holds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting until {what}");
}
