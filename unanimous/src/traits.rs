//! Seams to the collaborators the engine does not own.

use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::Bytes;

use crate::messages::{Envelope, ItemName};

/// Best-effort point-to-point delivery.
///
/// `send` is fire-and-forget: a message may be delayed or dropped, but not
/// corrupted or duplicated. Delivery is confirmed only by protocol ACKs.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, envelope: Envelope);
}

impl<T: Transport> Transport for Arc<T> {
    fn send(&self, envelope: Envelope) {
        (**self).send(envelope);
    }
}

/// Decides whether this participant agrees to give up its items.
///
/// May block for as long as it needs (e.g. asking a human).
pub trait Approver: Send + Sync + 'static {
    fn approve(&self, payload: &Bytes, items: &[ItemName]) -> impl Future<Output = bool> + Send;
}

/// Coordinator-side storage for artifact bytes.
///
/// Every method must be durable before returning and idempotent.
pub trait ArtifactStore: Send + Sync + 'static {
    /// Store `payload` under a temporary name derived from `artifact`.
    fn stage(&self, artifact: &str, payload: &[u8]) -> io::Result<()>;
    /// Move the staged payload to its real name. A missing staged payload is
    /// not an error (it was already published).
    fn publish(&self, artifact: &str) -> io::Result<()>;
    /// Delete the staged payload if it exists.
    fn discard(&self, artifact: &str) -> io::Result<()>;
}

/// Participant-side storage for the items it owns.
pub trait ItemStore: Send + Sync + 'static {
    fn contains(&self, item: &str) -> bool;
    /// Permanently remove `item`. A missing item is not an error.
    fn consume(&self, item: &str) -> io::Result<()>;
}
