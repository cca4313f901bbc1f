//! Two-phase commit engine
//!
//! This library coordinates an all-or-nothing commit of a composite artifact
//! built from items owned by independent participant nodes.
//!
//! # Architecture
//!
//! - **Coordinator**: Creates a task per artifact, collects votes, then drives
//!   EXEC or ABORT to every participant until all of them acknowledge
//! - **Participants**: Reserve their items on a yes vote, consume them on EXEC
//!   and release them on ABORT
//! - **Durable log**: Every table mutation on either side is appended as a
//!   full snapshot and synced before the mutation is considered done
//!
//! The pure state machines live in [`core`]; the async runtimes in
//! [`coordinator`] and [`participant`] add locking, logging and timers.
//!
//! # Quick Start
//!
//! ```ignore
//! use unanimous::{CommitConfig, Coordinator, Participant};
//!
//! // Coordinator side
//! let coordinator = Coordinator::recover("coordinator", &log_path, transport, artifacts, CommitConfig::default())?;
//! tokio::spawn(coordinator.clone().serve(inbound));
//! coordinator.start_commit("pic1", payload, ["n1:a.jpg", "n2:b.jpg"])?;
//!
//! // Participant side
//! let participant = Participant::recover("n1", "coordinator", &log_path, transport, items, approver)?;
//! participant.serve(inbound).await;
//! ```

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod core;
mod error;
pub mod log;
mod messages;
pub mod participant;
mod traits;

pub use config::CommitConfig;
pub use coordinator::Coordinator;
pub use core::coordinator::TaskPhase;
pub use error::{CodecError, CommitError, LogError, ParticipantError, StorageError};
pub use messages::{ArtifactId, Envelope, ItemName, Message, MessageKind, NodeId};
pub use participant::Participant;
pub use traits::{Approver, ArtifactStore, ItemStore, Transport};
