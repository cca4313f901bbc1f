//! Two-phase commit protocol messages

use std::fmt;

use bytes::Bytes;

use crate::codec;

/// Address of a coordinator or participant process.
pub type NodeId = String;
/// Identifier of the composite artifact being committed.
pub type ArtifactId = String;
/// Name of an item owned by exactly one participant.
pub type ItemName = String;

/// The five message types, numbered as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Vote,
    VoteResponse,
    Exec,
    Ack,
    Abort,
}

impl MessageKind {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Vote => "1",
            Self::VoteResponse => "2",
            Self::Exec => "3",
            Self::Ack => "4",
            Self::Abort => "5",
        }
    }

    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "1" => Some(Self::Vote),
            "2" => Some(Self::VoteResponse),
            "3" => Some(Self::Exec),
            "4" => Some(Self::Ack),
            "5" => Some(Self::Abort),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vote => "VOTE",
            Self::VoteResponse => "VOTE_RESPONSE",
            Self::Exec => "EXEC",
            Self::Ack => "ACK",
            Self::Abort => "ABORT",
        })
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Coordinator asks a participant to vote on the items it owns.
    /// Carries the artifact bytes so the participant can inspect them.
    Vote {
        artifact: ArtifactId,
        items: Vec<ItemName>,
        payload: Bytes,
    },
    /// Participant's yes/no answer to a `Vote`.
    VoteResponse {
        artifact: ArtifactId,
        participant: NodeId,
        approve: bool,
    },
    /// Coordinator decided to commit.
    Exec { artifact: ArtifactId },
    /// Coordinator decided to abort.
    Abort { artifact: ArtifactId },
    /// Participant applied `Exec` or `Abort`.
    Ack {
        artifact: ArtifactId,
        participant: NodeId,
    },
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Vote { .. } => MessageKind::Vote,
            Self::VoteResponse { .. } => MessageKind::VoteResponse,
            Self::Exec { .. } => MessageKind::Exec,
            Self::Abort { .. } => MessageKind::Abort,
            Self::Ack { .. } => MessageKind::Ack,
        }
    }

    #[must_use]
    pub fn artifact(&self) -> &str {
        match self {
            Self::Vote { artifact, .. }
            | Self::VoteResponse { artifact, .. }
            | Self::Exec { artifact }
            | Self::Abort { artifact }
            | Self::Ack { artifact, .. } => artifact,
        }
    }
}

/// An encoded message addressed to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: NodeId,
    pub body: Bytes,
}

impl Envelope {
    #[must_use]
    pub fn new(to: impl Into<NodeId>, message: &Message) -> Self {
        Self {
            to: to.into(),
            body: codec::encode(message),
        }
    }
}
