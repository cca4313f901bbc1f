//! Error types for the node process.

use std::fmt;

/// A message could not be handed to a peer.
#[derive(Debug)]
pub struct TransportError;

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to deliver message")
    }
}

impl std::error::Error for TransportError {}

/// A line on the request input could not be turned into a commit.
#[derive(Debug)]
pub struct RequestError;

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid commit request")
    }
}

impl std::error::Error for RequestError {}

/// The node could not start.
#[derive(Debug)]
pub struct NodeError;

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("node failed to start")
    }
}

impl std::error::Error for NodeError {}
