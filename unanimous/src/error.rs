//! Marker error types. Use `error_stack::Report<E>` with attachments for details.

use std::fmt;

/// An inbound payload could not be decoded into a protocol message.
#[derive(Debug)]
pub struct CodecError;

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed protocol message")
    }
}

impl std::error::Error for CodecError {}

/// The durable log could not be opened, appended to, or replayed.
#[derive(Debug)]
pub struct LogError;

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("durable log operation failed")
    }
}

impl std::error::Error for LogError {}

/// Artifact or item storage failed.
#[derive(Debug)]
pub struct StorageError;

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("storage operation failed")
    }
}

impl std::error::Error for StorageError {}

/// A commit request could not be started.
#[derive(Debug)]
pub struct CommitError;

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("commit request rejected")
    }
}

impl std::error::Error for CommitError {}

/// A participant could not durably apply a protocol message.
#[derive(Debug)]
pub struct ParticipantError;

impl fmt::Display for ParticipantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("participant operation failed")
    }
}

impl std::error::Error for ParticipantError {}
