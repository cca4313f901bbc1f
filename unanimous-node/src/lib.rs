//! Unanimous node
//!
//! Runs the `unanimous` two-phase commit engine as an OS process: TCP
//! transport between nodes, directories for artifacts and items, and
//! approval policies for participants.

pub mod approval;
mod error;
pub mod requests;
pub mod storage;
pub mod transport;

use std::path::{Path, PathBuf};

pub use approval::{ApprovalMode, CliApprover};
pub use error::{NodeError, RequestError, TransportError};
pub use requests::{CommitRequest, submit_all};
pub use storage::{DirArtifacts, DirItems};
pub use transport::{TcpTransport, listen};
use unanimous::NodeId;
use unanimous::codec::is_valid_identifier;

/// Log file of node `id` under `data_dir`.
#[must_use]
pub fn log_path(data_dir: &Path, id: &str) -> PathBuf {
    data_dir.join(format!("log{id}"))
}

/// Parse a `--peer` value of the form `id=host:port`.
pub fn parse_peer(s: &str) -> Result<(NodeId, String), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {s:?}"))?;
    if !is_valid_identifier(id) {
        return Err(format!("invalid node id {id:?}"));
    }
    if addr.is_empty() {
        return Err(format!("peer {id} has no address"));
    }
    Ok((id.to_owned(), addr.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_parse() {
        assert_eq!(
            parse_peer("n1=127.0.0.1:7001"),
            Ok(("n1".to_owned(), "127.0.0.1:7001".to_owned()))
        );
        assert!(parse_peer("n1").is_err());
        assert!(parse_peer("=127.0.0.1:7001").is_err());
        assert!(parse_peer("n:1=127.0.0.1:7001").is_err());
        assert!(parse_peer("n1=").is_err());
    }

    #[test]
    fn log_file_is_named_after_node() {
        assert_eq!(log_path(Path::new("/data"), "n1"), Path::new("/data/logn1"));
    }
}
