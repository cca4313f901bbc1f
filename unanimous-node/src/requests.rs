//! Commit requests read by the coordinator, one per line:
//!
//! ```text
//! <artifactId> <payloadPath> <addr:item> [<addr:item> ...]
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use std::path::PathBuf;

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{error, info, warn};
use unanimous::{ArtifactId, ArtifactStore, Coordinator, Transport};

use crate::error::RequestError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub artifact: ArtifactId,
    pub payload: PathBuf,
    pub owners: Vec<String>,
}

impl CommitRequest {
    /// Parse one input line. `Ok(None)` for lines that carry no request.
    pub fn parse(line: &str) -> Result<Option<Self>, Report<RequestError>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut fields = line.split_whitespace();
        let (Some(artifact), Some(payload)) = (fields.next(), fields.next()) else {
            return Err(Report::new(RequestError)
                .attach(format!("expected `<artifact> <payload> <addr:item>...`, got {line:?}")));
        };
        let owners: Vec<String> = fields.map(str::to_owned).collect();
        if owners.is_empty() {
            return Err(Report::new(RequestError).attach(format!("{artifact} lists no items")));
        }

        Ok(Some(Self {
            artifact: artifact.to_owned(),
            payload: PathBuf::from(payload),
            owners,
        }))
    }

    /// Read the payload and hand the request to `coordinator`.
    pub async fn submit<T, A>(&self, coordinator: &Coordinator<T, A>) -> Result<(), Report<RequestError>>
    where
        T: Transport,
        A: ArtifactStore,
    {
        let payload = tokio::fs::read(&self.payload)
            .await
            .change_context(RequestError)
            .attach_with(|| format!("reading payload {}", self.payload.display()))?;
        coordinator
            .start_commit(self.artifact.clone(), Bytes::from(payload), &self.owners)
            .change_context(RequestError)
    }
}

/// Submit every request read from `input` until it closes. Bad lines are
/// logged and skipped.
pub async fn submit_all<R, T, A>(input: R, coordinator: &Coordinator<T, A>)
where
    R: AsyncBufRead + Unpin,
    T: Transport,
    A: ArtifactStore,
{
    let mut lines = input.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read requests");
                break;
            }
        };
        let request = match CommitRequest::parse(&line) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(report) => {
                warn!(?report, "skipping request");
                continue;
            }
        };
        match request.submit(coordinator).await {
            Ok(()) => info!(artifact = %request.artifact, "commit submitted"),
            Err(report) => warn!(artifact = %request.artifact, ?report, "commit rejected"),
        }
    }
    info!("request input closed");
}
