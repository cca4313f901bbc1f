//! Approval policies for participants.

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::warn;
use unanimous::{Approver, ItemName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ApprovalMode {
    /// Approve every request.
    Always,
    /// Refuse every request.
    Never,
    /// Ask on the terminal.
    Prompt,
}

/// Approves according to an [`ApprovalMode`], reading prompt answers from
/// `R` one line at a time.
pub struct CliApprover<R> {
    mode: ApprovalMode,
    answers: Mutex<Lines<R>>,
}

impl CliApprover<BufReader<Stdin>> {
    #[must_use]
    pub fn stdin(mode: ApprovalMode) -> Self {
        Self::new(mode, BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin> CliApprover<R> {
    pub fn new(mode: ApprovalMode, answers: R) -> Self {
        Self {
            mode,
            answers: Mutex::new(answers.lines()),
        }
    }

    async fn ask(&self, payload: &Bytes, items: &[ItemName]) -> bool {
        // One question on screen at a time.
        let mut answers = self.answers.lock().await;
        eprint!(
            "approve {} bytes built from {}? [y/N] ",
            payload.len(),
            items.join(", ")
        );
        match answers.next_line().await {
            Ok(Some(line)) => is_yes(&line),
            Ok(None) => {
                warn!("approval input closed, refusing");
                false
            }
            Err(e) => {
                warn!(error = %e, "failed to read approval, refusing");
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

impl<R> Approver for CliApprover<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn approve(&self, payload: &Bytes, items: &[ItemName]) -> bool {
        match self.mode {
            ApprovalMode::Always => true,
            ApprovalMode::Never => false,
            ApprovalMode::Prompt => self.ask(payload, items).await,
        }
    }
}
