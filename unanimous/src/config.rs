//! Protocol timing configuration

use std::time::Duration;

/// Timing constants for the coordinator.
///
/// The vote window is `vote_poll_attempts * vote_poll_interval`. EXEC and
/// ABORT are resent every `resend_interval` until acknowledged, with no
/// upper bound.
#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// How often a voting task checks whether it has been decided
    pub vote_poll_interval: Duration,
    /// How many checks before an undecided task is aborted
    pub vote_poll_attempts: u32,
    /// Period between EXEC/ABORT resends to participants that have not acknowledged
    pub resend_interval: Duration,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            vote_poll_interval: Duration::from_millis(200),
            vote_poll_attempts: 17,
            resend_interval: Duration::from_millis(300),
        }
    }
}

impl CommitConfig {
    #[must_use]
    pub fn with_vote_poll_interval(mut self, interval: Duration) -> Self {
        self.vote_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_vote_poll_attempts(mut self, attempts: u32) -> Self {
        self.vote_poll_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval;
        self
    }
}
