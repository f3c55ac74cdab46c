//! Bounded retries with exponential backoff.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::upload::UploadError;

/// Terminal failure of one task: no further attempts will be made.
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("{}: failed after {attempts} attempt(s): {source}", file.display())]
    Exhausted {
        file: PathBuf,
        attempts: u32,
        #[source]
        source: UploadError,
    },

    #[error("{}: cancelled after {attempts} attempt(s)", file.display())]
    Cancelled {
        file: PathBuf,
        attempts: u32,
        last: Option<UploadError>,
    },

    #[error("{}: run cancelled before the upload started", file.display())]
    NotStarted { file: PathBuf },

    #[error("{}: aborted after the shutdown grace period", file.display())]
    Aborted { file: PathBuf },

    #[error("{}: listed more than once in the batch, not uploaded again", file.display())]
    DuplicateKey { file: PathBuf },
}

impl TerminalError {
    pub fn file(&self) -> &Path {
        match self {
            Self::Exhausted { file, .. }
            | Self::Cancelled { file, .. }
            | Self::NotStarted { file }
            | Self::Aborted { file }
            | Self::DuplicateKey { file } => file,
        }
    }

    /// Attempts made, when known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => Some(*attempts),
            Self::NotStarted { .. } | Self::DuplicateKey { .. } => Some(0),
            Self::Aborted { .. } => None,
        }
    }

    /// True when the task ran out of time rather than out of attempts.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. } | Self::NotStarted { .. } | Self::Aborted { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, backoff_multiplier: u32) -> Self {
        Self {
            max_retries,
            initial_delay,
            backoff_multiplier,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before retry `n` (1-indexed): `initial_delay * multiplier^(n-1)`.
    pub fn delay_before_retry(&self, n: u32) -> Duration {
        self.backoff_multiplier
            .checked_pow(n.saturating_sub(1))
            .map_or(Duration::MAX, |factor| self.initial_delay.saturating_mul(factor))
    }

    /// Runs `attempt` until it succeeds, attempts run out, or `cancel` fires.
    ///
    /// Cancellation is observed before each attempt and during backoff waits;
    /// an attempt already running is left to finish.
    pub async fn execute<T, F, Fut>(
        &self,
        file: &Path,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, TerminalError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempts = 0u32;
        let mut last: Option<UploadError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(TerminalError::Cancelled {
                    file: file.to_path_buf(),
                    attempts,
                    last,
                });
            }

            attempts += 1;
            debug!(file = %file.display(), attempt = attempts, max_attempts, "upload attempt");

            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempts >= max_attempts {
                error!(file = %file.display(), attempts, error = %err, "upload failed, giving up");
                return Err(TerminalError::Exhausted {
                    file: file.to_path_buf(),
                    attempts,
                    source: err,
                });
            }

            let delay = self.delay_before_retry(attempts);
            warn!(
                file = %file.display(),
                attempt = attempts,
                max_attempts,
                error = %err,
                "upload attempt failed, retrying in {delay:?}"
            );
            last = Some(err);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(file = %file.display(), "retry wait cancelled");
                    return Err(TerminalError::Cancelled {
                        file: file.to_path_buf(),
                        attempts,
                        last,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
