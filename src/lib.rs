//! # mass-relay
//!
//! Bulk-transfers a local file tree to a remote HTTP endpoint under a
//! concurrency cap, retrying each file with exponential backoff and keeping a
//! live, consistent view of batch progress.
//!
//! The pieces, leaves first:
//!
//! - [`Uploader`]: one upload attempt of one file ([`HttpUploader`] for real
//!   endpoints, [`SimulatedUploader`] for rehearsals).
//! - [`RetryPolicy`]: bounded retries with cancellable backoff waits.
//! - [`ProgressTracker`]: the single owner of batch-wide progress state.
//! - [`Orchestrator`]: the bounded worker pool driving every task to a
//!   terminal state.
//! - [`Presenter`]: periodic, read-only rendering of tracker snapshots.

use std::path::PathBuf;

pub mod config;
pub mod ids;
pub mod logging;
pub mod orchestrator;
pub mod presenter;
pub mod progress;
pub mod retry;
pub mod sim_server;
pub mod simulate;
pub mod task;
pub mod upload;

pub use config::{Config, RetrySettings};
pub use ids::IdTable;
pub use orchestrator::{Orchestrator, RunReport, TaskFailure};
pub use presenter::{Presenter, PresenterHandle};
pub use progress::{Outcome, ProgressSnapshot, ProgressTracker};
pub use retry::{RetryPolicy, TerminalError};
pub use sim_server::SimulationServer;
pub use simulate::{SimulatedUploader, SimulationProfile};
pub use task::{Task, TaskKey};
pub use upload::{HttpUploader, UploadError, Uploader};

// --- ERROR HANDLING ---

/// Errors that abort a run before any upload starts.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Config error in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Failed to enumerate files: {0}")]
    Enumerate(#[from] walkdir::Error),

    #[error("Identifier table {path}, line {line}: {reason}")]
    IdTable {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
