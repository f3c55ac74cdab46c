//! Log bootstrapping for the binary.
//!
//! Two sinks: terse stderr output filtered by `RUST_LOG` (or the verbosity
//! flag), and a per-run log file `error_log_<timestamp>.txt` filtered by the
//! configured level, so failures of a long unattended run can be reviewed
//! afterwards.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::{RelayError, Result};

pub struct LogOptions<'a> {
    /// Debug output on stderr regardless of `RUST_LOG`.
    pub verbose: bool,
    /// Stderr filter used when `RUST_LOG` is unset.
    pub default_directive: &'a str,
    /// Directory for the run log file; no file when unset.
    pub log_dir: Option<&'a Path>,
    pub file_level: LevelFilter,
}

/// Installs the global subscriber. Returns the run log path, if any.
pub fn init(options: &LogOptions<'_>) -> Result<Option<PathBuf>> {
    let stderr_filter = if options.verbose {
        EnvFilter::new("mass_relay=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(options.default_directive))
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(stderr_filter);

    let (file_layer, path) = match options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(log_file_name(Local::now()));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(options.file_level);
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| RelayError::Logging(e.to_string()))?;

    Ok(path)
}

pub fn log_file_name(at: DateTime<Local>) -> String {
    format!("error_log_{}.txt", at.format("%Y-%m-%d_%H-%M-%S"))
}
