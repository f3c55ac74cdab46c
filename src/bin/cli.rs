//! # Mass Relay CLI
//!
//! Migrates a local file tree to a remote HTTP endpoint with bounded
//! concurrency, per-file retries and a live progress summary.
//!
//! ## Usage
//!
//! ```bash
//! # Upload everything under ./export using ~/.config/mass-relay/config.toml
//! mass-relay upload ./export
//!
//! # Attach identifiers from a prefix table and stop after one hour
//! mass-relay upload ./export --ids ids.csv --deadline 3600
//!
//! # Rehearse without touching the real endpoint
//! mass-relay upload ./export --simulate --seed 7
//!
//! # Run a local stand-in endpoint
//! mass-relay serve-sim --addr 127.0.0.1:8080 --error-rate 0.1
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mass_relay::config::{self, Config};
use mass_relay::logging::{self, LogOptions};
use mass_relay::presenter::{self, format_size};
use mass_relay::{
    task, HttpUploader, IdTable, Orchestrator, Presenter, ProgressTracker, RunReport,
    SimulatedUploader, SimulationProfile, SimulationServer, Task, Uploader,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit code indicating every file was uploaded.
const EXIT_SUCCESS: u8 = 0;
/// Exit code indicating the run could not start.
const EXIT_ERROR: u8 = 1;
/// Exit code indicating the run finished but some files were not uploaded.
const EXIT_PARTIAL: u8 = 2;

// =============================================================================
// CLI Definition
// =============================================================================

#[derive(Parser)]
#[command(name = "mass-relay")]
#[command(author, version, about = "Mass Relay - bulk file migration over HTTP")]
#[command(
    long_about = "Uploads every file under a directory to a remote HTTP endpoint.\n\n\
Features:\n\
  - Bounded parallel uploads\n\
  - Per-file retries with exponential backoff\n\
  - Application-level error detection in response bodies\n\
  - Live progress summary and per-run error log\n\
  - Simulation mode for rehearsals"
)]
struct Cli {
    /// Enable verbose logging (can also use RUST_LOG env var)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true, env = "MASS_RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload every file under a directory
    Upload {
        /// Root directory to migrate
        #[arg(default_value = "./simulation-files")]
        root: PathBuf,

        /// Rehearse: replace the network call with a simulated endpoint
        #[arg(long)]
        simulate: bool,

        /// Prefix to identifier CSV table (overrides `id_table` from config)
        #[arg(long)]
        ids: Option<PathBuf>,

        /// Number of parallel uploads (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Run-wide deadline in seconds (overrides config)
        #[arg(long)]
        deadline: Option<u64>,

        /// Seed for simulation randomness
        #[arg(long)]
        seed: Option<u64>,

        /// Directory for the run log file
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,

        /// Disable the live progress summary
        #[arg(long)]
        no_progress: bool,
    },

    /// Run a local stand-in for the upload endpoint
    ServeSim {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,

        /// Fraction of requests answered with a populated Errors array
        #[arg(long, default_value = "0.1")]
        error_rate: f64,

        /// Minimum response delay in milliseconds
        #[arg(long, default_value = "1000")]
        min_delay_ms: u64,

        /// Maximum response delay in milliseconds
        #[arg(long, default_value = "2000")]
        max_delay_ms: u64,

        /// Seed for reproducible responses
        #[arg(long)]
        seed: Option<u64>,
    },
}

/// Application entry point.
#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Main application logic.
async fn run() -> anyhow::Result<u8> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::default_path);

    match cli.command {
        Commands::Upload {
            root,
            simulate,
            ids,
            workers,
            deadline,
            seed,
            log_dir,
            no_progress,
        } => {
            let mut config = if simulate {
                Config::load_or_default(&config_path)?
            } else {
                Config::load(&config_path)?
            };
            if let Some(workers) = workers {
                config.max_concurrent_uploads = workers;
            }
            if let Some(deadline) = deadline {
                config.deadline_secs = Some(deadline);
            }
            if ids.is_some() {
                config.id_table = ids;
            }
            config.validate()?;

            let log_path = logging::init(&LogOptions {
                verbose: cli.verbose,
                default_directive: "mass_relay=error",
                log_dir: Some(&log_dir),
                file_level: config.log_filter()?,
            })?;
            if let Some(path) = &log_path {
                info!(path = %path.display(), "writing run log");
            }

            let upload = UploadArgs {
                root,
                simulate,
                seed,
                show_progress: !no_progress,
            };
            upload_command(&config, &upload).await
        }

        Commands::ServeSim {
            addr,
            error_rate,
            min_delay_ms,
            max_delay_ms,
            seed,
        } => {
            logging::init(&LogOptions {
                verbose: cli.verbose,
                default_directive: "mass_relay=info",
                log_dir: None,
                file_level: tracing::level_filters::LevelFilter::OFF,
            })?;
            if !(0.0..=1.0).contains(&error_rate) {
                bail!("--error-rate must be between 0 and 1");
            }

            let profile = SimulationProfile {
                min_delay: Duration::from_millis(min_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
                error_rate,
                seed,
            };
            let server = SimulationServer::bind(&addr, profile)
                .await
                .with_context(|| format!("failed to listen on {addr}"))?;
            println!("Simulation endpoint: {}", server.url()?);

            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone());
            server.serve(cancel).await?;
            Ok(EXIT_SUCCESS)
        }
    }
}

struct UploadArgs {
    root: PathBuf,
    simulate: bool,
    seed: Option<u64>,
    show_progress: bool,
}

async fn upload_command(config: &Config, args: &UploadArgs) -> anyhow::Result<u8> {
    if !args.root.is_dir() {
        bail!("Not a directory: {}", args.root.display());
    }

    println!("📁 Scanning directory: {}", args.root.display());
    let tasks = task::enumerate(&args.root)
        .with_context(|| format!("failed to scan {}", args.root.display()))?;
    println!(
        "   Found {} files ({})",
        tasks.len(),
        format_size(task::total_bytes(&tasks))
    );

    let (tasks, unclassified) = classify(config, tasks)?;
    for task in &unclassified {
        warn!(file = %task.key(), "no identifier matches this file, not uploading");
        eprintln!("✗ No identifier for {}", task.key());
    }

    let report = if tasks.is_empty() {
        println!("\nNothing to upload.");
        RunReport {
            succeeded: 0,
            failures: Vec::new(),
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    } else if args.simulate {
        println!("\n🧪 Simulating upload of {} files...\n", tasks.len());
        let profile = SimulationProfile {
            seed: args.seed,
            ..SimulationProfile::default()
        };
        execute(Arc::new(SimulatedUploader::new(profile)), config, tasks, args).await
    } else {
        let uploader = HttpUploader::with_timeout(
            config.endpoint()?,
            config.token.clone(),
            config.max_concurrent_uploads,
            config.request_timeout(),
        )?;
        println!("\n📤 Uploading {} files to {}...\n", tasks.len(), uploader.url());
        execute(Arc::new(uploader), config, tasks, args).await
    };

    print_summary(&report, unclassified.len());
    Ok(exit_code(&report, unclassified.len()))
}

fn exit_code(report: &RunReport, unclassified: usize) -> u8 {
    if report.is_success() && unclassified == 0 {
        EXIT_SUCCESS
    } else {
        EXIT_PARTIAL
    }
}

/// Attaches identifiers when a prefix table is configured.
fn classify(config: &Config, tasks: Vec<Task>) -> anyhow::Result<(Vec<Task>, Vec<Task>)> {
    let Some(path) = config.id_table.as_deref() else {
        return Ok((tasks, Vec::new()));
    };
    let table = load_table(path)?;
    println!("   Loaded {} identifier prefixes", table.len());
    Ok(table.classify(tasks, &config.id_param))
}

fn load_table(path: &Path) -> anyhow::Result<IdTable> {
    IdTable::load(path).with_context(|| format!("failed to load identifier table {}", path.display()))
}

async fn execute<U: Uploader + 'static>(
    uploader: Arc<U>,
    config: &Config,
    tasks: Vec<Task>,
    args: &UploadArgs,
) -> RunReport {
    let tracker = Arc::new(ProgressTracker::for_tasks(&tasks));
    let orchestrator = Orchestrator::new(uploader, config.retry_policy(), config.max_concurrent_uploads)
        .with_deadline(config.deadline())
        .with_shutdown_grace(config.shutdown_grace());

    let title = if args.simulate {
        "Mass Relay - Simulation"
    } else {
        "Mass Relay - Upload All of the Files"
    };
    let presenter = args.show_progress.then(|| {
        Presenter::new(tracker.clone(), presenter::DEFAULT_INTERVAL)
            .with_title(title)
            .spawn()
    });

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let report = orchestrator.run(tasks, tracker, &cancel).await;

    if let Some(presenter) = presenter {
        presenter.finish().await;
    }
    report
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, finishing in-flight uploads...");
            cancel.cancel();
        }
    });
}

fn print_summary(report: &RunReport, unclassified: usize) {
    let exhausted: Vec<_> = report.exhausted().collect();
    let interrupted: Vec<_> = report.interrupted().collect();

    println!("\n✓ Migration complete: {} uploaded, {} failed", report.succeeded, exhausted.len());
    if !interrupted.is_empty() {
        println!("  Cancelled:    {} files", interrupted.len());
    }
    if unclassified > 0 {
        println!("  Unclassified: {unclassified} files");
    }
    println!("  Elapsed:      {:.1}s", report.elapsed.as_secs_f64());

    for failure in &exhausted {
        eprintln!("✗ Failed {}: {}", failure.task.key(), failure.error);
    }
    for failure in &interrupted {
        eprintln!("⊘ Cancelled {}: {}", failure.task.key(), failure.error);
    }
}
