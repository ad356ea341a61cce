//! # Snapshot WARC CLI (`snapwarc`)
//!
//! The `snapwarc` binary converts web snapshots stored in a SQLite database
//! into size-bounded WARC 1.1 files, and checks finished files.
//!
//! ## Usage
//!
//! ```bash
//! snapwarc --config ./config/snapwarc.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `snapwarc init` | Create the snapshot database schema |
//! | `snapwarc convert` | Write every snapshot to archive files |
//! | `snapwarc verify <files>` | Check that archive files are valid on their own |
//! | `snapwarc archive-log [path]` | Pack a run log into its own archive file |
//!
//! ## Examples
//!
//! ```bash
//! # Create the snapshots table
//! snapwarc init --config ./config/snapwarc.toml
//!
//! # Convert January 2017 only, into 1 GB uncompressed files
//! snapwarc convert --since 2017-01-01 --until 2017-01-31 --size 1 --uncompressed
//!
//! # Check the output
//! snapwarc verify ./warcs/*.warc.gz
//!
//! # Archive the run log next to it
//! snapwarc archive-log ./logs/convert.log
//! ```

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use snapshot_warc::config::{self, LoggingConfig, RunOverrides};
use snapshot_warc::log_archive;
use snapshot_warc::logging;
use snapshot_warc::migrate;
use snapshot_warc::pipeline;
use snapshot_warc::progress::ProgressMode;
use snapshot_warc::verify;

/// Snapshot WARC: archive captured web snapshots as WARC 1.1 files.
///
/// `init` and `convert` read a TOML configuration file given by `--config`.
/// See `config/snapwarc.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "snapwarc",
    about = "Convert stored web snapshots into WARC 1.1 archive files",
    version,
    long_about = "Reads snapshot rows (URL, capture time, status, headers, body, redirect \
    metadata) from a SQLite database, infers missing HTTP statuses, expands redirect chains \
    into one record per hop, and writes size-bounded, independently valid WARC files."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/snapwarc.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the snapshot database schema.
    ///
    /// Creates the SQLite file and the `snapshots` table. Safe to run
    /// more than once.
    Init,

    /// Convert snapshots into archive files.
    ///
    /// Flags override the matching config values for this run only.
    Convert {
        /// Maximum number of source rows to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Only process captures on or after this date (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        since: Option<String>,

        /// Only process captures on or before this date (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        until: Option<String>,

        /// Directory to write archive files into.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Per-file size bound in GB.
        #[arg(long)]
        size: Option<f64>,

        /// Write plain `.warc` files instead of `.warc.gz`.
        #[arg(long)]
        uncompressed: bool,

        /// Progress on stderr: `off`, `human`, or `json`. Defaults to
        /// `human` when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Verify archive files.
    ///
    /// Checks framing, required fields, digests, and the leading warcinfo
    /// record of each file. Does not read the config.
    Verify {
        /// Files to check.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Archive a conversion log file.
    ///
    /// Writes `<log stem>--<timestamp>.warc[.gz]` next to the log, holding
    /// the log as one `text/plain` resource record. Without a path the
    /// configured `[logging].file` is used.
    ArchiveLog {
        /// Log file to archive.
        path: Option<PathBuf>,

        /// Write a plain `.warc` file instead of `.warc.gz`.
        #[arg(long)]
        uncompressed: bool,
    },
}

fn parse_progress(value: Option<&str>) -> anyhow::Result<ProgressMode> {
    match value {
        None => Ok(ProgressMode::default_for_tty()),
        Some("off") => Ok(ProgressMode::Off),
        Some("human") => Ok(ProgressMode::Human),
        Some("json") => Ok(ProgressMode::Json),
        Some(other) => bail!("Unknown progress mode: '{}'. Must be off, human, or json.", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Verify { files } => {
            verify::run_verify(&files)?;
        }
        Commands::Init => {
            let cfg = config::load_config(&cli.config)?;
            let _guard = logging::init_logging(&cfg.logging)?;
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Convert {
            limit,
            since,
            until,
            output,
            size,
            uncompressed,
            progress,
        } => {
            let mut cfg = config::load_config(&cli.config)?;
            RunOverrides {
                limit,
                since,
                until,
                output,
                size_gb: size,
                uncompressed,
            }
            .apply(&mut cfg)?;
            let mode = parse_progress(progress.as_deref())?;
            let _guard = logging::init_logging(&cfg.logging)?;

            let stop = Arc::new(AtomicBool::new(false));
            let flag = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after the current snapshot");
                    flag.store(true, Ordering::SeqCst);
                }
            });

            pipeline::run_convert(&cfg, mode, stop).await?;
        }
        Commands::ArchiveLog { path, uncompressed } => {
            let cfg = config::load_config(&cli.config)?;
            // Console only: the file being archived may be the configured log
            let _guard = logging::init_logging(&LoggingConfig {
                file: None,
                level: cfg.logging.level.clone(),
            })?;
            let compress = cfg.output.compress && !uncompressed;
            let written = log_archive::run_archive_log(&cfg, path.as_deref(), compress)?;
            println!("Wrote WARC file to {}", written.display());
        }
    }

    Ok(())
}
