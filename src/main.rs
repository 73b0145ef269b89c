//! # mmsync CLI
//!
//! The `mmsync` binary keeps a vector store in sync with a Mattermost
//! server: it pages every channel's posts into per-source collections,
//! checkpointing progress so interrupted passes resume where the last
//! successful one ended.
//!
//! ## Usage
//!
//! ```bash
//! mmsync --config ./config/mmsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mmsync init` | Create the checkpoint table and write default state |
//! | `mmsync status` | Print the persisted sync state |
//! | `mmsync interval [secs]` | Show or change the fetch interval |
//! | `mmsync sync once` | Run one fetch pass in the foreground |
//! | `mmsync sync run` | Run the periodic sync loop until Ctrl-C |
//! | `mmsync reset` | Drop the collection and clear the cursor |
//! | `mmsync serve` | Start the HTTP/SSE server |

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mm_semantic_sync::{commands, config, logging, progress::ProgressMode};

/// Incremental sync of chat posts into a vector store.
#[derive(Parser)]
#[command(
    name = "mmsync",
    about = "Incremental, checkpointed sync of Mattermost posts into a vector store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mmsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the checkpoint table and write default sync state.
    ///
    /// Idempotent: existing values are kept.
    Init,

    /// Print the persisted sync state.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Show the fetch interval, or set it when a value is given.
    Interval {
        /// New interval in seconds, from 1 up to one year.
        #[arg(allow_hyphen_values = true)]
        secs: Option<i64>,
    },

    /// Run fetch passes.
    Sync {
        #[command(subcommand)]
        action: SyncCommand,

        /// Progress output on stderr: `human`, `json`, or `off`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long, global = true)]
        progress: Option<String>,
    },

    /// Drop the vector collection and clear the cursor so the next pass
    /// re-ingests everything.
    Reset {
        /// Only clear in-progress flags left behind by a crashed process.
        #[arg(long)]
        flags_only: bool,
    },

    /// Start the HTTP/SSE server.
    Serve,
}

#[derive(Subcommand)]
enum SyncCommand {
    /// Run a single pass and exit.
    Once,
    /// Run the periodic loop until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging.level);

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Status { json } => commands::run_status(&cfg, json).await?,
        Commands::Interval { secs } => commands::run_interval(&cfg, secs).await?,
        Commands::Sync { action, progress } => {
            let mode = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some(value) => ProgressMode::parse(value).ok_or_else(|| {
                    anyhow::anyhow!("unknown progress mode '{}'; use human, json or off", value)
                })?,
            };
            match action {
                SyncCommand::Once => commands::run_sync_once(&cfg, mode).await?,
                SyncCommand::Run => commands::run_sync_loop(&cfg, mode).await?,
            }
        }
        Commands::Reset { flags_only } => commands::run_reset(&cfg, flags_only).await?,
        Commands::Serve => commands::run_serve(&cfg).await?,
    }

    Ok(())
}
