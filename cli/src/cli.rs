use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command line front end for the fetchq transfer queue.
#[derive(Debug, Parser)]
#[command(name = "fetchq")]
#[command(about = "fetchq: queued, chunked HTTP downloads", long_about = None)]
pub struct Cli {
    /// SQLite database holding history and settings (default: $FETCHQ_DB or the user data dir).
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Log at debug level unless FETCHQ_LOG says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download URLs and wait until the queue drains.
    Get {
        /// Direct HTTP/HTTPS URLs, queued in order.
        #[arg(required = true)]
        urls: Vec<String>,

        /// File name to save as, instead of the one taken from the URL.
        /// Only valid with a single URL.
        #[arg(long)]
        name: Option<String>,

        /// Connections per transfer (saved to settings).
        #[arg(long)]
        connections: Option<u32>,

        /// Transfers running at once (saved to settings).
        #[arg(long)]
        parallel: Option<usize>,
    },

    /// Run transfers interrupted by an earlier exit until the queue drains.
    Run,

    /// Show every record, newest first.
    List {
        #[arg(long)]
        json: bool,
    },

    /// Stop and delete a record.
    Cancel { id: String },

    /// Delete a record, keeping whatever is already on disk.
    Remove { id: String },

    /// Pause a queued record.
    Pause { id: String },

    /// Restart a paused or failed record from zero and wait for it.
    Resume { id: String },

    /// Delete completed, cancelled and failed records.
    ClearHistory,

    /// Show or change the download root.
    Root {
        #[command(subcommand)]
        action: RootAction,
    },

    /// Show or change persisted settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum RootAction {
    Show,
    Set { path: PathBuf },
    /// Prompt for a directory on stdin.
    Choose,
}

#[derive(Debug, Subcommand)]
pub enum SettingsAction {
    Show,
    Set(SettingsArgs),
    /// Restore every default.
    Reset,
}

#[derive(Debug, clap::Args)]
pub struct SettingsArgs {
    #[arg(long)]
    pub max_concurrent: Option<usize>,
    #[arg(long)]
    pub connections: Option<u32>,
    #[arg(long)]
    pub auto_extract: Option<bool>,
    #[arg(long)]
    pub auto_convert: Option<bool>,
    #[arg(long)]
    pub move_to_secondary: Option<bool>,
    #[arg(long, conflicts_with = "clear_secondary_root")]
    pub secondary_root: Option<PathBuf>,
    #[arg(long)]
    pub clear_secondary_root: bool,
    /// Program run as `<converter> <image> <output dir>`.
    #[arg(long, conflicts_with = "clear_converter")]
    pub converter: Option<PathBuf>,
    #[arg(long)]
    pub clear_converter: bool,
    #[arg(long)]
    pub max_history: Option<usize>,
}
