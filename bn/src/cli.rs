//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Beacon - embedded analytics event tracking
#[derive(Parser)]
#[command(name = "bn", about = "Analytics event tracker: sessions, batching, delivery")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Track custom events through a full init/flush/destroy cycle
    Track {
        /// Event name
        name: String,

        /// Metadata as a JSON object
        #[arg(short, long)]
        metadata: Option<String>,

        /// Number of copies to track
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Log the batch instead of delivering it
        #[arg(long)]
        qa: bool,
    },

    /// Track a page view for a URL
    Page {
        /// Page URL
        url: String,

        /// Referrer URL
        #[arg(short, long)]
        referrer: Option<String>,
    },

    /// Show the resolved configuration and any warnings
    Config,

    /// Show the current or recoverable session
    Session,
}
