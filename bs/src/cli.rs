//! CLI argument parsing for beaconstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bs")]
#[command(author, version, about = "Beacon persistent key/value store", long_about = None)]
pub struct Cli {
    /// Store directory (defaults to the platform data dir)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Project namespace
    #[arg(short, long, default_value = "default")]
    pub project: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read a value
    Get {
        /// Key to read
        #[arg(required = true)]
        key: String,
    },

    /// Write a JSON value
    Set {
        /// Key to write
        #[arg(required = true)]
        key: String,

        /// JSON value (plain strings are accepted as-is)
        #[arg(required = true)]
        value: String,
    },

    /// Remove a value
    Remove {
        /// Key to remove
        #[arg(required = true)]
        key: String,
    },

    /// List keys in the project namespace
    Keys,

    /// Remove every key in the project namespace
    Clear,
}
