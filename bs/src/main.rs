use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing_subscriber::EnvFilter;

use beaconstore::Store;
use beaconstore::cli::{Cli, Command};

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();
}

fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let store = Store::open(cli.dir.as_deref(), &cli.project);

    match cli.command {
        Command::Get { key } => match store.get_item(&key) {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => println!("{}", "(not set)".dimmed()),
        },
        Command::Set { key, value } => {
            // Accept raw JSON first, fall back to treating the input as a string.
            let parsed = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            store.set_item(&key, parsed).context("Failed to write value")?;
            println!("{} {}", "✓".green(), key.cyan());
        }
        Command::Remove { key } => {
            store.remove_item(&key).context("Failed to remove value")?;
            println!("{} {}", "✓".green(), key.cyan());
        }
        Command::Keys => {
            let mut keys = store.keys();
            keys.sort();
            if keys.is_empty() {
                println!("No keys in namespace {}", cli.project.cyan());
            } else {
                for key in keys {
                    println!("{key}");
                }
            }
        }
        Command::Clear => {
            store.clear().context("Failed to clear namespace")?;
            println!("{} cleared {}", "✓".green(), cli.project.cyan());
        }
    }

    Ok(())
}
