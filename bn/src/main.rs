//! Beacon - analytics event tracker
//!
//! CLI entry point for tracking events, inspecting configuration, and
//! examining the persisted session.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tracing::{debug, info};

use beacon::cli::{Cli, Command};
use beacon::config::{AppConfig, ConfigManager, Mode};
use beacon::events::TrackOutcome;
use beacon::session::{SESSION_STORAGE_KEY, StoredSession};
use beacon::tracker::Tracker;
use beaconstore::Store;

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("beacon")
        .join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level = match cli_log_level.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("beacon.log")).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let app = AppConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Track {
            name,
            metadata,
            count,
            qa,
        } => cmd_track(app, &name, metadata.as_deref(), count, qa).await,
        Command::Page { url, referrer } => cmd_page(app, &url, referrer).await,
        Command::Config => cmd_config(app).await,
        Command::Session => cmd_session(app),
    }
}

async fn cmd_track(mut app: AppConfig, name: &str, metadata: Option<&str>, count: usize, qa: bool) -> Result<()> {
    let metadata = match metadata {
        Some(raw) => serde_json::from_str::<serde_json::Map<_, _>>(raw).context("Metadata must be a JSON object")?,
        None => serde_json::Map::new(),
    };
    if qa {
        app.mode = Mode::Qa;
    }

    let tracker = Tracker::new(app);
    tracker.init().await.map_err(|e| eyre!(e))?;

    let mut queued = 0usize;
    let mut dropped = 0usize;
    for _ in 0..count {
        match tracker.event(name, metadata.clone()).await.map_err(|e| eyre!(e))? {
            TrackOutcome::Queued { .. } | TrackOutcome::Buffered => queued += 1,
            _ => dropped += 1,
        }
    }
    let flushed = tracker.flush().await.map_err(|e| eyre!(e))?;
    tracker.destroy(false).await;

    println!(
        "{} {} event(s) queued, {} dropped by policy, {} flushed",
        "✓".green(),
        queued,
        dropped,
        flushed
    );
    Ok(())
}

async fn cmd_page(app: AppConfig, url: &str, referrer: Option<String>) -> Result<()> {
    let tracker = Tracker::new(app);
    tracker.init().await.map_err(|e| eyre!(e))?;
    tracker.navigate(url, referrer, None).await.map_err(|e| eyre!(e))?;
    let flushed = tracker.flush().await.map_err(|e| eyre!(e))?;
    tracker.destroy(false).await;

    println!("{} page view for {} tracked ({} event(s) flushed)", "✓".green(), url.bold(), flushed);
    Ok(())
}

async fn cmd_config(app: AppConfig) -> Result<()> {
    let resolver = ConfigManager::new(std::time::Duration::from_millis(
        beacon::config::DEFAULT_REQUEST_TIMEOUT_MS,
    ))?;
    let (config, warnings) = resolver.get(app).await;

    println!("{}", "Resolved configuration".bold());
    println!("  project-id:      {}", config.project_id);
    println!("  mode:            {:?}", config.mode);
    println!("  sampling-rate:   {}", config.sampling_rate);
    println!("  session-timeout: {:?}", config.session_timeout);
    println!("  flush-interval:  {:?}", config.flush_interval);
    println!("  max-retries:     {}", config.max_retries);
    if config.backend_urls.is_empty() {
        println!("  backends:        {}", "(none)".red());
    } else {
        for url in &config.backend_urls {
            println!("  backend:         {url}");
        }
    }
    for pattern in &config.excluded_url_patterns {
        println!("  excluded:        {}", pattern.as_str());
    }
    for warning in &warnings {
        println!("{} {}", "warning:".yellow(), warning);
    }
    Ok(())
}

fn cmd_session(app: AppConfig) -> Result<()> {
    let (config, _) = beacon::config::normalize(app);
    let store = Store::open(config.storage_dir.as_deref(), &config.project_id);

    match store.get::<StoredSession>(SESSION_STORAGE_KEY) {
        Some(session) => {
            let idle_ms = chrono::Utc::now().timestamp_millis().saturating_sub(session.last_activity);
            let recoverable = idle_ms < config.session_timeout.as_millis() as i64;
            println!("{}", "Persisted session".bold());
            println!("  id:            {}", session.id);
            println!("  started-at:    {}", session.started_at);
            println!("  last-activity: {} ({idle_ms}ms ago)", session.last_activity);
            if recoverable {
                println!("  status:        {}", "recoverable".green());
            } else {
                println!("  status:        {}", "expired".yellow());
            }
        }
        None => println!("No persisted session for project {}", config.project_id.bold()),
    }
    Ok(())
}
