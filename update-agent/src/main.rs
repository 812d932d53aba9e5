//! Update Agent - Main entry point
//!
//! Brings the installed application up to date with its remote manifest,
//! then starts it.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast::error::RecvError;
use update_agent::bootstrap::{RunOptions, Updater};
use update_agent::events::{StatusEvent, StatusSender};
use update_agent::{utils, Config};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Ignore the cached manifest version and re-validate every file
    #[arg(long)]
    repair: bool,

    /// Do not start the application after updating
    #[arg(long)]
    no_launch: bool,

    /// Print status events as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting update-agent v{} for {}",
        env!("CARGO_PKG_VERSION"),
        config.app.name
    );

    let status = StatusSender::new();
    let mut events = status.subscribe();
    let updater = Updater::new(config, status)?;

    let options = RunOptions {
        repair: args.repair,
        launch: !args.no_launch,
    };
    let run = tokio::spawn(async move { updater.run(options).await });

    loop {
        match events.recv().await {
            Ok(event) => {
                print_event(&event, args.json)?;
                if event.is_terminal() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Skipped {} status events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }

    match run.await? {
        Ok(report) => {
            tracing::info!(
                "Update finished: {} files updated, launched: {}",
                report.files_updated,
                report.launched
            );
            if args.json {
                println!("{}", serde_json::to_string(&report)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

fn print_event(event: &StatusEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        StatusEvent::Progress { percent, message } => println!("[{:>3}%] {}", percent, message),
        StatusEvent::Completed { files_updated } => {
            println!("Update complete ({} files updated)", files_updated)
        }
        StatusEvent::Failed { error } => eprintln!("Update failed: {}", error),
    }
    Ok(())
}
