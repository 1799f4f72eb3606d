// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! sentinel — event-driven surveillance recorder
//!
//! Usage:
//!   sentinel run    --config config.toml
//!   sentinel status --config config.toml
//!   sentinel list   --config config.toml [--stream front-door]
//!   sentinel delete --config config.toml --id 42

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sentinel::api;
use sentinel::catalogue::{Catalogue, Page, RecordingFilter, SortKey, SortOrder};
use sentinel::config::Config;
use sentinel::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "sentinel", about = "Event-driven surveillance recorder", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch all configured streams and record detection events.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print a catalogue summary and exit.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// List recordings, optionally filtered by stream name.
    List {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Stream name to filter by.
        #[arg(long)]
        stream: Option<String>,
        /// Maximum rows to print.
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Delete a recording and its files by catalogue id.
    Delete {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Catalogue row id.
        #[arg(long)]
        id: i64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            run(config).await;
        }
        Command::Status { config } => {
            run_status(config);
        }
        Command::List { config, stream, limit } => {
            run_list(config, stream, limit);
        }
        Command::Delete { config, id } => {
            run_delete(config, id);
        }
    }
}

async fn run(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        streams = cfg.streams.len(),
        recordings_dir = ?cfg.storage.recordings_dir,
        max_storage_gb = cfg.storage.max_storage_gb,
        pre_buffer_s = cfg.recording.pre_buffer_seconds,
        post_buffer_s = cfg.recording.post_buffer_seconds,
        "Starting sentinel"
    );

    let supervisor = match Supervisor::start(cfg.clone()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to start supervisor");
            std::process::exit(1);
        }
    };

    // Start HTTP API if enabled.
    if cfg.api.enabled {
        let state = Arc::new(api::AppState { supervisor: supervisor.clone() });
        let port = cfg.api.port;
        tokio::spawn(async move {
            api::start_server(state, port).await;
        });
    }

    wait_for_shutdown_signal().await;
    info!("Received shutdown signal");

    // If teardown stalls (stuck decoder), the watchdog forces an exit.
    supervisor.arm_watchdog();
    supervisor.shutdown().await;
}

/// Resolve on either SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn open_catalogue(config_path: &PathBuf) -> (Config, Catalogue) {
    let cfg = match Config::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };
    let db_path = cfg.storage.recordings_dir.join("recordings.db");
    match Catalogue::open(&db_path) {
        Ok(c) => (cfg, c),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn run_status(config_path: PathBuf) {
    let (cfg, catalogue) = open_catalogue(&config_path);

    let total = catalogue.count(&RecordingFilter::default()).unwrap_or(0);
    let used = sentinel::janitor::dir_size(&cfg.storage.recordings_dir);

    println!("=== sentinel status ===");
    println!("Recordings dir : {}", cfg.storage.recordings_dir.display());
    println!(
        "Disk usage     : {:.2} GB / {:.2} GB",
        used as f64 / 1e9,
        cfg.storage.max_storage_gb
    );
    println!("Recordings     : {}", total);
    println!("Streams        : {}", cfg.streams.len());
    for stream in &cfg.streams {
        println!("  {} — {}", stream.name, sentinel::source::mask_credentials(&stream.url));
    }
}

fn run_list(config_path: PathBuf, stream: Option<String>, limit: u32) {
    let (_cfg, catalogue) = open_catalogue(&config_path);

    let rows = match catalogue.list(
        &RecordingFilter::default(),
        SortKey::Timestamp,
        SortOrder::Desc,
        Page { limit, offset: 0 },
    ) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let rows: Vec<_> = match &stream {
        Some(name) => rows.into_iter().filter(|r| &r.stream_name == name).collect(),
        None => rows,
    };

    if rows.is_empty() {
        println!("No recordings found");
        return;
    }

    println!(
        "{:<6} {:<24} {:<16} {:<10} {:<6} {}",
        "ID", "Start", "Stream", "Duration", "Conf", "File"
    );
    println!("{}", "-".repeat(90));
    for row in &rows {
        println!(
            "{:<6} {:<24} {:<16} {:<10.2} {:<6.2} {}",
            row.id, row.timestamp, row.stream_name, row.duration, row.confidence, row.file_path,
        );
    }
    println!("\nTotal: {} recordings", rows.len());
}

fn run_delete(config_path: PathBuf, id: i64) {
    let (_cfg, catalogue) = open_catalogue(&config_path);
    match catalogue.delete(id) {
        Ok(true) => println!("Deleted recording {id}"),
        Ok(false) => {
            eprintln!("Recording {id} not found");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
