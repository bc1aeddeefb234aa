//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommands:
//! - `serve` (default) -- run the HTTP server
//! - `read <url>` -- fetch and analyze one file, print the report
//! - `usage --start --end` -- print usage statistics for a time range
//! - `version` -- print build/version info

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::media::ReadFileRequest;
use crate::service::{usage_poller, AppState};
use crate::usage::GetUsageRequest;

/// Remote file inspection service.
#[derive(Parser, Debug)]
#[command(
    name = "fileinfo",
    version = env!("CARGO_PKG_VERSION"),
    about = "Fetch remote files, analyze them, and report usage"
)]
pub struct Cli {
    /// JSON5 config file (overrides FILEINFO_CONFIG).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server (default when no subcommand is given).
    Serve {
        /// Listen address, overriding the configured one.
        #[arg(short, long)]
        bind: Option<std::net::SocketAddr>,
    },

    /// Fetch a file and print its analysis report as JSON.
    Read {
        /// URL of the file to fetch.
        url: String,

        /// Analyzers to run in addition to MIME detection (md5, sha1, exif, ffprobe).
        #[arg(short, long = "analyzer", value_name = "ID")]
        analyzers: Vec<String>,
    },

    /// Print usage statistics for a time range as JSON.
    Usage {
        /// Range start (RFC 3339).
        #[arg(long)]
        start: DateTime<Utc>,

        /// Range end (RFC 3339).
        #[arg(long)]
        end: DateTime<Utc>,
    },

    /// Print version, build date, and git commit information.
    Version,
}

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

/// Run the `serve` subcommand until Ctrl-C / SIGTERM.
pub async fn handle_serve(
    config: &AppConfig,
    bind: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_config(config).await?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        signal_token.cancel();
    });

    let result = crate::server::serve(state.clone(), bind.unwrap_or(config.bind), shutdown).await;
    state.shutdown().await;
    Ok(result?)
}

/// Run the `read <url>` subcommand.
pub async fn handle_read(
    config: &AppConfig,
    url: String,
    analyzers: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::from_config(config).await?;
    let request = ReadFileRequest {
        url,
        // The request shape needs at least one entry; MIME detection always runs.
        analyzers: if analyzers.is_empty() {
            vec!["mimetype".to_string()]
        } else {
            analyzers
        },
    };

    let result = state.read_file(request, &state.request_context()).await;
    state.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

/// Run the `usage` subcommand.
pub async fn handle_usage(
    config: &AppConfig,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<(), Box<dyn std::error::Error>> {
    let poller = usage_poller(config)?;
    let usage = poller
        .get_usage(&GetUsageRequest {
            start_time: start,
            end_time: end,
        })
        .await?;
    println!("{}", serde_json::to_string_pretty(&usage)?);
    Ok(())
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("fileinfo {}", env!("CARGO_PKG_VERSION"));
    println!("  Build date: {}", env!("FILEINFO_BUILD_DATE"));
    println!("  Git commit: {}", env!("FILEINFO_GIT_HASH"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
