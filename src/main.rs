// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! eforms-guard service
//!
//! Security front for public form endpoints. Issues single-use submission
//! tokens and checks every submission against them:
//!
//! - token validation with origin, timing and JavaScript signals
//! - honeypot field handling
//! - per-client throttling with cooldown and hard blocks
//! - adaptive challenge verification (Turnstile, hCaptcha, reCAPTCHA)
//! - replay ledger guaranteeing at-most-once processing
//! - garbage collection of expired on-disk state
//!
//! ## Usage
//!
//! ```text
//! eforms-guard serve              # HTTP service with periodic GC
//! eforms-guard gc --dry-run       # report what one GC pass would delete
//! eforms-guard gc --limit 1000    # run one GC pass
//! ```
//!
//! ## Configuration
//!
//! A JSON file named by `EFORMS_CONFIG`, then individual overrides:
//!
//! - `EFORMS_BIND_ADDR`: Server bind address (default: 0.0.0.0:8080)
//! - `EFORMS_STORAGE_ROOT`: Directory holding `eforms-private/`
//! - `EFORMS_TOKEN_TTL_SECONDS`: Token lifetime (default: 3600)
//! - `EFORMS_THROTTLE_ENABLE`, `EFORMS_THROTTLE_MAX_PER_MINUTE`
//! - `EFORMS_CHALLENGE_MODE`, `EFORMS_CHALLENGE_SITE_KEY`, `EFORMS_CHALLENGE_SECRET_KEY`
//!
//! A `.env` file in the working directory is loaded first.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use eforms_guard::{
    client_ip::ClientIpResolver,
    clock::{Clock, SystemClock},
    config::Config,
    gc::{GcOptions, GcRunner},
    handlers::{build_router, AppState},
    metrics::Metrics,
    pipeline::{PassthroughStages, SubmitPipeline},
};

#[derive(Parser)]
#[command(name = "eforms-guard", version, about = "Form submission security service")]
struct Args {
    /// JSON configuration file (overrides EFORMS_CONFIG)
    #[arg(long, env = "EFORMS_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Run a single garbage collection pass and print the summary as JSON
    Gc {
        /// Report candidates without deleting anything
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of files to examine
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::load(args.config.as_deref())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match args.command.unwrap_or(Command::Serve) {
        Command::Gc { dry_run, limit } => {
            let runner = GcRunner::new(config, clock);
            let summary = tokio::task::spawn_blocking(move || {
                runner.run(&GcOptions {
                    dry_run,
                    limit,
                    now: None,
                })
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.ok {
                std::process::exit(if summary.locked { 2 } else { 1 });
            }
            Ok(())
        }
        Command::Serve => serve(config, clock).await,
    }
}

async fn serve(config: Arc<Config>, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    info!(
        bind_addr = %config.bind_addr,
        storage_root = %config.storage.root.display(),
        origin_mode = ?config.security.origin_mode,
        challenge_mode = ?config.challenge.mode,
        throttle = config.throttle.enable,
        "Starting eforms-guard"
    );

    let metrics = if config.metrics.enabled {
        Some(Metrics::new()?)
    } else {
        None
    };

    let mut pipeline = SubmitPipeline::new(config.clone(), clock.clone(), Arc::new(PassthroughStages))?;
    if let Some(metrics) = &metrics {
        pipeline = pipeline.with_metrics(metrics.clone());
    }

    let report = Arc::clone(pipeline.health()).check_async().await;
    if !report.ok {
        warn!(reason = report.reason, "Storage is not healthy; submissions will fail closed");
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        pipeline,
        resolver: ClientIpResolver::new(&config.privacy),
        metrics: metrics.clone(),
    });

    // Spawn GC task
    if config.gc.interval_seconds > 0 {
        let runner = Arc::new(GcRunner::new(config.clone(), clock));
        let period = Duration::from_secs(config.gc.interval_seconds);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let runner = Arc::clone(&runner);
                match tokio::task::spawn_blocking(move || runner.run(&GcOptions::default())).await {
                    Ok(summary) => {
                        if let Some(metrics) = &metrics {
                            metrics.gc_pass(&summary);
                        }
                    }
                    Err(err) => warn!(error = %err, "GC task failed"),
                }
            }
        });
    }

    let app = build_router(state);

    // Start server
    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
