//! Rollcall Server - Main entry point.
//!
//! This binary starts the check-in server with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - The background auto-finalize sweep
//!
//! # Configuration
//!
//! See [`rollcall_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (identity headers trusted as-is)
//! ROLLCALL_UNSAFE_NO_AUTH=true cargo run --bin rollcall-server
//!
//! # Production mode
//! ROLLCALL_GATEWAY_TOKEN="secret-token" \
//! ROLLCALL_TOKEN_SIGNING_KEY="base64seed" \
//! PORT=8080 \
//! cargo run --release --bin rollcall-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use rollcall_server::config::Config;
use rollcall_server::routes::{create_router, AppState};
use rollcall_server::scheduler::FinalizeSweeper;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables (when auth enabled):");
            eprintln!("  ROLLCALL_GATEWAY_TOKEN        - Bearer token sent by the gateway");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                          - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                      - Log level filter (default: info)");
            eprintln!("  ROLLCALL_TOKEN_SIGNING_KEY    - Base64 Ed25519 seed for signed tokens");
            eprintln!("  ROLLCALL_SWEEP_INTERVAL_SECS  - Auto-finalize interval (default: 60)");
            eprintln!("  ROLLCALL_AUTO_FINALIZE        - Set to 'false' to disable the sweep");
            eprintln!("  ROLLCALL_UNSAFE_NO_AUTH       - Disable auth (dev only, set to 'true')");
            return ExitCode::from(1);
        }
    };

    let auth_mode = if config.unsafe_no_auth {
        "disabled (UNSAFE)"
    } else {
        "enabled"
    };
    info!(
        port = config.port,
        auth_mode = auth_mode,
        signed_tokens = config.token_signing_seed.is_some(),
        auto_finalize = config.auto_finalize,
        "Rollcall server starting"
    );

    let state = AppState::new(config.clone());

    let sweep_handle = if config.auto_finalize {
        Some(FinalizeSweeper::new(Arc::clone(&state.manager)).spawn(config.sweep_interval))
    } else {
        warn!("Auto-finalize sweep disabled; sessions end only when a coach finalizes");
        None
    };

    let outcome = serve(state, config.port).await;

    if let Some(handle) = sweep_handle {
        handle.abort();
        info!("Auto-finalize sweep stopped");
    }

    match outcome {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "Server error");
            ExitCode::from(1)
        }
    }
}

/// Binds the listener and serves until a shutdown signal arrives.
async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    info!(port, address = %bind_addr, "Server listening");

    info!("Server ready to accept connections");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down gracefully");
    Ok(())
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGTERM or SIGINT is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
