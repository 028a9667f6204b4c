//! spindle-server: JSON-RPC host for a shared script connection.
//!
//! Listens on a Unix socket and forwards newline-delimited JSON-RPC requests
//! to one spindle connection. Every client session is its own reply mailbox,
//! so many clients can share the engine while each sees only its own replies.

mod config;
mod handler;
mod protocol;
mod session;

use anyhow::Context;
use config::ServerConfig;
use spindle_core::{mailbox, CorrelationId};
use tokio::net::UnixListener;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log filter used when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "spindle_server=info,spindle_core=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing - logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("spindle-server starting...");

    // Load configuration from environment
    let config = ServerConfig::from_env().context("invalid configuration")?;
    info!(?config, "Configuration loaded");

    let runtime = spindle_core::init();
    let conn = runtime
        .start(config.connection.clone())
        .context("failed to start connection")?;

    if config.auto_open {
        let (requester, mut replies) = mailbox();
        conn.open(CorrelationId::next(), requester)?;
        match replies.recv().await {
            Some(reply) if reply.outcome.is_ok() => info!("Engine opened"),
            Some(reply) => anyhow::bail!("engine failed to open: {:?}", reply.outcome),
            None => anyhow::bail!("worker exited before opening the engine"),
        }
    }

    // Remove existing socket file if it exists
    let socket_path = config.socket_path.clone();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed to remove stale socket {}", socket_path.display()))?;
        debug!("removed existing socket file");
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    info!(path = %socket_path.display(), "listening for connections");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    debug!("accepted new connection");
                    let conn = conn.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session::serve(stream, conn).await {
                            warn!(error = %e, "session error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            },
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal, cleaning up...");
                break;
            }
        }
    }

    drop(listener);

    // Teardown joins worker threads
    let torn_down = tokio::task::spawn_blocking(move || runtime.shutdown()).await?;
    info!(connections = torn_down, "Connections torn down");

    if let Err(e) = std::fs::remove_file(&socket_path) {
        warn!(error = %e, "failed to remove socket file");
    }

    info!("Server shutdown complete");
    Ok(())
}
