//! # Waiting Room Server
//!
//! Serves the virtual waiting room over HTTP and WebSocket:
//! - `POST /lines/{resource}/turn` draws a turn.
//! - `GET  /lines/{resource}/next_in` upgrades to a WebSocket that receives
//!   the admission counter every broadcast tick.
//! - `GET  /lines/{resource}/token?turn=N` claims access once admitted.
//! - `POST /lines/{resource}/release?turn=N` lets the next turn in.
//! - `GET  /lines/{resource}/status` and `GET /health` for operators.
//!
//! A reaper task hands expired accesses back to their lines. Ctrl-C or
//! SIGTERM stops the listener, the reaper and every broadcaster.

use anyhow::Result;
use lib_waitline::LineRegistry;
use lib_waitline::loggers::setup_logging;
use servers::waitline_logic::{config, downstream, reaper, state};
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let log_path = setup_logging(config.log_dir(), config.log_level(), "server_waitline")?;
    log::info!("Logging to {}", log_path.display());

    let line_config = config.line_config()?;
    log::info!("Line defaults: {:?}", line_config);
    let registry = Arc::new(LineRegistry::in_memory(line_config)?);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let app_state = state::AppState::new(registry.clone());

    let downstream_handle = tokio::spawn(downstream::run(
        config.clone(),
        app_state,
        shutdown_tx.subscribe(),
    ));

    let reaper_handle = tokio::spawn(reaper::run(
        registry.clone(),
        config.reap_interval(),
        shutdown_tx.subscribe(),
    ));

    wait_for_signal().await?;

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());
    registry.shutdown();

    // Wait for components to shut down
    let (served, _) = tokio::try_join!(downstream_handle, reaper_handle)?;
    served?;

    log::info!("Shutdown complete.");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                log::info!("Ctrl-C received, initiating shutdown.");
            }
            _ = term_signal.recv() => {
                log::info!("SIGTERM received, initiating shutdown.");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        log::info!("Ctrl-C received, initiating shutdown.");
    }
    Ok(())
}
