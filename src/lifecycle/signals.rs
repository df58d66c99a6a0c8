//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP triggers config reload, not shutdown

/// What a received signal asks the process to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

/// Wait for the next signal of interest.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<SignalEvent> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let event = tokio::select! {
        _ = terminate.recv() => {
            tracing::info!("SIGTERM received");
            SignalEvent::Shutdown
        }
        _ = interrupt.recv() => {
            tracing::info!("SIGINT received");
            SignalEvent::Shutdown
        }
        _ = hangup.recv() => {
            tracing::info!("SIGHUP received");
            SignalEvent::Reload
        }
    };
    Ok(event)
}

/// Wait for the next signal of interest.
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<SignalEvent> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received");
    Ok(SignalEvent::Shutdown)
}
