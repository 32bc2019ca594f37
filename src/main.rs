//! HEOS Control - event monitor
//!
//! Connects to the configured HEOS device, selects a player and logs every
//! change event until Ctrl+C or SIGTERM.

use heos_control::{config, HeosSession, SessionEvent};

use anyhow::{Context, Result};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "heos_control=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting HEOS Control v{} ({})",
        env!("HEOS_VERSION"),
        env!("HEOS_GIT_SHA")
    );

    // Load configuration
    let config = config::load_config()?;
    let host = config
        .host
        .clone()
        .context("no HEOS host configured (set HEOS_HOST or host in config.toml)")?;
    tracing::info!("Configuration loaded, device: {}:{}", host, config.port);

    let session = HeosSession::new(config.session_config());
    let mut events = session.subscribe_all();

    let player = session
        .connect_and_discover(None)
        .await
        .with_context(|| format!("failed to connect to {}", host))?;
    tracing::info!(
        "Monitoring {} (pid {}, model {})",
        player.name,
        player.pid,
        player.model
    );

    match session.get_volume().await {
        Ok(level) => tracing::info!("Volume: {}", level),
        Err(e) => tracing::warn!("Could not read volume: {}", e),
    }
    match session.get_play_state().await {
        Ok(state) => tracing::info!("Play state: {}", state),
        Err(e) => tracing::warn!("Could not read play state: {}", e),
    }
    match session.get_now_playing().await {
        Ok(media) => tracing::info!(
            "Now playing: {} - {}",
            media.artist.as_deref().unwrap_or("?"),
            media.song.as_deref().unwrap_or("?")
        ),
        Err(e) => tracing::warn!("Could not read now playing: {}", e),
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(event @ SessionEvent::ConnectionLost { .. }) => {
                    tracing::error!("{}", event);
                    break;
                }
                Some(event) => tracing::info!("{}", event),
                None => break,
            }
        }
    }

    session.disconnect().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
