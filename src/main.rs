use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use coachbook::config::Config;
use coachbook::engine::Engine;
use coachbook::identity::InMemoryDirectory;

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    coachbook::observability::init(config.metrics_port)?;

    // Identity lives with an external collaborator; the store itself does
    // not need it to replay, report or compact.
    let directory = Arc::new(InMemoryDirectory::new());
    let engine = Engine::open(&config, directory)?;

    let stats = engine.stats().await;
    info!("coachbook store at {}", config.wal_path().display());
    info!("  owners: {}", stats.owners);
    info!("  slots: {}", stats.slots);
    info!("  participants: {}", stats.participants);
    info!("  replayed events: {}", stats.replayed_events);
    if stats.torn_tail {
        tracing::warn!("  torn WAL tail was discarded on open");
    }
    info!(
        "  working hours: {:02}:00-{:02}:00 UTC, {} min buckets",
        config.working_hours.start_hour, config.working_hours.end_hour, config.working_hours.bucket_minutes
    );
    info!("  lock wait: {:?} x{}", config.lock_timeout, config.lock_retries + 1);

    if stats.replayed_events as u64 >= config.compact_threshold {
        let written = engine.compact_wal().await?;
        info!("compacted WAL: {} events -> {written}", stats.replayed_events);
    }

    if let Some(port) = config.metrics_port {
        info!("serving metrics on :{port} until shutdown");
        shutdown_signal().await?;
        info!("shutdown signal received");
    }

    info!("coachbook stopped");
    Ok(())
}
