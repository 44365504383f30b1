use anyhow::Context;
use clap::Parser;
use popcorn_server::housekeeping;
use popcorn_server::logging;
use popcorn_server::stats::{NullSink, StatsSink, StatsdSink};
use popcorn_server::{ServerSettings, ServerState, serve};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{info, warn};

/// Rotate a pre-existing working directory to `<dir>.old` and start fresh.
/// Cache content is warm state only and is not preserved across restarts.
fn cleanup_working_dir(working_dir: &Path) -> anyhow::Result<()> {
    let old_dir = working_dir.with_file_name(format!(
        "{}.old",
        working_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));
    if let Err(e) = std::fs::remove_dir_all(&old_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Can't remove {old_dir:?}: {e}");
        }
    }
    if working_dir.exists() {
        if let Err(e) = std::fs::rename(working_dir, &old_dir) {
            warn!("Can't rotate {working_dir:?} to {old_dir:?}: {e}");
        }
    }
    std::fs::create_dir_all(working_dir)
        .with_context(|| format!("Can't create working directory {working_dir:?}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = ServerSettings::parse();

    let log_writer = logging::init(settings.log_filename.clone(), settings.log_severity)
        .context("Can't init logger")?;

    cleanup_working_dir(&settings.working_dir)?;

    let sink: Box<dyn StatsSink> = match &settings.statsd {
        Some(address) => Box::new(
            StatsdSink::connect(address)
                .with_context(|| format!("Can't reach statsd at {address}"))?,
        ),
        None => Box::new(NullSink),
    };

    let address = settings.listen_address();
    let state = Arc::new(ServerState::new(settings)?);

    // Failing to bind is fatal; everything after this point degrades
    // gracefully instead.
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to listen on {address}"))?;
    info!("Listening on {address}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut sighup = signal(SignalKind::hangup()).context("Can't install SIGHUP handler")?;
    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            info!("Reopening log file");
            if let Err(e) = log_writer.reopen() {
                warn!("Can't reopen log file: {e}");
            }
        }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("Can't install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Can't install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            _ = sigint.recv() => info!("SIGINT received, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let housekeeper = tokio::spawn(housekeeping::run(
        Arc::clone(&state),
        sink,
        shutdown_rx.clone(),
    ));

    serve(state, listener, shutdown_rx).await;
    let _ = housekeeper.await;
    info!("Server stopped");
    Ok(())
}
