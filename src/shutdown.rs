use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install the SIGTERM/SIGINT handler for the engine daemon.
///
/// The first signal cancels the returned token; the engine loops watch it,
/// drain, and write a final snapshot. A second signal skips the drain and
/// exits immediately, for operators stuck behind a hung pipeline stage.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "Shutting down; draining loops and snapshotting");
        token_clone.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal received, exiting without draining");
        std::process::exit(130);
    });

    token
}
