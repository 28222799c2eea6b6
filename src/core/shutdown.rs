//! # OS termination signals.
//!
//! [`wait_for_shutdown_signal`] completes when the process is asked to stop;
//! [`Manager::run_until_signal`](crate::Manager::run_until_signal) then stops
//! every task and monitor within the configured grace.
//!
//! - Unix: `SIGINT`, `SIGTERM`, `SIGQUIT` and Ctrl-C
//! - Windows: Ctrl-C only

/// Waits for a termination signal.
///
/// Returns `Err` if the signal listeners cannot be installed.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
