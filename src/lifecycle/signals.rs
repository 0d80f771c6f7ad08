use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::{ShutdownHandle, ShutdownTrigger};

/// Wait for SIGINT or SIGTERM
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<ShutdownTrigger> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => Ok(ShutdownTrigger::Interrupt),
        _ = terminate.recv() => Ok(ShutdownTrigger::Terminate),
    }
}

/// Wait for Ctrl-C
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<ShutdownTrigger> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownTrigger::Interrupt)
}

/// Forward the first interrupt/termination signal to the shutdown gate
pub fn spawn_signal_listener(handle: ShutdownHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(trigger) => {
                warn!("received {trigger}; exiting gracefully...");
                handle.trigger(trigger);
            }
            Err(e) => error!("failed to install signal handlers: {e}"),
        }
    })
}
