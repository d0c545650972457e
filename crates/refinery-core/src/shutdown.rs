//! Signal-driven shutdown.
//!
//! SIGINT and SIGTERM cancel a [`CancellationToken`]. Engines observe it
//! between stages, finish the stage in progress and checkpoint before exiting.

use tokio_util::sync::CancellationToken;

use crate::Result;

/// Which signal asked for shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Token cancelled by the first SIGINT or SIGTERM.
///
/// # Errors
///
/// Fails if the signal handlers cannot be installed.
pub fn shutdown_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    cancel_on_signal(token.clone())?;
    Ok(token)
}

#[cfg(unix)]
fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint =
        signal(SignalKind::interrupt()).map_err(|e| handler_error(ShutdownSignal::Interrupt, e))?;
    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|e| handler_error(ShutdownSignal::Terminate, e))?;

    tokio::spawn(async move {
        let received = tokio::select! {
            _ = sigint.recv() => ShutdownSignal::Interrupt,
            _ = sigterm.recv() => ShutdownSignal::Terminate,
            () = token.cancelled() => return,
        };
        tracing::info!(signal = %received, "shutdown requested; finishing current stage");
        token.cancel();
    });
    Ok(())
}

#[cfg(unix)]
fn handler_error(signal: ShutdownSignal, source: std::io::Error) -> crate::Error {
    crate::Error::SignalHandler {
        signal: signal.to_string(),
        source,
    }
}

#[cfg(not(unix))]
fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "ctrl-c handler failed");
                    return;
                }
                tracing::info!(signal = %ShutdownSignal::Interrupt, "shutdown requested; finishing current stage");
                token.cancel();
            }
            () = token.cancelled() => {}
        }
    });
    Ok(())
}
