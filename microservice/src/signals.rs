use crate::error::ServiceError;

/// OS termination signals `start` waits on: SIGINT and SIGTERM, or ctrl-c
/// where SIGTERM doesn't exist. Handlers are installed when this is created.
#[cfg(unix)]
pub(crate) struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    pub(crate) fn install() -> Result<Self, ServiceError> {
        use tokio::signal::unix::{signal, SignalKind};

        let interrupt =
            signal(SignalKind::interrupt()).map_err(|source| ServiceError::SignalHandler {
                signal: "SIGINT",
                source,
            })?;
        let terminate =
            signal(SignalKind::terminate()).map_err(|source| ServiceError::SignalHandler {
                signal: "SIGTERM",
                source,
            })?;

        Ok(Self {
            interrupt,
            terminate,
        })
    }

    /// Wait for the next signal and return its name.
    pub(crate) async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
pub(crate) struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    pub(crate) fn install() -> Result<Self, ServiceError> {
        Ok(Self)
    }

    pub(crate) async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(e) => {
                tracing::error!("failed to listen for ctrl-c: {}", e);
                std::future::pending().await
            }
        }
    }
}
