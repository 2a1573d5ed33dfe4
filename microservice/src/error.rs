use thiserror::Error;

/// Errors surfaced by the service lifecycle. Consumption failures never show
/// up here, they are logged and published as `ServiceEvent`s instead.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("failed to install {signal} handler: {source}")]
    SignalHandler {
        signal: &'static str,
        source: std::io::Error,
    },
}
