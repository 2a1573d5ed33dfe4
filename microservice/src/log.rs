use tracing::info;

/// Destination of the service's tagged diagnostic lines.
pub trait LogSink: Send + Sync + 'static {
    fn log(&self, tag: &str, message: &str);
}

/// Default sink: one INFO event per line, tag carried as a field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, tag: &str, message: &str) {
        info!(tag, "{}: {}", tag, message);
    }
}
