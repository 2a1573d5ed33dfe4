/// Structured account of what the consumption loops are doing. Every event is
/// also written to the service log; this stream exists for callers that want
/// to assert on or export consumption failures instead of scraping logs.
///
/// Published on a broadcast channel: a subscriber that falls behind by more
/// than `ServiceConfig::event_buffer_size` events observes a lag error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The consumer could not be created or subscribed. The registration is abandoned.
    GroupJoinFailed {
        topic: String,
        group_id: String,
        error: String,
    },
    SessionStarted {
        topic: String,
        group_id: String,
        generation: u64,
    },
    /// A session ended with a broker error and will be restarted unless the service is stopping.
    SessionError {
        topic: String,
        group_id: String,
        generation: u64,
        error: String,
    },
    /// The handler returned an error or panicked. The record is still marked processed.
    HandlerFailed {
        topic: String,
        partition: i32,
        offset: i64,
        error: String,
    },
    MarkFailed {
        topic: String,
        partition: i32,
        offset: i64,
        error: String,
    },
    ConsumerStopped { topic: String, group_id: String },
}
