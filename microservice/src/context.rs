use std::borrow::Cow;
use std::sync::Weak;

use common_kafka::Record;
use tracing::info;

use crate::service::Shared;

/// Tag attached to every line logged while processing a consumed record.
pub const CONSUMER_TAG: &str = "Consumer";

mod sealed {
    pub trait Sealed {}
}

/// What a handler can do with the message that triggered it, independent of
/// the transport that delivered it. Implemented by the transport-specific
/// contexts of this crate only.
pub trait Context: sealed::Sealed + Send + Sync {
    /// Log a line tagged with the transport this context belongs to.
    fn log(&self, message: &str);

    /// Named routing parameter of the request, if the transport has any.
    fn param(&self, name: &str) -> Option<&str>;

    /// Reply to the caller, if the transport has one.
    fn response(&self, code: u16, data: serde_json::Value);

    /// The message body as text. A body that is valid UTF-8 comes back
    /// unchanged. Invalid byte sequences are replaced with U+FFFD, so such a
    /// body does not round-trip; transports expose the raw bytes separately.
    fn read_input(&self) -> Cow<'_, str>;
}

/// Context of a single consumed record. Created for one handler invocation
/// and dropped when it returns.
pub struct ConsumerContext {
    service: Weak<Shared>,
    topic: String,
    partition: i32,
    offset: i64,
    payload: Vec<u8>,
}

impl ConsumerContext {
    pub(crate) fn new(service: Weak<Shared>, record: &Record) -> Self {
        Self {
            service,
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            payload: record.payload.clone(),
        }
    }

    /// The record payload, byte for byte.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl sealed::Sealed for ConsumerContext {}

impl Context for ConsumerContext {
    fn log(&self, message: &str) {
        match self.service.upgrade() {
            Some(service) => service.log(CONSUMER_TAG, message),
            // The service is gone, keep the line anyway.
            None => info!(tag = CONSUMER_TAG, "{}: {}", CONSUMER_TAG, message),
        }
    }

    // Records have no routing parameters.
    fn param(&self, _name: &str) -> Option<&str> {
        None
    }

    // Nobody is waiting for a reply to a consumed record.
    fn response(&self, _code: u16, _data: serde_json::Value) {}

    /// Borrows the payload when it is valid UTF-8. Invalid sequences are
    /// replaced; use [`ConsumerContext::payload`] for the raw bytes.
    fn read_input(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
