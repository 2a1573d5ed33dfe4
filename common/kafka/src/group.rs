//! Consumer-group session and partition-claim protocol.
//!
//! A session pulls records from a [`GroupConsumer`] and hands them to one
//! [`Claim`] per (topic, partition). Each claim is drained by its own task
//! through [`ClaimHandler::consume_claim`], so records of one partition are
//! handled strictly in arrival order while different partitions progress
//! independently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Records buffered per partition claim before the session stops pulling.
const CLAIM_BUFFER_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// A record delivered by the broker. A missing payload is the empty payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// The broker capability a session runs against.
#[async_trait]
pub trait GroupConsumer: Send + Sync + 'static {
    /// Wait for the next record. Any error ends the current session.
    async fn recv(&self) -> Result<Record, KafkaError>;

    /// Mark a record as processed so its offset is committed.
    fn mark_processed(&self, record: &Record) -> Result<(), KafkaError>;
}

#[async_trait]
impl<T: GroupConsumer + ?Sized> GroupConsumer for Arc<T> {
    async fn recv(&self) -> Result<Record, KafkaError> {
        (**self).recv().await
    }

    fn mark_processed(&self, record: &Record) -> Result<(), KafkaError> {
        (**self).mark_processed(record)
    }
}

/// Handle to the running session, shared by all of its claims.
#[derive(Clone)]
pub struct GroupSession {
    consumer: Arc<dyn GroupConsumer>,
    generation: u64,
}

impl GroupSession {
    /// Sequence number of this session within its consumption loop, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mark_record(&self, record: &Record) -> Result<(), KafkaError> {
        self.consumer.mark_processed(record)
    }
}

/// The records of a single partition for the lifetime of one session.
pub struct Claim {
    topic: String,
    partition: i32,
    records: mpsc::Receiver<Record>,
}

impl Claim {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Next record of this partition, or `None` once the session has ended
    /// and everything already claimed has been handed out.
    pub async fn next_record(&mut self) -> Option<Record> {
        self.records.recv().await
    }
}

/// Callbacks driven by [`run_session`].
#[async_trait]
pub trait ClaimHandler: Send + Sync + 'static {
    /// Runs before any claim of the session is started.
    async fn setup(&self, _session: &GroupSession) -> Result<(), ConsumeError> {
        Ok(())
    }

    /// Runs after every claim of the session has returned.
    async fn cleanup(&self, _session: &GroupSession) {}

    /// Drain a claim. Returning early abandons the rest of the partition for
    /// this session; a new claim is opened if more records arrive.
    async fn consume_claim(&self, session: GroupSession, claim: Claim) -> Result<(), ConsumeError>;
}

/// Run one consumer-group session until the consumer reports an error or
/// `shutdown` is cancelled. A cancelled session ends cleanly with `Ok(())`.
///
/// Claims keep draining the records they were already handed after the
/// session stops pulling, then `cleanup` runs.
pub async fn run_session(
    consumer: &Arc<dyn GroupConsumer>,
    handler: &Arc<dyn ClaimHandler>,
    generation: u64,
    shutdown: &CancellationToken,
) -> Result<(), ConsumeError> {
    let session = GroupSession {
        consumer: Arc::clone(consumer),
        generation,
    };
    handler.setup(&session).await?;
    debug!(generation, "consumer group session started");

    let mut claims: HashMap<(String, i32), mpsc::Sender<Record>> = HashMap::new();
    let mut workers = JoinSet::new();

    let outcome = loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            next = consumer.recv() => match next {
                Ok(record) => record,
                Err(e) => break Err(ConsumeError::from(e)),
            },
        };

        let key = (record.topic.clone(), record.partition);
        let sender = claims.entry(key.clone()).or_insert_with(|| {
            open_claim(&mut workers, handler, &session, &record.topic, record.partition)
        });

        let rejected = match sender.send(record).await {
            Ok(()) => None,
            Err(mpsc::error::SendError(record)) => Some(record),
        };

        if let Some(record) = rejected {
            // The handler returned from this claim early, start a fresh one.
            warn!(
                topic = %key.0,
                partition = key.1,
                "partition claim closed, reopening"
            );
            let sender = open_claim(&mut workers, handler, &session, &key.0, key.1);
            if sender.send(record).await.is_err() {
                error!(topic = %key.0, partition = key.1, "reopened partition claim closed immediately");
            }
            claims.insert(key, sender);
        }
    };

    drop(claims);
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(generation, error = %e, "partition claim ended with error"),
            Err(e) => error!(generation, error = %e, "partition claim task failed"),
        }
    }

    handler.cleanup(&session).await;
    debug!(generation, "consumer group session ended");

    outcome
}

fn open_claim(
    workers: &mut JoinSet<Result<(), ConsumeError>>,
    handler: &Arc<dyn ClaimHandler>,
    session: &GroupSession,
    topic: &str,
    partition: i32,
) -> mpsc::Sender<Record> {
    let (tx, rx) = mpsc::channel(CLAIM_BUFFER_SIZE);
    let claim = Claim {
        topic: topic.to_owned(),
        partition,
        records: rx,
    };
    let handler = Arc::clone(handler);
    let session = session.clone();
    workers.spawn(async move { handler.consume_claim(session, claim).await });
    tx
}
