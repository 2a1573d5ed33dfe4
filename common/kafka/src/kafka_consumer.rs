use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientConfig, ClientContext, Message, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::group::{GroupConsumer, Record};

/// Group consumer backed by librdkafka, subscribed to a single topic.
pub struct KafkaGroupConsumer {
    consumer: StreamConsumer<GroupContext>,
    topic: String,
}

pub struct GroupContext;

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance event: {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Committed stored offsets"),
            Err(e) => warn!("Failed to commit stored offsets: {}", e),
        }
    }
}

impl KafkaGroupConsumer {
    /// Create the consumer, check that the brokers answer and join the group
    /// for `topic`. Errors here are the registration failures: bad config,
    /// no broker reachable within `connect_timeout`, subscription rejected.
    ///
    /// Blocks for up to `connect_timeout`; call from a blocking context.
    pub fn new(
        config: &ClientConfig,
        topic: &str,
        connect_timeout: Duration,
    ) -> Result<Self, KafkaError> {
        debug!("rdkafka configuration: {:?}", config);
        let consumer: StreamConsumer<GroupContext> = config.create_with_context(GroupContext)?;

        // "Ping" the Kafka brokers by requesting metadata for the topic
        match consumer.fetch_metadata(Some(topic), connect_timeout) {
            Ok(metadata) => info!(
                topic,
                "Connected to Kafka brokers, {} broker(s) known",
                metadata.brokers().len()
            ),
            Err(error) => {
                warn!(topic, "Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        consumer.subscribe(&[topic])?;

        Ok(Self {
            consumer,
            topic: topic.to_owned(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    Record {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

#[async_trait]
impl GroupConsumer for KafkaGroupConsumer {
    async fn recv(&self) -> Result<Record, KafkaError> {
        let message = self.consumer.recv().await?;
        Ok(to_record(&message))
    }

    fn mark_processed(&self, record: &Record) -> Result<(), KafkaError> {
        // The stored offset is the next one the group reads after a restart.
        self.consumer
            .store_offset(&record.topic, record.partition, record.offset + 1)
    }
}
