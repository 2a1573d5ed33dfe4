pub mod config;
pub mod consumer_config;
pub mod group;
pub mod kafka_consumer;

pub use config::{ConsumerConfig, KafkaConfig};
pub use consumer_config::ConsumerConfigBuilder;
pub use group::{Claim, ClaimHandler, ConsumeError, GroupConsumer, GroupSession, Record};
pub use kafka_consumer::KafkaGroupConsumer;
