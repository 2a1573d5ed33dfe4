use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::consumer_config::ConsumerConfigBuilder;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // Comma-separated list of bootstrap brokers
}

/// Group-consumer policy shared by every registration of a service. The
/// broker list and group id are supplied per registration, everything else
/// is fixed here and never renegotiated at runtime.
#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Start from the oldest retained record when the group has no committed offset
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "roundrobin")]
    pub kafka_consumer_assignment_strategy: String, // roundrobin, range, cooperative-sticky

    // Protocol version assumed when the broker can't answer ApiVersionRequest
    #[envconfig(default = "2.5.0")]
    pub kafka_broker_version_fallback: String,

    #[envconfig(default = "10000")]
    pub kafka_consumer_session_timeout_ms: u32,

    // Stored offsets are flushed to the group coordinator on this interval
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    // Registration fails if no broker answers a metadata request within this
    #[envconfig(default = "15000")]
    pub kafka_consumer_connect_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            kafka_tls: false,
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_consumer_assignment_strategy: "roundrobin".to_string(),
            kafka_broker_version_fallback: "2.5.0".to_string(),
            kafka_consumer_session_timeout_ms: 10000,
            kafka_consumer_auto_commit_interval_ms: 5000,
            kafka_consumer_connect_timeout_ms: 15000,
        }
    }
}

impl ConsumerConfig {
    /// Build the librdkafka client config for one group registration.
    pub fn client_config(&self, bootstrap_servers: &str, group_id: &str) -> ClientConfig {
        ConsumerConfigBuilder::for_group_consumer(bootstrap_servers, group_id)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_assignment_strategy(&self.kafka_consumer_assignment_strategy)
            .with_broker_version_fallback(&self.kafka_broker_version_fallback)
            .with_session_timeout_ms(self.kafka_consumer_session_timeout_ms)
            .with_auto_commit_interval_ms(self.kafka_consumer_auto_commit_interval_ms)
            .build()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_connect_timeout_ms)
    }
}
