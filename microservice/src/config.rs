use std::str::FromStr;
use std::time;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

/// Configuration of the `microservice` binary.
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "login")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "example-group")]
    pub kafka_consumer_group: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub service: ServiceConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ServiceConfig {
    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    // How long `start` waits for consumption loops after shutdown begins
    #[envconfig(from = "SHUTDOWN_TIMEOUT_MS", default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    // Pause before a failed consumer group session is restarted
    #[envconfig(from = "SESSION_RETRY_BACKOFF_MS", default = "100")]
    pub session_retry_backoff: EnvMsDuration,

    #[envconfig(default = "1024")]
    pub event_buffer_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            consumer: ConsumerConfig::default(),
            shutdown_timeout: EnvMsDuration(time::Duration::from_secs(30)),
            session_retry_backoff: EnvMsDuration(time::Duration::from_millis(100)),
            event_buffer_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
