//! Consume records from a topic and log every payload until SIGINT/SIGTERM.
use anyhow::{Context as _, Result};
use envconfig::Envconfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use microservice::config::Config;
use microservice::{ConsumerContext, Context, Microservice};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().context("failed to load configuration from env")?;
    info!(
        topic = %config.kafka_consumer_topic,
        group_id = %config.kafka_consumer_group,
        brokers = %config.kafka.kafka_hosts,
        "Starting microservice"
    );

    let service = Microservice::builder()
        .with_config(config.service.clone())
        .build();

    service.consume(
        &config.kafka.kafka_hosts,
        &config.kafka_consumer_topic,
        &config.kafka_consumer_group,
        |ctx: ConsumerContext| async move {
            ctx.log(&format!("Processing message: {}", ctx.read_input()));
            anyhow::Ok(())
        },
    )?;

    service.start().await?;
    service.cleanup()?;

    Ok(())
}
