//! Runs application handlers against Kafka consumer groups as a long-lived
//! service that shuts down on SIGINT/SIGTERM or an explicit stop.

pub mod adapter;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod handler;
pub mod log;
pub mod metrics_consts;
pub mod service;
mod signals;

pub use context::{ConsumerContext, Context};
pub use error::ServiceError;
pub use events::ServiceEvent;
pub use handler::Handler;
pub use log::{LogSink, TracingLogSink};
pub use service::{Microservice, MicroserviceBuilder};
