//! Binds a [`Handler`] to a consumer group: one adapter per registration,
//! driven by the session/claim protocol of `common_kafka::group`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::group::{self, Claim, ClaimHandler, ConsumeError, GroupConsumer, GroupSession};
use common_kafka::Record;
use futures::FutureExt;
use rdkafka::error::KafkaError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{ConsumerContext, CONSUMER_TAG};
use crate::events::ServiceEvent;
use crate::handler::Handler;
use crate::metrics_consts::{
    GROUP_JOIN_FAILURES, HANDLER_FAILURES, MARK_FAILURES, MESSAGES_RECEIVED, SESSION_ERRORS,
};
use crate::service::Shared;

/// The (topic, group) pair a handler was registered for.
#[derive(Debug, Clone)]
pub struct Registration {
    pub topic: String,
    pub group_id: String,
}

/// Feeds the records of every claim through the registered handler.
///
/// Records are marked processed after the handler returns, whatever it
/// returned: a failing record is logged and skipped, never retried.
pub struct ConsumptionAdapter<H> {
    handler: H,
    registration: Registration,
    service: Weak<Shared>,
}

impl<H: Handler> ConsumptionAdapter<H> {
    pub(crate) fn new(handler: H, registration: Registration, service: Weak<Shared>) -> Self {
        Self {
            handler,
            registration,
            service,
        }
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    fn log(&self, message: &str) {
        if let Some(service) = self.service.upgrade() {
            service.log(CONSUMER_TAG, message);
        }
    }

    fn publish(&self, event: ServiceEvent) {
        if let Some(service) = self.service.upgrade() {
            service.publish(event);
        }
    }

    async fn process(&self, session: &GroupSession, record: Record) {
        metrics::counter!(MESSAGES_RECEIVED, "topic" => record.topic.clone()).increment(1);
        self.log(&format!(
            "Message received: {}",
            String::from_utf8_lossy(&record.payload)
        ));

        let ctx = ConsumerContext::new(self.service.clone(), &record);
        let outcome = AssertUnwindSafe(self.handler.handle(ctx))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(panic) => Some(format!("handler panicked: {}", panic_message(&*panic))),
        };

        if let Some(error) = failure {
            metrics::counter!(HANDLER_FAILURES, "topic" => record.topic.clone()).increment(1);
            self.log(&format!("Handler error: {error}"));
            self.publish(ServiceEvent::HandlerFailed {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                error,
            });
        }

        if let Err(e) = session.mark_record(&record) {
            metrics::counter!(MARK_FAILURES, "topic" => record.topic.clone()).increment(1);
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Failed to mark record processed: {}",
                e
            );
            self.publish(ServiceEvent::MarkFailed {
                topic: record.topic,
                partition: record.partition,
                offset: record.offset,
                error: e.to_string(),
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[async_trait]
impl<H: Handler> ClaimHandler for ConsumptionAdapter<H> {
    async fn setup(&self, session: &GroupSession) -> Result<(), ConsumeError> {
        debug!(
            topic = %self.registration.topic,
            group_id = %self.registration.group_id,
            generation = session.generation(),
            "session setup"
        );
        self.publish(ServiceEvent::SessionStarted {
            topic: self.registration.topic.clone(),
            group_id: self.registration.group_id.clone(),
            generation: session.generation(),
        });
        Ok(())
    }

    async fn cleanup(&self, session: &GroupSession) {
        debug!(
            topic = %self.registration.topic,
            group_id = %self.registration.group_id,
            generation = session.generation(),
            "session cleanup"
        );
    }

    async fn consume_claim(&self, session: GroupSession, mut claim: Claim) -> Result<(), ConsumeError> {
        debug!(
            topic = claim.topic(),
            partition = claim.partition(),
            generation = session.generation(),
            "claim started"
        );
        while let Some(record) = claim.next_record().await {
            self.process(&session, record).await;
        }
        Ok(())
    }
}

/// Background loop of one registration.
///
/// Joins the group through `connect`, run on the blocking pool; a failure
/// there is logged and ends the loop for good, without retries. Afterwards
/// sessions are restarted after every broker error until `shutdown` is
/// cancelled.
pub(crate) async fn run_consumer_loop<H, C, F>(
    adapter: ConsumptionAdapter<H>,
    connect: F,
    shutdown: CancellationToken,
    retry_backoff: Duration,
) where
    H: Handler,
    C: GroupConsumer,
    F: FnOnce() -> Result<C, KafkaError> + Send + 'static,
{
    let registration = adapter.registration().clone();

    // Creating the consumer waits on the brokers, keep it off the runtime threads.
    let connected = match tokio::task::spawn_blocking(connect).await {
        Ok(connected) => connected.map_err(|e| e.to_string()),
        Err(e) => Err(format!("consumer setup task failed: {e}")),
    };

    let consumer: Arc<dyn GroupConsumer> = match connected {
        Ok(consumer) => Arc::new(consumer),
        Err(error) => {
            metrics::counter!(GROUP_JOIN_FAILURES, "topic" => registration.topic.clone())
                .increment(1);
            adapter.log(&format!("Error creating consumer group: {error}"));
            adapter.publish(ServiceEvent::GroupJoinFailed {
                topic: registration.topic,
                group_id: registration.group_id,
                error,
            });
            return;
        }
    };

    info!(
        topic = %registration.topic,
        group_id = %registration.group_id,
        "consumer loop started"
    );

    let adapter = Arc::new(adapter);
    let claim_handler: Arc<dyn ClaimHandler> = adapter.clone();
    let mut generation = 0;

    loop {
        generation += 1;
        if let Err(e) = group::run_session(&consumer, &claim_handler, generation, &shutdown).await {
            metrics::counter!(SESSION_ERRORS, "topic" => registration.topic.clone()).increment(1);
            adapter.log(&format!("Error during consume: {e}"));
            adapter.publish(ServiceEvent::SessionError {
                topic: registration.topic.clone(),
                group_id: registration.group_id.clone(),
                generation,
                error: e.to_string(),
            });

            if !retry_backoff.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(retry_backoff) => {}
                }
            }
        }

        if shutdown.is_cancelled() {
            break;
        }
    }

    info!(
        topic = %registration.topic,
        group_id = %registration.group_id,
        "consumer loop stopped"
    );
    adapter.publish(ServiceEvent::ConsumerStopped {
        topic: registration.topic,
        group_id: registration.group_id,
    });
}
