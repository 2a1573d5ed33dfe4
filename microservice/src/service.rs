use std::sync::{Arc, Mutex, PoisonError, Weak};

use common_kafka::{GroupConsumer, KafkaGroupConsumer};
use rdkafka::error::KafkaError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::adapter::{run_consumer_loop, ConsumptionAdapter, Registration};
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::events::ServiceEvent;
use crate::handler::Handler;
use crate::log::{LogSink, TracingLogSink};
use crate::signals::ShutdownSignals;

/// State shared by every clone of a [`Microservice`]. Adapters and contexts
/// only hold weak references to it.
pub(crate) struct Shared {
    config: ServiceConfig,
    log_sink: Arc<dyn LogSink>,
    events: broadcast::Sender<ServiceEvent>,
    // Cancelled once `start` returns, observed by every consumption loop.
    shutdown: CancellationToken,
    consumers: TaskTracker,
    // Single-slot stop request, only present while `start` is waiting.
    exit_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Shared {
    pub(crate) fn log(&self, tag: &str, message: &str) {
        self.log_sink.log(tag, message);
    }

    pub(crate) fn publish(&self, event: ServiceEvent) {
        // No subscribers is the common case, nothing to report.
        drop(self.events.send(event));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Lifecycle controller: registers consumers, blocks in [`start`](Microservice::start)
/// until SIGINT/SIGTERM or [`stop`](Microservice::stop), then cancels every
/// consumption loop.
///
/// Cheap to clone; all clones control the same service. Dropping the last
/// clone cancels the consumption loops as well.
#[derive(Clone)]
pub struct Microservice {
    shared: Arc<Shared>,
}

#[derive(Default)]
pub struct MicroserviceBuilder {
    config: ServiceConfig,
    log_sink: Option<Arc<dyn LogSink>>,
}

impl MicroserviceBuilder {
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default `tracing` sink used by [`Microservice::log`] and handler contexts.
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn build(self) -> Microservice {
        let (events, _) = broadcast::channel(self.config.event_buffer_size.max(1));

        Microservice {
            shared: Arc::new(Shared {
                config: self.config,
                log_sink: self.log_sink.unwrap_or_else(|| Arc::new(TracingLogSink)),
                events,
                shutdown: CancellationToken::new(),
                consumers: TaskTracker::new(),
                exit_tx: Mutex::new(None),
            }),
        }
    }
}

impl Default for Microservice {
    fn default() -> Self {
        Self::new()
    }
}

impl Microservice {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MicroserviceBuilder {
        MicroserviceBuilder::default()
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    /// Register `handler` for `topic` as member of `group_id` on `brokers`
    /// (comma-separated bootstrap list) and start consuming in the background.
    ///
    /// Returns immediately. Joining the group happens in the background loop,
    /// which first checks that a broker answers within
    /// `KAFKA_CONSUMER_CONNECT_TIMEOUT_MS`. If joining fails the error is logged, a [`ServiceEvent::GroupJoinFailed`] is
    /// published and the registration is abandoned. This call still succeeds.
    pub fn consume<H: Handler>(
        &self,
        brokers: &str,
        topic: &str,
        group_id: &str,
        handler: H,
    ) -> Result<(), ServiceError> {
        let consumer_config = &self.shared.config.consumer;
        let client_config = consumer_config.client_config(brokers, group_id);
        let connect_timeout = consumer_config.connect_timeout();
        let subscription = topic.to_owned();

        self.consume_from(topic, group_id, handler, move || {
            KafkaGroupConsumer::new(&client_config, &subscription, connect_timeout)
        })
    }

    /// Like [`consume`](Microservice::consume), with the broker connection
    /// produced by `connect`. `connect` runs on the blocking thread pool and
    /// may block until the brokers answer.
    pub fn consume_from<H, C, F>(
        &self,
        topic: &str,
        group_id: &str,
        handler: H,
        connect: F,
    ) -> Result<(), ServiceError>
    where
        H: Handler,
        C: GroupConsumer,
        F: FnOnce() -> Result<C, KafkaError> + Send + 'static,
    {
        let registration = Registration {
            topic: topic.to_owned(),
            group_id: group_id.to_owned(),
        };
        debug!(topic, group_id, "registering consumer");

        let adapter = ConsumptionAdapter::new(handler, registration, self.downgrade());
        let shutdown = self.shared.shutdown.clone();
        let retry_backoff = self.shared.config.session_retry_backoff.0;

        self.shared.consumers.spawn(run_consumer_loop(
            adapter,
            connect,
            shutdown,
            retry_backoff,
        ));
        Ok(())
    }

    /// Block until SIGINT, SIGTERM or [`stop`](Microservice::stop), then
    /// cancel the consumption loops and wait up to the configured shutdown
    /// timeout for them to exit.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let mut signals = ShutdownSignals::install()?;
        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        self.set_exit_sender(Some(exit_tx));

        info!("Service started");

        tokio::select! {
            signal = signals.recv() => info!("received {}", signal),
            _ = exit_rx.recv() => info!("stop requested"),
        }

        self.set_exit_sender(None);
        self.shared.shutdown.cancel();
        self.shared.consumers.close();

        let shutdown_timeout = self.shared.config.shutdown_timeout.0;
        if tokio::time::timeout(shutdown_timeout, self.shared.consumers.wait())
            .await
            .is_err()
        {
            warn!(
                "{} consumer loops still running after {:?}",
                self.shared.consumers.len(),
                shutdown_timeout
            );
        }

        info!("Service stopped");
        Ok(())
    }

    /// Ask a running [`start`](Microservice::start) to return. Does nothing if
    /// the service isn't started; repeated calls before `start` reacts are absorbed.
    pub fn stop(&self) {
        let slot = self
            .shared
            .exit_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(exit_tx) = slot.as_ref() else {
            return;
        };

        if let Err(e) = exit_tx.try_send(()) {
            debug!("stop already requested: {}", e);
        }
    }

    /// Whether [`start`](Microservice::start) is currently waiting for a shutdown trigger.
    pub fn is_running(&self) -> bool {
        self.shared
            .exit_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Release resources held by the service. Nothing to release today.
    pub fn cleanup(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Write a tagged diagnostic line through the configured [`LogSink`].
    pub fn log(&self, tag: &str, message: &str) {
        self.shared.log(tag, message);
    }

    /// Subscribe to consumption events published from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.shared.events.subscribe()
    }

    fn set_exit_sender(&self, exit_tx: Option<mpsc::Sender<()>>) {
        *self
            .shared
            .exit_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = exit_tx;
    }
}
