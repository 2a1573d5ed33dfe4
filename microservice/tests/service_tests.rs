use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common_kafka::config::ConsumerConfig;
use common_kafka::test::InMemoryGroupConsumer;
use microservice::config::{EnvMsDuration, ServiceConfig};
use microservice::{ConsumerContext, Context, Handler, LogSink, Microservice, ServiceEvent};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    fn lines(&self) -> Vec<(String, String)> {
        self.lines.lock().unwrap().clone()
    }

    fn contains(&self, tag: &str, fragment: &str) -> bool {
        self.lines()
            .iter()
            .any(|(t, message)| t == tag && message.contains(fragment))
    }
}

impl LogSink for RecordingSink {
    fn log(&self, tag: &str, message: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((tag.to_string(), message.to_string()));
    }
}

fn test_config() -> ServiceConfig {
    ServiceConfig {
        shutdown_timeout: EnvMsDuration(Duration::from_secs(5)),
        session_retry_backoff: EnvMsDuration(Duration::ZERO),
        ..ServiceConfig::default()
    }
}

fn test_service() -> (Microservice, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let service = Microservice::builder()
        .with_config(test_config())
        .with_log_sink(sink.clone())
        .build();
    (service, sink)
}

/// Register `handler` on `topic` against an in-memory broker and return the broker.
fn consume_in_memory(
    service: &Microservice,
    topic: &str,
    handler: impl Handler,
) -> Arc<InMemoryGroupConsumer> {
    let broker = Arc::new(InMemoryGroupConsumer::new());
    let connection = broker.clone();
    service
        .consume_from(topic, "example-group", handler, move || {
            Ok::<_, KafkaError>(connection)
        })
        .expect("registration failed");
    broker
}

/// Handler recording every payload it sees, failing on the ones `fails` selects.
fn recording_handler(
    seen: Arc<Mutex<Vec<String>>>,
    fails: fn(&str) -> bool,
) -> impl Handler {
    move |ctx: ConsumerContext| {
        let seen = seen.clone();
        async move {
            let input = ctx.read_input().into_owned();
            seen.lock().unwrap().push(input.clone());
            if fails(&input) {
                anyhow::bail!("cannot process {}", input);
            }
            anyhow::Ok(())
        }
    }
}

fn never(_: &str) -> bool {
    false
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<ServiceEvent>,
    matches: impl Fn(&ServiceEvent) -> bool,
) -> ServiceEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not published in time")
}

fn drain(events: &mut broadcast::Receiver<ServiceEvent>) -> Vec<ServiceEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn login_records_reach_handler_in_order() {
    let (service, _) = test_service();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let broker = consume_in_memory(&service, "login", recording_handler(seen.clone(), never));

    for payload in ["a", "b", "c"] {
        broker.publish("login", 0, payload);
    }

    wait_until(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn handler_reads_payload_exactly_as_published() {
    let (service, _) = test_service();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let broker = consume_in_memory(&service, "login", recording_handler(seen.clone(), never));

    let payloads = [
        "plain",
        "",
        "  padded  ",
        "ünïcödé ✓ 日本語",
        "{\"user\":\"42\",\"tags\":[1,2]}",
        "line one\nline two\r\n",
    ];
    for payload in payloads {
        broker.publish("login", 0, payload);
    }

    wait_until(|| seen.lock().unwrap().len() == payloads.len()).await;
    assert_eq!(*seen.lock().unwrap(), payloads);
}

#[tokio::test]
async fn handler_sees_record_coordinates() {
    let (service, _) = test_service();
    let coordinates = Arc::new(Mutex::new(Vec::new()));
    let recorded = coordinates.clone();
    let broker = consume_in_memory(&service, "login", move |ctx: ConsumerContext| {
        let recorded = recorded.clone();
        async move {
            recorded.lock().unwrap().push((
                ctx.topic().to_string(),
                ctx.partition(),
                ctx.offset(),
                ctx.payload().to_vec(),
            ));
            anyhow::Ok(())
        }
    });

    broker.publish("login", 2, vec![0xff, 0x00, 0x7f]);

    wait_until(|| coordinates.lock().unwrap().len() == 1).await;
    assert_eq!(
        coordinates.lock().unwrap()[0],
        ("login".to_string(), 2, 0, vec![0xff, 0x00, 0x7f])
    );
}

#[tokio::test]
async fn partitions_keep_their_own_order() {
    let (service, _) = test_service();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let broker = consume_in_memory(&service, "login", recording_handler(seen.clone(), never));

    for i in 0..5 {
        broker.publish("login", 0, format!("p0-{i}"));
        broker.publish("login", 1, format!("p1-{i}"));
    }

    wait_until(|| seen.lock().unwrap().len() == 10).await;
    let seen = seen.lock().unwrap().clone();
    for partition in ["p0-", "p1-"] {
        let ordered: Vec<_> = seen.iter().filter(|p| p.starts_with(partition)).collect();
        let expected: Vec<_> = (0..5).map(|i| format!("{partition}{i}")).collect();
        assert_eq!(ordered, expected.iter().collect::<Vec<_>>());
    }
}

// ---------------------------------------------------------------------------
// Handler failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handler_error_is_logged_and_next_record_is_processed() {
    let (service, sink) = test_service();
    let mut events = service.subscribe_events();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let broker = consume_in_memory(
        &service,
        "login",
        recording_handler(seen.clone(), |input| input == "x"),
    );

    broker.publish("login", 0, "x");
    broker.publish("login", 0, "y");

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    wait_until(|| broker.marked().len() == 2).await;

    assert_eq!(*seen.lock().unwrap(), vec!["x", "y"]);
    assert!(sink.contains("Consumer", "Handler error: cannot process x"));
    assert!(!sink.contains("Consumer", "Handler error: cannot process y"));

    let failure = wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::HandlerFailed { .. })
    })
    .await;
    assert_eq!(
        failure,
        ServiceEvent::HandlerFailed {
            topic: "login".to_string(),
            partition: 0,
            offset: 0,
            error: "cannot process x".to_string(),
        }
    );

    // Still the first and only session.
    let remaining = drain(&mut events);
    assert!(!remaining
        .iter()
        .any(|e| matches!(e, ServiceEvent::SessionError { .. })));
    assert!(!remaining.iter().any(|e| matches!(
        e,
        ServiceEvent::SessionStarted { generation, .. } if *generation > 1
    )));
}

#[tokio::test]
async fn failing_handler_does_not_stop_other_partitions() {
    let (service, _) = test_service();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let broker = consume_in_memory(
        &service,
        "login",
        recording_handler(seen.clone(), |input| input.starts_with("bad")),
    );

    broker.publish("login", 0, "bad-0");
    broker.publish("login", 1, "good-1");
    broker.publish("login", 0, "good-0");
    broker.publish("login", 1, "bad-1");
    broker.publish("login", 1, "good-2");

    wait_until(|| seen.lock().unwrap().len() == 5).await;
    let seen: HashSet<_> = seen.lock().unwrap().iter().cloned().collect();
    for payload in ["good-0", "good-1", "good-2"] {
        assert!(seen.contains(payload), "{payload} was not delivered");
    }
}

#[tokio::test]
async fn every_record_is_marked_once_even_when_handler_always_fails() {
    let (service, _) = test_service();
    let broker = consume_in_memory(&service, "login", |_ctx: ConsumerContext| async move {
        Err::<(), _>(anyhow::anyhow!("always fails"))
    });

    let mut published = HashSet::new();
    for i in 0..12 {
        let partition = i % 3;
        let offset = broker.publish("login", partition, format!("record-{i}"));
        published.insert((partition, offset));
    }

    wait_until(|| broker.marked().len() == published.len()).await;
    // Give a duplicate mark the chance to show up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let marked = broker.marked();
    assert_eq!(marked.len(), published.len());
    let marked: HashSet<_> = marked.iter().map(|r| (r.partition, r.offset)).collect();
    assert_eq!(marked, published);
}

#[tokio::test]
async fn panicking_handler_is_isolated_from_the_loop() {
    let (service, sink) = test_service();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let broker = consume_in_memory(&service, "login", move |ctx: ConsumerContext| {
        let recorded = recorded.clone();
        async move {
            let input = ctx.read_input().into_owned();
            if input == "boom" {
                panic!("handler exploded");
            }
            recorded.lock().unwrap().push(input);
            anyhow::Ok(())
        }
    });

    broker.publish("login", 0, "boom");
    broker.publish("login", 0, "after");

    wait_until(|| seen.lock().unwrap().len() == 1).await;
    wait_until(|| broker.marked().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec!["after"]);
    assert!(sink.contains("Consumer", "handler panicked: handler exploded"));
}

// ---------------------------------------------------------------------------
// Broker failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn session_error_is_logged_and_session_restarted() {
    let (service, sink) = test_service();
    let mut events = service.subscribe_events();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let broker = consume_in_memory(&service, "login", recording_handler(seen.clone(), never));

    broker.publish("login", 0, "a");
    broker.fail_session(KafkaError::MessageConsumption(
        RDKafkaErrorCode::BrokerTransportFailure,
    ));
    broker.publish("login", 0, "b");

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);

    let error = wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::SessionError { .. })
    })
    .await;
    assert!(matches!(
        error,
        ServiceEvent::SessionError { generation: 1, .. }
    ));
    wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::SessionStarted { generation: 2, .. })
    })
    .await;
    assert!(sink.contains("Consumer", "Error during consume:"));
}

#[tokio::test]
async fn group_join_failure_is_logged_not_returned() {
    let (service, sink) = test_service();
    let mut events = service.subscribe_events();

    let result = service.consume_from(
        "login",
        "example-group",
        recording_handler(Arc::new(Mutex::new(Vec::new())), never),
        || Err::<Arc<InMemoryGroupConsumer>, _>(KafkaError::ClientCreation("no brokers".to_string())),
    );
    assert!(result.is_ok());

    let failure = wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::GroupJoinFailed { .. })
    })
    .await;
    assert!(matches!(
        failure,
        ServiceEvent::GroupJoinFailed { ref topic, ref group_id, .. }
            if topic == "login" && group_id == "example-group"
    ));
    assert!(sink.contains("Consumer", "Error creating consumer group:"));
}

#[tokio::test]
async fn invalid_kafka_config_is_reported_as_join_failure() {
    let sink = Arc::new(RecordingSink::default());
    let config = ServiceConfig {
        consumer: ConsumerConfig {
            kafka_consumer_offset_reset: "sometime".to_string(),
            ..ConsumerConfig::default()
        },
        ..test_config()
    };
    let service = Microservice::builder()
        .with_config(config)
        .with_log_sink(sink.clone())
        .build();
    let mut events = service.subscribe_events();

    let result = service.consume(
        "localhost:9092",
        "login",
        "example-group",
        recording_handler(Arc::new(Mutex::new(Vec::new())), never),
    );
    assert!(result.is_ok());

    wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::GroupJoinFailed { .. })
    })
    .await;
    assert!(sink.contains("Consumer", "Error creating consumer group:"));
}

#[tokio::test]
async fn unreachable_broker_is_reported_once_and_never_retried() {
    let sink = Arc::new(RecordingSink::default());
    let config = ServiceConfig {
        consumer: ConsumerConfig {
            kafka_consumer_connect_timeout_ms: 500,
            ..ConsumerConfig::default()
        },
        ..test_config()
    };
    let service = Microservice::builder()
        .with_config(config)
        .with_log_sink(sink.clone())
        .build();
    let mut events = service.subscribe_events();

    let result = service.consume(
        "127.0.0.1:1",
        "login",
        "example-group",
        recording_handler(Arc::new(Mutex::new(Vec::new())), never),
    );
    assert!(result.is_ok());

    let mut published = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            let joined = matches!(event, ServiceEvent::GroupJoinFailed { .. });
            published.push(event);
            if joined {
                break;
            }
        }
    })
    .await
    .expect("join failure not published in time");

    // The loop has exited, nothing follows the join failure.
    tokio::time::sleep(Duration::from_millis(300)).await;
    published.extend(drain(&mut events));

    assert_eq!(
        published
            .iter()
            .filter(|e| matches!(e, ServiceEvent::GroupJoinFailed { .. }))
            .count(),
        1
    );
    assert!(!published.iter().any(|e| matches!(
        e,
        ServiceEvent::SessionStarted { .. } | ServiceEvent::SessionError { .. }
    )));
    assert_eq!(
        sink.lines()
            .iter()
            .filter(|(_, message)| message.starts_with("Error creating consumer group:"))
            .count(),
        1
    );
    assert!(!sink.contains("Consumer", "Error during consume:"));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_before_start_neither_blocks_nor_panics() {
    let (service, _) = test_service();

    tokio::time::timeout(Duration::from_secs(1), async {
        service.stop();
        service.stop();
    })
    .await
    .expect("stop blocked");

    assert!(!service.is_running());
}

#[tokio::test]
async fn stop_after_start_returns_once_and_cancels_consumers() {
    let (service, _) = test_service();
    let mut events = service.subscribe_events();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let broker = consume_in_memory(&service, "login", recording_handler(seen.clone(), never));
    broker.publish("login", 0, "a");
    wait_until(|| broker.marked().len() == 1).await;

    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.start().await })
    };
    wait_until(|| service.is_running()).await;

    service.stop();
    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("start did not return after stop")
        .expect("start task failed");
    assert!(result.is_ok());
    assert!(!service.is_running());

    let stopped = drain(&mut events);
    assert_eq!(
        stopped
            .iter()
            .filter(|e| matches!(e, ServiceEvent::ConsumerStopped { .. }))
            .count(),
        1
    );

    // Nothing is consumed after shutdown.
    broker.publish("login", 0, "late");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec!["a"]);
}

#[tokio::test]
async fn log_writes_tagged_line() {
    let (service, sink) = test_service();

    service.log("Consumer", "hello");

    assert_eq!(
        sink.lines(),
        vec![("Consumer".to_string(), "hello".to_string())]
    );
}
