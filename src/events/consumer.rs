use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::ClientConfig;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::dlq_router::DeadLetterRoute;
use super::envelope::TemplateEvent;
use super::handler::TemplateHandler;
use super::HEADER_ORIGINAL_TOPIC;
use crate::error::{AppError, Result};

/// Delay before re-polling after a transient consumer error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A claimed message, decoupled from the broker client so policies can be
/// exercised without a live broker.
pub struct RawEvent<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<&'a [u8]>,
    /// Value of the `original_topic` header, when present.
    pub original_topic: Option<String>,
}

impl<'a> RawEvent<'a> {
    pub fn from_message(msg: &'a BorrowedMessage<'a>) -> Self {
        Self {
            topic: msg.topic(),
            partition: msg.partition(),
            offset: msg.offset(),
            payload: msg.payload(),
            original_topic: header_value(msg, HEADER_ORIGINAL_TOPIC).map(str::to_owned),
        }
    }
}

fn header_value<'a, M: Message>(message: &'a M, key: &str) -> Option<&'a str> {
    message
        .headers()
        .and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == key)
                .and_then(|header| header.value)
        })
        .and_then(|value| std::str::from_utf8(value).ok())
}

/// What the consumer loop should do with the offset after a message has
/// been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Mark the message committed, advancing the group's durable offset.
    Commit,
    /// Leave the offset untouched; the message is redelivered after a
    /// rebalance or restart.
    Leave,
}

/// Per-message policy of a consumer role.
///
/// The consume loop is identical for every role; what differs is how a
/// single claimed message is resolved. [`PrimaryPolicy`] routes failures to
/// the dead-letter topic, [`super::DeadLetterPolicy`] retries with backoff.
#[async_trait]
pub trait MessagePolicy: Send + Sync {
    async fn process(
        &self,
        raw: &RawEvent<'_>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> MessageOutcome;
}

/// Consumer-group configuration for one role.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group ID; stable across restarts for offset continuity.
    pub group_id: String,
    /// Topic to consume from
    pub topic: String,
}

/// Generic consumer-group loop, parameterized by the per-message policy.
///
/// Partition claims are delivered by the broker client through one message
/// stream; messages of a partition arrive and are resolved strictly in
/// delivery order. Offsets are committed manually, only when the policy
/// returns [`MessageOutcome::Commit`].
pub struct EventConsumer<P: MessagePolicy> {
    consumer: StreamConsumer,
    policy: P,
    config: ConsumerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl<P: MessagePolicy> EventConsumer<P> {
    /// Join the consumer group and subscribe. A failure here is fatal to
    /// startup and must abort the process.
    pub fn new(
        config: ConsumerConfig,
        policy: P,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .create()?;

        consumer.subscribe(&[&config.topic])?;

        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            group_id = %config.group_id,
            "consumer subscribed"
        );

        Ok(Self {
            consumer,
            policy,
            config,
            shutdown_rx,
        })
    }

    /// Run the consume loop until the shutdown signal fires.
    ///
    /// Transient broker errors (rebalance races, coordinator hiccups) are
    /// logged and retried after a short delay; they never terminate the
    /// loop. The shutdown signal is observed between messages, so the
    /// in-flight message finishes before the session is released.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            "starting consumer loop"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut policy_rx = self.shutdown_rx.clone();
        let mut stream = self.consumer.stream();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(group_id = %self.config.group_id, "shutdown signal received, stopping consumer");
                        break;
                    }
                }

                message = stream.next() => match message {
                    Some(Ok(msg)) => {
                        let raw = RawEvent::from_message(&msg);
                        debug!(
                            topic = raw.topic,
                            partition = raw.partition,
                            offset = raw.offset,
                            "claimed message"
                        );

                        match self.policy.process(&raw, &mut policy_rx).await {
                            MessageOutcome::Commit => {
                                if let Err(e) = self.consumer.commit_message(&msg, CommitMode::Async) {
                                    warn!(
                                        error = %e,
                                        topic = raw.topic,
                                        partition = raw.partition,
                                        offset = raw.offset,
                                        "failed to commit offset"
                                    );
                                }
                            }
                            MessageOutcome::Leave => {}
                        }
                    }
                    Some(Err(e)) => {
                        // Broker-reported asynchronous errors land here as
                        // well; log and keep the loop alive.
                        error!(error = %e, group_id = %self.config.group_id, "kafka consumer error");
                        if wait_or_shutdown(RECONNECT_DELAY, &mut policy_rx).await {
                            info!(group_id = %self.config.group_id, "shutdown signal received, stopping consumer");
                            break;
                        }
                    }
                    None => {
                        warn!(group_id = %self.config.group_id, "message stream ended unexpectedly");
                        break;
                    }
                }
            }
        }

        info!(group_id = %self.config.group_id, "consumer loop stopped");
        Ok(())
    }
}

/// Wait for `delay`, racing the shutdown signal. Returns `true` if shutdown
/// fired before the wait elapsed. Used for every in-loop delay (reconnect
/// pauses, retry backoff) so cancellation is never held up by a sleep.
pub(crate) async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return true,
                Ok(()) => continue,
                // Sender dropped: the process is going away.
                Err(_) => return true,
            }
        }
    }
}

/// Per-message policy of the primary consumer group.
///
/// Success commits the offset. Any processing failure (missing payload,
/// deserialization error, handler error, handler timeout) routes the raw
/// message to the dead-letter topic; the offset is left untouched either
/// way, so a message that could not be routed is redelivered on restart.
/// There is no in-line retry on this path.
pub struct PrimaryPolicy<H, R> {
    handler: Arc<H>,
    router: R,
    handler_timeout: Duration,
}

impl<H, R> PrimaryPolicy<H, R>
where
    H: TemplateHandler,
    R: DeadLetterRoute,
{
    pub fn new(handler: Arc<H>, router: R, handler_timeout: Duration) -> Self {
        Self {
            handler,
            router,
            handler_timeout,
        }
    }

    async fn try_handle(&self, raw: &RawEvent<'_>) -> Result<()> {
        let payload = raw
            .payload
            .ok_or_else(|| AppError::InvalidMessage("message has no payload".to_string()))?;

        let event: TemplateEvent = serde_json::from_slice(payload)?;

        match timeout(self.handler_timeout, self.handler.handle(&event)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::HandlerTimeout(self.handler_timeout)),
        }
    }
}

#[async_trait]
impl<H, R> MessagePolicy for PrimaryPolicy<H, R>
where
    H: TemplateHandler,
    R: DeadLetterRoute,
{
    async fn process(
        &self,
        raw: &RawEvent<'_>,
        _shutdown: &mut watch::Receiver<bool>,
    ) -> MessageOutcome {
        match self.try_handle(raw).await {
            Ok(()) => MessageOutcome::Commit,
            Err(e) => {
                error!(
                    error = %e,
                    topic = raw.topic,
                    partition = raw.partition,
                    offset = raw.offset,
                    "failed to process message, routing to dead-letter topic"
                );

                if let Err(route_err) = self.router.route(raw).await {
                    error!(
                        error = %route_err,
                        topic = raw.topic,
                        partition = raw.partition,
                        offset = raw.offset,
                        "failed to route message to dead-letter topic"
                    );
                }

                MessageOutcome::Leave
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingHandler {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TemplateHandler for CountingHandler {
        async fn handle(&self, _event: &TemplateEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AppError::Handler("simulated failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl TemplateHandler for SlowHandler {
        async fn handle(&self, _event: &TemplateEvent) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRouter {
        routed: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    impl RecordingRouter {
        fn routed(&self) -> Vec<(String, Vec<u8>)> {
            self.routed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeadLetterRoute for Arc<RecordingRouter> {
        async fn route(&self, raw: &RawEvent<'_>) -> Result<()> {
            self.routed.lock().unwrap().push((
                raw.topic.to_string(),
                raw.payload.unwrap_or_default().to_vec(),
            ));
            if self.fail {
                Err(AppError::Internal("router down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn raw_event(payload: &[u8]) -> RawEvent<'_> {
        RawEvent {
            topic: "template_events",
            partition: 0,
            offset: 7,
            payload: Some(payload),
            original_topic: None,
        }
    }

    fn shutdown_rx() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_success_commits_without_routing() {
        let handler = CountingHandler::new(false);
        let router = Arc::new(RecordingRouter::default());
        let policy = PrimaryPolicy::new(handler.clone(), router.clone(), Duration::from_secs(1));
        let (_tx, mut rx) = shutdown_rx();

        let outcome = policy
            .process(&raw_event(br#"{"template_id":42}"#), &mut rx)
            .await;

        assert_eq!(outcome, MessageOutcome::Commit);
        assert_eq!(handler.calls(), 1);
        assert!(router.routed().is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_routes_original_payload_once() {
        let handler = CountingHandler::new(true);
        let router = Arc::new(RecordingRouter::default());
        let policy = PrimaryPolicy::new(handler.clone(), router.clone(), Duration::from_secs(1));
        let (_tx, mut rx) = shutdown_rx();

        let payload = br#"{"template_id":42}"#;
        let outcome = policy.process(&raw_event(payload), &mut rx).await;

        assert_eq!(outcome, MessageOutcome::Leave);
        let routed = router.routed();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0, "template_events");
        assert_eq!(routed[0].1, payload.to_vec());
    }

    #[tokio::test]
    async fn test_deserialization_failure_routes_to_dlq() {
        let handler = CountingHandler::new(false);
        let router = Arc::new(RecordingRouter::default());
        let policy = PrimaryPolicy::new(handler.clone(), router.clone(), Duration::from_secs(1));
        let (_tx, mut rx) = shutdown_rx();

        let outcome = policy.process(&raw_event(b"not json"), &mut rx).await;

        assert_eq!(outcome, MessageOutcome::Leave);
        assert_eq!(handler.calls(), 0);
        assert_eq!(router.routed().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_payload_routes_to_dlq() {
        let handler = CountingHandler::new(false);
        let router = Arc::new(RecordingRouter::default());
        let policy = PrimaryPolicy::new(handler.clone(), router.clone(), Duration::from_secs(1));
        let (_tx, mut rx) = shutdown_rx();

        let raw = RawEvent {
            topic: "template_events",
            partition: 0,
            offset: 7,
            payload: None,
            original_topic: None,
        };
        let outcome = policy.process(&raw, &mut rx).await;

        assert_eq!(outcome, MessageOutcome::Leave);
        assert_eq!(handler.calls(), 0);
        assert_eq!(router.routed().len(), 1);
    }

    #[tokio::test]
    async fn test_routing_failure_leaves_message_uncommitted() {
        let handler = CountingHandler::new(true);
        let router = Arc::new(RecordingRouter {
            fail: true,
            ..Default::default()
        });
        let policy = PrimaryPolicy::new(handler, router.clone(), Duration::from_secs(1));
        let (_tx, mut rx) = shutdown_rx();

        let outcome = policy
            .process(&raw_event(br#"{"template_id":1}"#), &mut rx)
            .await;

        assert_eq!(outcome, MessageOutcome::Leave);
        assert_eq!(router.routed().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_or_shutdown_elapses_when_no_signal() {
        let (_tx, mut rx) = shutdown_rx();
        assert!(!wait_or_shutdown(Duration::from_millis(5), &mut rx).await);
    }

    #[tokio::test]
    async fn test_wait_or_shutdown_preempted_by_signal() {
        let (tx, mut rx) = shutdown_rx();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let started = std::time::Instant::now();
        assert!(wait_or_shutdown(Duration::from_secs(30), &mut rx).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_or_shutdown_returns_immediately_when_already_signalled() {
        let (tx, mut rx) = shutdown_rx();
        tx.send(true).unwrap();
        assert!(wait_or_shutdown(Duration::from_secs(30), &mut rx).await);
    }

    #[tokio::test]
    async fn test_handler_timeout_is_a_processing_failure() {
        let router = Arc::new(RecordingRouter::default());
        let policy = PrimaryPolicy::new(
            Arc::new(SlowHandler),
            router.clone(),
            Duration::from_millis(20),
        );
        let (_tx, mut rx) = shutdown_rx();

        let outcome = policy
            .process(&raw_event(br#"{"template_id":1}"#), &mut rx)
            .await;

        assert_eq!(outcome, MessageOutcome::Leave);
        assert_eq!(router.routed().len(), 1);
    }
}
