//! Template event pipeline: producer, consumer groups, and dead-letter
//! handling.
//!
//! Flow: [`TemplateEventProducer`] publishes to `template_events`; the
//! primary consumer group processes each message and routes failures to
//! `template_events_dlq` via [`KafkaDeadLetterRouter`]; the dead-letter
//! consumer group drains that topic with bounded exponential-backoff
//! retries.

use std::time::Duration;

pub mod consumer;
pub mod dlq_consumer;
pub mod dlq_router;
pub mod envelope;
pub mod handler;
pub mod producer;

pub use consumer::{
    ConsumerConfig, EventConsumer, MessageOutcome, MessagePolicy, PrimaryPolicy, RawEvent,
};
pub use dlq_consumer::DeadLetterPolicy;
pub use dlq_router::{DeadLetterRoute, KafkaDeadLetterRouter};
pub use envelope::TemplateEvent;
pub use handler::{LoggingTemplateHandler, TemplateHandler};
pub use producer::TemplateEventProducer;

/// Primary business event topic.
pub const TOPIC_TEMPLATE_EVENTS: &str = "template_events";

/// Dead-letter topic (`<primary>_dlq` naming convention).
pub const TOPIC_TEMPLATE_EVENTS_DLQ: &str = "template_events_dlq";

/// Consumer group for the primary topic.
pub const GROUP_TEMPLATE_EVENT: &str = "template_event";

/// Consumer group for the dead-letter topic. Independent of the primary
/// group so its offset tracking never interferes.
pub const GROUP_TEMPLATE_DLQ: &str = "template_dlq";

/// Header carrying the topic a dead-lettered message was consumed from.
pub const HEADER_ORIGINAL_TOPIC: &str = "original_topic";

/// Header carrying the RFC-3339 timestamp at which the failure was detected.
pub const HEADER_ERROR_TIME: &str = "error_time";

/// Maximum handler attempts on the dead-letter path.
pub const MAX_DLQ_ATTEMPTS: usize = 5;

/// Base unit for the exponential backoff between dead-letter attempts.
pub const DLQ_BASE_WAIT: Duration = Duration::from_secs(5);

/// Per-message deadline for a single business-handler invocation.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);
