use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{debug, error};

use super::consumer::RawEvent;
use super::{HEADER_ERROR_TIME, HEADER_ORIGINAL_TOPIC, TOPIC_TEMPLATE_EVENTS_DLQ};
use crate::error::{AppError, Result};

/// Forwards a failed raw message to the dead-letter topic.
///
/// The payload is republished byte-identical; only the provenance headers
/// (`original_topic`, `error_time`) are added. No retry or backoff happens
/// here; the primary consumer decides how to react to a routing failure.
#[async_trait]
pub trait DeadLetterRoute: Send + Sync + 'static {
    async fn route(&self, raw: &RawEvent<'_>) -> Result<()>;
}

/// Kafka-backed dead-letter router.
#[derive(Clone)]
pub struct KafkaDeadLetterRouter {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaDeadLetterRouter {
    pub fn new(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()?;

        Ok(Self {
            producer,
            topic: TOPIC_TEMPLATE_EVENTS_DLQ.to_string(),
            timeout: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl DeadLetterRoute for KafkaDeadLetterRouter {
    async fn route(&self, raw: &RawEvent<'_>) -> Result<()> {
        let payload = raw.payload.unwrap_or_default();
        let headers = dead_letter_headers(raw.topic);

        debug!(
            topic = %self.topic,
            original_topic = raw.topic,
            partition = raw.partition,
            offset = raw.offset,
            "routing message to dead-letter topic"
        );

        let record = FutureRecord::<(), _>::to(&self.topic)
            .payload(payload)
            .headers(headers);

        match self.producer.send(record, self.timeout).await {
            Ok(_) => Ok(()),
            Err((e, _)) => {
                error!(
                    error = %e,
                    topic = %self.topic,
                    original_topic = raw.topic,
                    "failed to publish to dead-letter topic"
                );
                Err(AppError::Kafka(e))
            }
        }
    }
}

/// Provenance headers attached to every dead-letter message.
fn dead_letter_headers(original_topic: &str) -> OwnedHeaders {
    let error_time = Utc::now().to_rfc3339();
    OwnedHeaders::new()
        .insert(Header {
            key: HEADER_ORIGINAL_TOPIC,
            value: Some(original_topic),
        })
        .insert(Header {
            key: HEADER_ERROR_TIME,
            value: Some(&error_time),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Headers;

    #[test]
    fn test_dead_letter_headers_carry_provenance() {
        let headers = dead_letter_headers("template_events");
        assert_eq!(headers.count(), 2);

        let original = headers.get(0);
        assert_eq!(original.key, HEADER_ORIGINAL_TOPIC);
        assert_eq!(original.value, Some(b"template_events".as_ref()));
    }

    #[test]
    fn test_error_time_is_rfc3339() {
        let headers = dead_letter_headers("template_events");
        let header = headers.get(1);
        assert_eq!(header.key, HEADER_ERROR_TIME);

        let value = std::str::from_utf8(header.value.unwrap()).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(value).is_ok());
    }
}
