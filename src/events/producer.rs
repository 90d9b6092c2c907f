use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use super::envelope::TemplateEvent;
use super::TOPIC_TEMPLATE_EVENTS;
use crate::error::{AppError, Result};

/// Kafka producer for template events.
///
/// `publish` is a direct request/acknowledge operation: it blocks until the
/// broker confirms placement and returns the assigned partition and offset.
/// No retry is performed here; callers decide whether to retry a failed
/// publish.
#[derive(Clone)]
pub struct TemplateEventProducer {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl TemplateEventProducer {
    pub fn new(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()?;

        Ok(Self {
            producer,
            topic: TOPIC_TEMPLATE_EVENTS.to_string(),
            timeout: Duration::from_secs(5),
        })
    }

    /// Serialize and publish one event, returning the acknowledged
    /// partition and offset.
    ///
    /// A serialization failure returns before the broker is contacted, so
    /// it has no side effect.
    pub async fn publish(&self, event: &TemplateEvent) -> Result<(i32, i64)> {
        let payload = serde_json::to_vec(event)?;

        // Key by template_id so events for one entity stay on one partition.
        let key = event.template_id.to_string();

        debug!(
            topic = %self.topic,
            template_id = event.template_id,
            "publishing template event"
        );

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                info!(
                    topic = %self.topic,
                    partition,
                    offset,
                    template_id = event.template_id,
                    "template event published"
                );
                Ok((partition, offset))
            }
            Err((e, _)) => {
                error!(
                    error = %e,
                    topic = %self.topic,
                    template_id = event.template_id,
                    "failed to publish template event"
                );
                Err(AppError::Kafka(e))
            }
        }
    }
}
