use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::consumer::{wait_or_shutdown, MessageOutcome, MessagePolicy, RawEvent};
use super::envelope::TemplateEvent;
use super::handler::TemplateHandler;
use crate::error::{AppError, Result};

/// Per-message policy of the dead-letter consumer group.
///
/// Each dead-lettered message gets up to `max_attempts` handler invocations
/// with exponentially growing waits in between. The message is committed
/// after the retry loop regardless of the final outcome: retry exhaustion
/// drops the message from the dead-letter topic with an error-severity log
/// as the only record.
pub struct DeadLetterPolicy<H> {
    handler: Arc<H>,
    max_attempts: usize,
    base_wait: Duration,
    handler_timeout: Duration,
}

impl<H: TemplateHandler> DeadLetterPolicy<H> {
    pub fn new(
        handler: Arc<H>,
        max_attempts: usize,
        base_wait: Duration,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            handler,
            max_attempts,
            base_wait,
            handler_timeout,
        }
    }

    async fn attempt(&self, event: &TemplateEvent) -> Result<()> {
        match timeout(self.handler_timeout, self.handler.handle(event)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::HandlerTimeout(self.handler_timeout)),
        }
    }
}

#[async_trait]
impl<H: TemplateHandler> MessagePolicy for DeadLetterPolicy<H> {
    async fn process(
        &self,
        raw: &RawEvent<'_>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> MessageOutcome {
        // Absent provenance is tolerated; it only degrades the log trail.
        let original_topic = raw.original_topic.as_deref().unwrap_or("");

        let payload = raw.payload.unwrap_or_default();
        let event: TemplateEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    error = %e,
                    original_topic,
                    partition = raw.partition,
                    offset = raw.offset,
                    "failed to deserialize dead-letter message, dropping"
                );
                return MessageOutcome::Commit;
            }
        };

        info!(
            original_topic,
            partition = raw.partition,
            offset = raw.offset,
            template_id = event.template_id,
            "processing dead-letter message"
        );

        let mut result = Ok(());
        for attempt in 0..self.max_attempts {
            result = self.attempt(&event).await;
            if result.is_ok() {
                break;
            }

            // No wait after the final attempt.
            if attempt + 1 < self.max_attempts {
                if let Err(ref e) = result {
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        remaining = self.max_attempts - attempt - 1,
                        template_id = event.template_id,
                        "dead-letter attempt failed, backing off"
                    );
                }

                let delay = backoff_delay(self.base_wait, attempt);
                if wait_or_shutdown(delay, shutdown).await {
                    info!(
                        template_id = event.template_id,
                        "shutdown during backoff wait, leaving dead-letter message uncommitted"
                    );
                    return MessageOutcome::Leave;
                }
            }
        }

        match result {
            Ok(()) => info!(
                original_topic,
                template_id = event.template_id,
                "dead-letter message processed"
            ),
            Err(e) => error!(
                error = %e,
                original_topic,
                partition = raw.partition,
                offset = raw.offset,
                template_id = event.template_id,
                "dead-letter retries exhausted, dropping message"
            ),
        }

        MessageOutcome::Commit
    }
}

/// Exponential backoff: `base * 2^attempt`.
fn backoff_delay(base: Duration, attempt: usize) -> Duration {
    base * (1u32 << attempt.min(31))
}
