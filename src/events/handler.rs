use async_trait::async_trait;
use tracing::info;

use super::envelope::TemplateEvent;
use crate::error::Result;

/// Business handler invoked by both consumer groups.
///
/// The pipeline delivers at-least-once: a handler may see the same event
/// again after a rebalance or a restart and must be idempotent under
/// redelivery. Each invocation runs under the per-message deadline
/// ([`super::HANDLER_TIMEOUT`]); a call that outlives it is abandoned and
/// counted as a failure.
#[async_trait]
pub trait TemplateHandler: Send + Sync + 'static {
    async fn handle(&self, event: &TemplateEvent) -> Result<()>;
}

/// Handler that only records the event. Deployments replace this with a
/// repository-backed implementation wired in `main`.
pub struct LoggingTemplateHandler;

#[async_trait]
impl TemplateHandler for LoggingTemplateHandler {
    async fn handle(&self, event: &TemplateEvent) -> Result<()> {
        info!(template_id = event.template_id, "template event handled");
        Ok(())
    }
}
