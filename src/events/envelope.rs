use serde::{Deserialize, Serialize};

/// Template domain event as it appears on the wire.
///
/// The payload is plain JSON and is carried byte-identical onto the
/// dead-letter topic, so the same schema deserializes messages from both
/// topics. Schema evolution is the producer's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEvent {
    /// Identifier of the template the event concerns.
    pub template_id: i64,
}
