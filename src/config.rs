use crate::error::{AppError, Result};

/// Process configuration loaded from the environment at startup.
///
/// Only the broker bootstrap addresses and the HTTP port are configurable;
/// pipeline tuning (retry count, backoff, handler timeout) is compiled in
/// (see [`crate::events`]).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Kafka broker addresses (comma-separated)
    pub kafka_brokers: String,
    /// HTTP listen port
    pub http_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let kafka_brokers =
            std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
        if kafka_brokers.trim().is_empty() {
            return Err(AppError::Config("KAFKA_BROKERS is empty".to_string()));
        }

        let http_port = match std::env::var("PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| AppError::Config(format!("invalid PORT value: {v}")))?,
            Err(_) => 8080,
        };

        Ok(Self {
            kafka_brokers,
            http_port,
        })
    }
}
