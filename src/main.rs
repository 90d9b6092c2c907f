use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use template_service::config::AppConfig;
use template_service::events::{
    ConsumerConfig, DeadLetterPolicy, EventConsumer, KafkaDeadLetterRouter,
    LoggingTemplateHandler, PrimaryPolicy, TemplateEventProducer, DLQ_BASE_WAIT,
    GROUP_TEMPLATE_DLQ, GROUP_TEMPLATE_EVENT, HANDLER_TIMEOUT, MAX_DLQ_ATTEMPTS,
    TOPIC_TEMPLATE_EVENTS, TOPIC_TEMPLATE_EVENTS_DLQ,
};
use template_service::http::{self, AppState};

/// How long the HTTP server may drain in-flight requests on shutdown. The
/// consumers shut down independently of this deadline.
const HTTP_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,template_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting template-service");

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    info!(
        kafka_brokers = %config.kafka_brokers,
        http_port = config.http_port,
        "Configuration loaded"
    );

    // Process-wide shutdown signal, observed by both consumer loops.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
        info!("Shutdown signal received");
        let _ = signal_tx.send(true);
    });

    let producer = TemplateEventProducer::new(&config.kafka_brokers)
        .context("Failed to create Kafka producer")?;
    let router = KafkaDeadLetterRouter::new(&config.kafka_brokers)
        .context("Failed to create dead-letter router")?;

    let handler = Arc::new(LoggingTemplateHandler);

    // Group-join failures are fatal to startup; `?` aborts the process.
    let mut primary_consumer = EventConsumer::new(
        ConsumerConfig {
            brokers: config.kafka_brokers.clone(),
            group_id: GROUP_TEMPLATE_EVENT.to_string(),
            topic: TOPIC_TEMPLATE_EVENTS.to_string(),
        },
        PrimaryPolicy::new(handler.clone(), router, HANDLER_TIMEOUT),
        shutdown_rx.clone(),
    )
    .context("Failed to start primary consumer")?;

    let mut dlq_consumer = EventConsumer::new(
        ConsumerConfig {
            brokers: config.kafka_brokers.clone(),
            group_id: GROUP_TEMPLATE_DLQ.to_string(),
            topic: TOPIC_TEMPLATE_EVENTS_DLQ.to_string(),
        },
        DeadLetterPolicy::new(handler, MAX_DLQ_ATTEMPTS, DLQ_BASE_WAIT, HANDLER_TIMEOUT),
        shutdown_rx,
    )
    .context("Failed to start dead-letter consumer")?;

    let primary_handle = tokio::spawn(async move {
        if let Err(e) = primary_consumer.run().await {
            error!(error = %e, "primary consumer terminated with error");
        }
    });

    let dlq_handle = tokio::spawn(async move {
        if let Err(e) = dlq_consumer.run().await {
            error!(error = %e, "dead-letter consumer terminated with error");
        }
    });

    info!("Starting HTTP server on 0.0.0.0:{}", config.http_port);

    let state = web::Data::new(AppState { producer });
    HttpServer::new(move || App::new().app_data(state.clone()).configure(http::configure))
        .bind(("0.0.0.0", config.http_port))
        .context("Failed to bind HTTP server")?
        .shutdown_timeout(HTTP_SHUTDOWN_TIMEOUT_SECS)
        .run()
        .await
        .context("HTTP server error")?;

    // The HTTP server has drained; stop the consumer loops and wait for the
    // in-flight messages to resolve.
    let _ = shutdown_tx.send(true);
    let _ = primary_handle.await;
    let _ = dlq_handle.await;

    info!("template-service stopped");
    Ok(())
}
