use actix_web::{web, HttpResponse};
use serde::Serialize;

use crate::error::Result;
use crate::events::{TemplateEvent, TemplateEventProducer};

/// Shared state for the HTTP surface.
pub struct AppState {
    pub producer: TemplateEventProducer,
}

#[derive(Serialize)]
struct PublishResponse {
    partition: i32,
    offset: i64,
}

/// Synchronous publish: the caller gets the broker acknowledgement (or the
/// error) directly.
async fn publish_event(
    state: web::Data<AppState>,
    event: web::Json<TemplateEvent>,
) -> Result<HttpResponse> {
    let (partition, offset) = state.producer.publish(&event).await?;
    Ok(HttpResponse::Accepted().json(PublishResponse { partition, offset }))
}

async fn health() -> &'static str {
    "OK"
}

async fn ready() -> &'static str {
    "READY"
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready))
        .route("/templates/events", web::post().to(publish_event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_endpoints() {
        let app = test::init_service(App::new().configure(|cfg| {
            cfg.route("/health", web::get().to(health))
                .route("/ready", web::get().to(ready));
        }))
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(resp.status().is_success());

        let resp = test::call_service(&app, test::TestRequest::get().uri("/ready").to_request()).await;
        assert!(resp.status().is_success());
    }
}
