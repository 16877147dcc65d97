use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `POST /api/v1/broadcast`: send a JSON message to every connected client.
///
/// The body is forwarded as-is (re-serialized) on each client's socket.
/// Clients whose outbound queue is full are dropped by the hub.
pub async fn broadcast_message(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let message = body.into_inner();
    let is_empty = match &message {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::String(text) => text.is_empty(),
        _ => false,
    };
    if is_empty {
        return Err(AppError::ValidationError("broadcast message must not be empty".to_string()));
    }

    let payload = serde_json::to_vec(&message)?;
    let recipients = state.hub().count();
    state.hub().broadcast(payload).await;
    info!(recipients, "Broadcast submitted");

    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "recipients": recipients,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::hub::{Hub, OUTBOUND_QUEUE_CAPACITY};
    use crate::testing::{test_client, wait_until};
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_broadcast_reaches_registered_client() {
        let (hub, _task) = Hub::spawn();
        let (client, _transport) = test_client(&hub, OUTBOUND_QUEUE_CAPACITY);
        let mut outbound = client.take_outbound().unwrap();
        hub.register(client).await;
        assert!(wait_until(|| hub.count() == 1).await);

        let state = AppState::new(AppConfig::default(), hub, None);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/broadcast", web::post().to(broadcast_message)),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/broadcast")
            .set_json(json!({"type": "notice", "text": "maintenance"}))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(1), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&delivered).unwrap();
        assert_eq!(json["text"], "maintenance");
    }

    #[actix_web::test]
    async fn test_empty_message_is_rejected() {
        let (hub, _task) = Hub::spawn();
        let state = AppState::new(AppConfig::default(), hub, None);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/broadcast", web::post().to(broadcast_message)),
        )
        .await;

        let request = test::TestRequest::post().uri("/broadcast").set_json(json!({})).to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
