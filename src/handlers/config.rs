use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the running configuration with the API key masked.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config().redacted()?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::hub::Hub;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_api_key_is_not_exposed() {
        let (hub, _task) = Hub::spawn();
        let mut config = AppConfig::default();
        config.gemini.api_key = "secret-key".to_string();
        let state = AppState::new(config, hub, None);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let request = test::TestRequest::get().uri("/config").to_request();
        let body = test::call_and_read_body(&app, request).await;
        let text = std::str::from_utf8(&body).unwrap();
        assert!(!text.contains("secret-key"));

        let json: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(json["config"]["server"]["port"], 8080);
    }
}
