//! # Health and Metrics Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness plus upstream readiness
//! - `GET /api/v1/metrics`: request counters per endpoint and connection totals

use crate::config::RemoteMode;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Report service status.
///
/// ## Status values:
/// - **healthy**: ready to accept connections
/// - **degraded**: shared upstream connection is down, `/ws` would fail (503)
///
/// In dedicated mode there is no standing upstream connection to check, so
/// the service is healthy as long as it answers.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let metrics = state.get_metrics_snapshot();

    let upstream_connected = state.shared_remote().map(|remote| remote.is_connected());
    let healthy = upstream_connected.unwrap_or(true);
    let mode = match config.gateway.remote_mode {
        RemoteMode::Shared => "shared",
        RemoteMode::Dedicated => "dedicated",
    };

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "connections": {
            "active": state.hub().count(),
            "accepted": metrics.connections_accepted
        },
        "upstream": {
            "mode": mode,
            "model": config.gemini.model,
            "connected": upstream_connected
        }
    });

    if healthy {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": overall_error_rate(&metrics),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "connections": {
            "active": state.hub().count(),
            "accepted": metrics.connections_accepted
        },
        "endpoints": endpoint_stats
    }))
}

fn overall_error_rate(metrics: &AppMetrics) -> f64 {
    if metrics.request_count > 0 {
        metrics.error_count as f64 / metrics.request_count as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::hub::Hub;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_health_in_dedicated_mode() {
        let (hub, _task) = Hub::spawn();
        let state = AppState::new(AppConfig::default(), hub, None);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let response = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"]["active"], 0);
        assert_eq!(body["upstream"]["mode"], "dedicated");
        assert!(body["upstream"]["connected"].is_null());
    }

    #[actix_web::test]
    async fn test_metrics_lists_endpoints() {
        let (hub, _task) = Hub::spawn();
        let state = AppState::new(AppConfig::default(), hub, None);
        state.increment_request_count();
        state.record_endpoint_request("GET /health", 4, false);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let request = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, request).await;
        assert_eq!(body["overall"]["total_requests"], 1);
        assert_eq!(body["endpoints"][0]["endpoint"], "GET /health");
        assert_eq!(body["endpoints"][0]["request_count"], 1);
    }
}
