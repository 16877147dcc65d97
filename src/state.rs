//! # Application State Management
//!
//! State shared by every actix-web worker: configuration, the connection hub,
//! the shared upstream client (when configured) and request metrics.
//!
//! ## Rust Concepts:
//! - **Clone on AppState**: cheap, every field is an `Arc` or a handle
//! - **web::Data<AppState>**: actix-web wraps it once more in an `Arc` per app
//! - **parking_lot::RwLock**: many readers or one writer, no lock poisoning

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::gemini::{GeminiClient, RemoteClient};
use crate::hub::Hub;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    config: Arc<RwLock<AppConfig>>,
    metrics: Arc<RwLock<AppMetrics>>,
    hub: Hub,
    /// Present only in `shared` remote mode
    shared_remote: Option<Arc<GeminiClient>>,
    start_time: Instant,
}

/// Request and connection counters.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub connections_accepted: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint counters, keyed by matched route pattern.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, hub: Hub, shared_remote: Option<Arc<GeminiClient>>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            hub,
            shared_remote,
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn shared_remote(&self) -> Option<&Arc<GeminiClient>> {
        self.shared_remote.as_ref()
    }

    /// Upstream client for a new connection, plus whether the caller owns it.
    ///
    /// ## Remote Modes:
    /// - **shared**: the startup client, not owned (sessions must not close it)
    /// - **dedicated**: a new client connected now, owned by the new session
    pub async fn remote_for_connection(&self) -> AppResult<(Arc<dyn RemoteClient>, bool)> {
        if let Some(shared) = &self.shared_remote {
            if !shared.is_connected() {
                return Err(AppError::Upstream("shared upstream connection is down".to_string()));
            }
            let remote: Arc<dyn RemoteClient> = shared.clone();
            return Ok((remote, false));
        }

        let config = self.get_config();
        let client = Arc::new(GeminiClient::new(&config.gemini, config.audio.output_sample_rate)?);
        client.connect().await?;
        let remote: Arc<dyn RemoteClient> = client;
        Ok((remote, true))
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn record_connection(&self) {
        self.metrics.write().connections_accepted += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        metric.request_count += 1;
        metric.total_duration_ms += duration_ms;
        if is_error {
            metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_metrics_accumulate() {
        let (hub, _task) = Hub::spawn();
        let state = AppState::new(AppConfig::default(), hub, None);

        state.record_endpoint_request("/health", 10, false);
        state.record_endpoint_request("/health", 30, true);
        state.increment_request_count();

        let snapshot = state.get_metrics_snapshot();
        let health = &snapshot.endpoint_metrics["/health"];
        assert_eq!(snapshot.request_count, 1);
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_dedicated_mode_requires_api_key() {
        let (hub, _task) = Hub::spawn();
        let state = AppState::new(AppConfig::default(), hub, None);

        let result = state.remote_for_connection().await;
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
