//! # Voice Relay Gateway - Main Application Entry Point
//!
//! Accepts browser WebSocket connections carrying raw PCM audio, relays the
//! audio to Gemini's realtime BidiGenerateContent endpoint, and streams the
//! model's text back to the browser.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection is a handful of cheap tokio tasks
//! - **Arc / Weak**: shared ownership of sessions and clients, non-owning back-references
//! - **traits as seams**: `Transport` and `RemoteClient` let tests swap in doubles
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **hub**: registry of connected clients with broadcast
//! - **websocket**: per-connection read/write/forward tasks
//! - **transport**: actix WebSocket bridged to an async read/write interface
//! - **audio**: ring buffer, PCM processing and the per-connection session
//! - **gemini**: wire types and the upstream WebSocket client
//! - **state / health / middleware / handlers / error**: the HTTP side

mod audio;
mod config;
mod error;
mod gemini;
mod handlers;
mod health;
mod hub;
mod middleware;
mod state;
mod transport;
mod websocket;

#[cfg(test)]
mod testing;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::{AppConfig, RemoteMode};
use gemini::{GeminiClient, RemoteClient};
use hub::Hub;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## Startup order:
/// 1. **Environment and logging**: `.env`, tracing subscriber, TLS crypto provider
/// 2. **Configuration**: load and validate
/// 3. **Hub**: start the coordination task
/// 4. **Shared upstream** (shared mode only): connect once, fail startup if unreachable
/// 5. **HTTP server**: routes and middleware
///
/// ## Shutdown order:
/// HTTP server, then hub (closes every client), then the shared upstream.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    // wss:// needs a process-wide rustls provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider was already installed");
    }

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        model = %config.gemini.model,
        mode = ?config.gateway.remote_mode,
        "Configuration loaded"
    );

    let (hub, hub_task) = Hub::spawn();

    let shared_remote = match config.gateway.remote_mode {
        RemoteMode::Shared => {
            let client = GeminiClient::new(&config.gemini, config.audio.output_sample_rate)?;
            client
                .connect()
                .await
                .context("failed to connect shared upstream client")?;
            info!(model = %client.model(), "Shared upstream client connected");
            Some(Arc::new(client))
        }
        RemoteMode::Dedicated => None,
    };

    let app_state = AppState::new(config.clone(), hub.clone(), shared_remote.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/ws", web::get().to(websocket::handle_websocket))
            .route("/health", web::get().to(health::health_check))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/broadcast", web::post().to(handlers::broadcast_message)),
            )
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = wait_for_shutdown() => {
            if let Err(e) = result {
                error!("Signal handler error: {}", e);
            }
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    hub.stop();
    if let Err(e) = hub_task.await {
        error!("Hub task error: {}", e);
    }

    if let Some(remote) = shared_remote {
        if let Err(e) = remote.close().await {
            warn!("Error closing shared upstream client: {}", e);
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: log filter, defaults to "voice_relay_gateway=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C");
    Ok(())
}
