//! # Configuration Management
//!
//! Loads the gateway configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP__` prefix (`APP__SERVER__PORT=9000`)
//! - A handful of well-known variables used by deployment platforms and by the
//!   upstream integration (`HOST`, `PORT`, `GEMINI_API_KEY`, ...)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Well-known variables (`GEMINI_MODEL`, `PORT`, ...)
//! 2. `APP__` prefixed environment variables
//! 3. Configuration file (config.toml)
//! 4. Default values

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Upstream Gemini Live endpoint used when nothing else is configured.
pub const DEFAULT_GEMINI_WS_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Instruction sent in the session setup frame unless overridden.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful AI assistant engaging in natural conversation. Process audio input and respond appropriately.";

/// Main application configuration.
///
/// ## Sections:
/// - **server**: where the HTTP/WebSocket listener binds
/// - **gemini**: upstream endpoint, credentials and generation parameters
/// - **audio**: sample rates and buffering for the normalization pipeline
/// - **gateway**: queue sizes and how upstream connections are shared
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub audio: AudioSettings,
    pub gateway: GatewayConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Everything the remote protocol client needs to open and configure a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// API key appended to the endpoint URL as `?key=`
    pub api_key: String,

    /// Full `wss://` URL of the bidirectional streaming endpoint
    pub websocket_url: String,

    /// Model identity sent in the setup frame
    pub model: String,

    /// System instruction sent in the setup frame
    pub system_instruction: String,

    /// How long the WebSocket handshake may take before `connect` gives up
    pub handshake_timeout_secs: u64,

    /// Capacity of the outbound audio queue (full queue = immediate `QueueFull`)
    pub audio_queue_capacity: usize,

    /// Capacity of the inbound response queue
    pub response_queue_capacity: usize,

    pub generation: GenerationConfig,
}

impl GeminiConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Generation parameters forwarded verbatim in the session setup frame.
///
/// Field names match the wire format expected upstream, which is why this type
/// is shared between configuration and protocol serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub candidate_count: u32,
    pub max_output_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    #[serde(rename = "response_modalities")]
    pub response_modality: String,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub sample_rate_hertz: u32,
    pub encoding: String,
}

/// Audio normalization settings.
///
/// ## Fields:
/// - `input_sample_rate`: rate of the PCM clients send (16-bit mono little-endian)
/// - `output_sample_rate`: rate the upstream endpoint receives
/// - `buffer_size`: ring buffer capacity in bytes (streaming mode)
/// - `chunk_size`: bytes of input audio per frame handed to the resampler
/// - `streaming`: `false` = synchronous chunking, `true` = ring buffer + drain task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub buffer_size: usize,
    pub chunk_size: usize,
    pub streaming: bool,
}

/// Connection fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Outbound message slots per connected client
    pub client_queue_capacity: usize,

    /// Response/error queue slots per session
    pub session_queue_capacity: usize,

    pub remote_mode: RemoteMode,
}

/// How upstream connections map onto client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMode {
    /// One upstream connection opened at startup and shared by every session
    Shared,
    /// One upstream connection per client connection, owned by its session
    Dedicated,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            gemini: GeminiConfig {
                api_key: String::new(),
                websocket_url: DEFAULT_GEMINI_WS_URL.to_string(),
                model: "models/gemini-2.0-flash-exp".to_string(),
                system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
                handshake_timeout_secs: 10,
                audio_queue_capacity: 100,
                response_queue_capacity: 100,
                generation: GenerationConfig {
                    candidate_count: 1,
                    max_output_tokens: 1024,
                    temperature: 0.7,
                    top_p: 0.8,
                    top_k: 40,
                    presence_penalty: 0.0,
                    frequency_penalty: 0.0,
                    response_modality: "text,speech".to_string(),
                    speech_config: SpeechConfig {
                        sample_rate_hertz: 24000,
                        encoding: "LINEAR16".to_string(),
                    },
                },
            },
            audio: AudioSettings::default(),
            gateway: GatewayConfig {
                client_queue_capacity: 256,
                session_queue_capacity: 10,
                remote_mode: RemoteMode::Dedicated,
            },
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            buffer_size: 64 * 1024,
            chunk_size: 3200, // 100ms of 16kHz mono PCM
            streaming: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: override the listener port
    /// - `APP__AUDIO__STREAMING=true`: switch to the ring buffer pipeline
    /// - `APP__GATEWAY__REMOTE_MODE=shared`: share one upstream connection
    /// - `GEMINI_API_KEY=...`: upstream credentials
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        // Deployment platforms and the upstream integration use bare names
        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("GEMINI_API_KEY", "gemini.api_key"),
            ("GEMINI_WS_URL", "gemini.websocket_url"),
            ("GEMINI_MODEL", "gemini.model"),
            ("GEMINI_TEMPERATURE", "gemini.generation.temperature"),
            ("GEMINI_INPUT_SAMPLE_RATE", "audio.input_sample_rate"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                if !value.is_empty() {
                    settings = settings.set_override(key, value)?;
                }
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    ///
    /// PCM sizes must be even because every sample is two bytes; the ring buffer
    /// and chunk sizes therefore have to stay sample-aligned.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.gemini.websocket_url.trim().is_empty() {
            anyhow::bail!("Gemini WebSocket URL cannot be empty");
        }
        if self.gemini.handshake_timeout_secs == 0 {
            anyhow::bail!("Handshake timeout must be greater than 0");
        }
        if self.gemini.audio_queue_capacity == 0 || self.gemini.response_queue_capacity == 0 {
            anyhow::bail!("Gemini queue capacities must be greater than 0");
        }

        let audio = &self.audio;
        if audio.input_sample_rate == 0 || audio.output_sample_rate == 0 {
            anyhow::bail!("Sample rates must be greater than 0");
        }
        if audio.buffer_size == 0 || audio.buffer_size % 2 != 0 {
            anyhow::bail!("Audio buffer size must be a positive multiple of 2");
        }
        if audio.chunk_size == 0 || audio.chunk_size % 2 != 0 {
            anyhow::bail!("Audio chunk size must be a positive multiple of 2");
        }
        if audio.streaming && audio.chunk_size > audio.buffer_size {
            anyhow::bail!("Audio chunk size cannot exceed the buffer size in streaming mode");
        }

        if self.gateway.client_queue_capacity == 0 || self.gateway.session_queue_capacity == 0 {
            anyhow::bail!("Gateway queue capacities must be greater than 0");
        }

        Ok(())
    }

    /// Configuration as JSON with credentials masked, for the config endpoint.
    pub fn redacted(&self) -> serde_json::Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(key) = value.pointer_mut("/gemini/api_key") {
            let masked = if self.gemini.api_key.is_empty() { "" } else { "********" };
            *key = serde_json::Value::String(masked.to_string());
        }
        Ok(value)
    }
}
