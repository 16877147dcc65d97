//! Wire types for the Gemini bidirectional streaming protocol.
//!
//! Every outbound frame is an envelope `{"type": <frame type>, "content": ...}`.
//! Byte payloads (audio) travel as standard base64 strings.

use crate::config::GenerationConfig;
use serde::{Deserialize, Serialize};

pub const SETUP_FRAME: &str = "BidiGenerateContentSetup";
pub const REALTIME_INPUT_FRAME: &str = "BidiGenerateContentRealtimeInput";
pub const CLIENT_CONTENT_FRAME: &str = "BidiGenerateContentClientContent";

/// Outbound frame envelope.
#[derive(Debug, Serialize)]
pub struct Frame<T> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub content: T,
}

impl<T: Serialize> Frame<T> {
    pub fn new(kind: &'static str, content: T) -> Self {
        Self { kind, content }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// First frame on every upstream connection.
#[derive(Debug, Serialize)]
pub struct SessionSetup<'a> {
    pub model: &'a str,
    pub generation_config: &'a GenerationConfig,
    pub system_instruction: &'a str,
    pub tools: Vec<serde_json::Value>,
}

/// Payload of realtime-input and client-content frames.
#[derive(Debug, Default, Serialize)]
pub struct ClientMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_content: Option<ClientContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_input: Option<RealtimeInput>,
}

impl ClientMessage {
    pub fn audio(data: Vec<u8>) -> Self {
        Self {
            realtime_input: Some(RealtimeInput {
                media_chunks: vec![data],
            }),
            ..Default::default()
        }
    }

    pub fn turn(turn: Turn) -> Self {
        Self {
            client_content: Some(ClientContent {
                turns: vec![turn],
                turn_complete: true,
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClientContent {
    pub turns: Vec<Turn>,
    pub turn_complete: bool,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    #[serde(with = "base64_list")]
    pub media_chunks: Vec<Vec<u8>>,
}

/// One conversational turn: a role and its ordered parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default)]
    pub role: String,
}

impl Turn {
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part::text(text)],
            role: role.into(),
        }
    }

    /// Concatenation of every text part, in order.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}

/// A text fragment, an audio fragment, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt")]
    pub audio: Option<Vec<u8>>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            audio: None,
        }
    }
}

/// Inbound frame from the remote endpoint.
///
/// Unknown fields (such as `setupComplete`) are ignored, so every JSON object
/// decodes; a frame without a model turn simply has an empty role and no parts.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerResponse {
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub model_turn: Turn,
}

impl ServerResponse {
    pub fn text(&self) -> String {
        self.model_turn.text_content()
    }
}

mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod base64_list {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::ser::SerializeSeq;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(chunks: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(chunks.len()))?;
        for chunk in chunks {
            seq.serialize_element(&STANDARD.encode(chunk))?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_setup_frame_shape() {
        let config = AppConfig::default();
        let setup = SessionSetup {
            model: &config.gemini.model,
            generation_config: &config.gemini.generation,
            system_instruction: &config.gemini.system_instruction,
            tools: Vec::new(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&Frame::new(SETUP_FRAME, setup).to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "BidiGenerateContentSetup");
        assert_eq!(json["content"]["model"], config.gemini.model.as_str());
        assert_eq!(json["content"]["generation_config"]["top_k"], 40);
        assert_eq!(json["content"]["tools"], serde_json::json!([]));
    }

    #[test]
    fn test_realtime_input_encodes_base64() {
        let frame = Frame::new(REALTIME_INPUT_FRAME, ClientMessage::audio(vec![1, 2, 3]));
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "BidiGenerateContentRealtimeInput");
        assert_eq!(json["content"]["realtime_input"]["media_chunks"][0], "AQID");
        assert!(json["content"].get("client_content").is_none());
    }

    #[test]
    fn test_client_content_frame() {
        let frame = Frame::new(CLIENT_CONTENT_FRAME, ClientMessage::turn(Turn::text("user", "hello")));
        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        let content = &json["content"]["client_content"];
        assert_eq!(content["turn_complete"], true);
        assert_eq!(content["turns"][0]["role"], "user");
        assert_eq!(content["turns"][0]["parts"][0]["text"], "hello");
        assert!(content["turns"][0]["parts"][0].get("audio").is_none());
    }

    #[test]
    fn test_server_response_decoding() {
        let raw = r#"{
            "turn_complete": true,
            "model_turn": {
                "role": "model",
                "parts": [{"text": "Hel"}, {"audio": "AQID"}, {"text": "lo"}]
            }
        }"#;
        let response: ServerResponse = serde_json::from_str(raw).unwrap();

        assert!(response.turn_complete);
        assert!(!response.interrupted);
        assert_eq!(response.model_turn.role, "model");
        assert_eq!(response.model_turn.parts[1].audio, Some(vec![1, 2, 3]));
        assert_eq!(response.text(), "Hello");
    }

    #[test]
    fn test_unrelated_frame_decodes_empty() {
        let response: ServerResponse = serde_json::from_str(r#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(response, ServerResponse::default());
        assert!(response.text().is_empty());
    }
}
