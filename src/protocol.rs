//! JSON envelopes exchanged with the live voice service.
//!
//! Outbound messages use snake_case keys, inbound server messages use
//! camelCase, mirroring what the service actually speaks.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::audio::pcm::{PCM_MIME_TYPE, PcmBuffer};
use crate::error::{LiveError, LiveResult};

// ======================== Outbound ========================

/// Client → server envelope. Serializes externally tagged:
/// `{"setup": {...}}` or `{"realtime_input": {...}}`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Setup(SetupParams),
    RealtimeInput(RealtimeInput),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SetupParams {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    /// Passed through untouched.
    pub speech_config: Value,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TextPart {
    pub text: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl SetupParams {
    pub fn new(model: &str, voice_name: &str, system_instruction: &str) -> Self {
        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: json!({
                    "voice_config": { "prebuilt_voice_config": { "voice_name": voice_name } }
                }),
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: system_instruction.to_string(),
                }],
            },
        }
    }
}

impl MediaChunk {
    /// Wrap already base64-encoded PCM16 bytes.
    pub fn pcm(data: String) -> Self {
        Self {
            mime_type: PCM_MIME_TYPE.to_string(),
            data,
        }
    }
}

impl ClientMessage {
    pub fn audio_chunk(chunk: MediaChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        })
    }

    pub fn to_json(&self) -> LiveResult<String> {
        serde_json::to_string(self).map_err(|e| LiveError::ProtocolViolation(e.to_string()))
    }
}

// ======================== Inbound ========================

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    server_content: Option<ServerContent>,
    setup_complete: Option<Value>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Deserialize, Debug, Default)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

/// One meaningful thing the server said, in frame order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SetupComplete,
    Audio(PcmBuffer),
    Text(String),
    Interrupted,
    TurnComplete,
}

/// Parse one inbound frame.
///
/// Errors are per-frame: a bad JSON shape is a `ProtocolViolation`, a bad
/// audio payload is `MalformedPayload`. Nothing is returned for a frame that
/// fails, so a half-valid frame never reaches the scheduler.
pub fn parse_server_message(text: &str) -> LiveResult<Vec<ServerEvent>> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(LiveError::ProtocolViolation(format!(
            "expected a JSON object, got {}",
            value
        )));
    }
    let msg: ServerMessage = serde_json::from_value(value)?;

    let mut events = Vec::new();
    if msg.setup_complete.is_some() {
        events.push(ServerEvent::SetupComplete);
    }
    if let Some(content) = msg.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    if inline.mime_type == PCM_MIME_TYPE {
                        events.push(ServerEvent::Audio(PcmBuffer::from_base64(&inline.data)?));
                    } else {
                        log::debug!("Ignoring inline data of type {}", inline.mime_type);
                    }
                }
                if let Some(text) = part.text {
                    events.push(ServerEvent::Text(text));
                }
            }
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm;

    #[test]
    fn setup_envelope_shape() {
        let msg = ClientMessage::Setup(SetupParams::new("models/m", "Aoede", "be brief"));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["setup"]["model"], "models/m");
        assert_eq!(
            value["setup"]["generation_config"]["response_modalities"],
            json!(["AUDIO"])
        );
        assert_eq!(
            value["setup"]["generation_config"]["speech_config"]["voice_config"]
                ["prebuilt_voice_config"]["voice_name"],
            "Aoede"
        );
        assert_eq!(
            value["setup"]["system_instruction"]["parts"][0]["text"],
            "be brief"
        );
    }

    #[test]
    fn realtime_input_envelope_shape() {
        let msg = ClientMessage::audio_chunk(MediaChunk::pcm("AAA=".to_string()));
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"realtime_input": {"media_chunks": [
                {"mime_type": "audio/pcm;rate=16000", "data": "AAA="}
            ]}})
        );
    }

    #[test]
    fn parses_inbound_audio_parts_in_order() {
        let a = PcmBuffer::new(vec![1, 2, 3]);
        let b = PcmBuffer::new(vec![-4]);
        let text = json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": PCM_MIME_TYPE, "data": a.to_base64()}},
            {"inlineData": {"mimeType": "audio/ogg", "data": "AAAA"}},
            {"inlineData": {"mimeType": PCM_MIME_TYPE, "data": b.to_base64()}}
        ]}}})
        .to_string();
        let events = parse_server_message(&text).unwrap();
        assert_eq!(events, vec![ServerEvent::Audio(a), ServerEvent::Audio(b)]);
    }

    #[test]
    fn parses_interruption_and_acks() {
        let events =
            parse_server_message(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::Interrupted]);

        let events = parse_server_message(r#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::SetupComplete]);

        let events =
            parse_server_message(r#"{"serverContent":{"turnComplete":true}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::TurnComplete]);
    }

    #[test]
    fn unknown_objects_yield_nothing() {
        assert!(parse_server_message(r#"{"usageMetadata":{}}"#).unwrap().is_empty());
    }

    #[test]
    fn malformed_frames_are_rejected_whole() {
        assert!(matches!(
            parse_server_message("{not json"),
            Err(LiveError::ProtocolViolation(_))
        ));
        assert!(matches!(
            parse_server_message("[1,2]"),
            Err(LiveError::ProtocolViolation(_))
        ));
        let good = pcm::encode(&[0, 0]);
        let text = json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": PCM_MIME_TYPE, "data": good}},
            {"inlineData": {"mimeType": PCM_MIME_TYPE, "data": "%%%"}}
        ]}}})
        .to_string();
        assert!(matches!(
            parse_server_message(&text),
            Err(LiveError::MalformedPayload(_))
        ));
    }
}
