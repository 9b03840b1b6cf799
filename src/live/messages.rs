//! Wire messages for the live bidirectional session
//!
//! Outbound messages are serialized as single-key JSON objects
//! (`{"setup": {...}}`, `{"realtimeInput": {...}}`, ...). Inbound payloads are
//! classified into [`ServerEvent`]s; a single `serverContent` payload may carry
//! several elements, each of which becomes exactly one event.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::tools::ToolDeclaration;

/// MIME type used for microphone chunks
pub const INPUT_AUDIO_MIME: &str = "audio/pcm";

/// Response modality requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Text,
    Audio,
}

/// Parameters of the setup handshake
#[derive(Debug, Clone)]
pub struct SetupParams {
    /// Model identifier (e.g. "models/gemini-2.0-flash-live-001")
    pub model: String,
    /// Prebuilt voice name
    pub voice: String,
    /// System instruction text
    pub system_instruction: Option<String>,
    /// Tools offered to the model
    pub tools: Vec<ToolDeclaration>,
    /// Requested response modality
    pub modality: Modality,
}

/// Messages sent to the server
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<ToolDeclaration>,
}

/// A conversation turn (role + parts)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// A single content part
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Base64-framed binary payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Result of one function call, reported back to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

impl FunctionResponse {
    /// Wrap a successful tool payload as `{response: <payload>}`
    #[must_use]
    pub fn success(id: String, name: String, payload: Value) -> Self {
        Self {
            id,
            name,
            response: serde_json::json!({ "response": payload }),
        }
    }

    /// Wrap a tool failure as `{response: {error: <message>}}`
    #[must_use]
    pub fn failure(id: String, name: String, message: &str) -> Self {
        Self {
            id,
            name,
            response: serde_json::json!({ "response": { "error": message } }),
        }
    }
}

/// A function call requested by the model
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ClientMessage {
    /// Build the setup handshake message
    #[must_use]
    pub fn setup(params: &SetupParams) -> Self {
        let audio = params.modality == Modality::Audio;
        let speech_config = audio.then(|| SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: params.voice.clone(),
                },
            },
        });
        let tools = if params.tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolSet {
                function_declarations: params.tools.clone(),
            }]
        };

        Self::Setup(Setup {
            model: params.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![params.modality],
                speech_config,
            },
            system_instruction: params.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part::text(text)],
            }),
            tools,
            input_audio_transcription: audio.then(Empty::default),
            output_audio_transcription: audio.then(Empty::default),
        })
    }

    /// Build a user text turn
    #[must_use]
    pub fn text(text: &str, turn_complete: bool) -> Self {
        Self::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(text)],
            }],
            turn_complete,
        })
    }

    /// Build a realtime audio input message from raw PCM
    #[must_use]
    pub fn audio(pcm: &[u8]) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: INPUT_AUDIO_MIME.to_string(),
                data: B64.encode(pcm),
            }],
        })
    }

    /// Bundle tool results into one message
    #[must_use]
    pub const fn tool_responses(function_responses: Vec<FunctionResponse>) -> Self {
        Self::ToolResponse(ToolResponse { function_responses })
    }

    /// Serialize to wire JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            inline_data: None,
        }
    }
}

/// A classified inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Setup handshake acknowledged
    SetupAck,
    /// Decoded output PCM (24 kHz, 16-bit mono)
    OutputAudio(Vec<u8>),
    /// Model text output
    OutputText(String),
    /// Transcription of the user's speech
    InputTranscription(String),
    /// Transcription of the model's speech
    OutputTranscription(String),
    /// Function calls requested mid-turn
    ToolCall(Vec<FunctionCall>),
    /// The model finished its turn
    TurnComplete,
    /// The model preempted its own output
    Interrupted,
    /// Server-reported error
    Error(Value),
}

impl ServerEvent {
    /// Event kind name, used in logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SetupAck => "setup_ack",
            Self::OutputAudio(_) => "output_audio",
            Self::OutputText(_) => "output_text",
            Self::InputTranscription(_) => "input_transcription",
            Self::OutputTranscription(_) => "output_transcription",
            Self::ToolCall(_) => "tool_call",
            Self::TurnComplete => "turn_complete",
            Self::Interrupted => "interrupted",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Inbound {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallPayload>,
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<Content>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallPayload {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

/// Classify one inbound payload into typed events
///
/// Parts that cannot be played are skipped so the flags sharing their
/// payload still arrive.
///
/// # Errors
///
/// Returns `ProtocolError::Malformed` if the payload is not JSON or contains
/// nothing recognizable
pub fn classify(raw: &str) -> Result<Vec<ServerEvent>, ProtocolError> {
    let inbound: Inbound =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let mut events = Vec::new();

    if inbound.setup_complete.is_some() {
        events.push(ServerEvent::SetupAck);
    }

    if let Some(content) = inbound.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    if !blob.mime_type.starts_with("audio/") {
                        tracing::warn!(mime = %blob.mime_type, "skipping unsupported inline data");
                        continue;
                    }
                    match B64.decode(blob.data.as_bytes()) {
                        Ok(pcm) => events.push(ServerEvent::OutputAudio(pcm)),
                        Err(e) => tracing::warn!(error = %e, "skipping undecodable audio part"),
                    }
                } else if let Some(text) = part.text {
                    events.push(ServerEvent::OutputText(text));
                }
            }
        }
        if let Some(t) = content.input_transcription {
            events.push(ServerEvent::InputTranscription(t.text));
        }
        if let Some(t) = content.output_transcription {
            events.push(ServerEvent::OutputTranscription(t.text));
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(call) = inbound.tool_call {
        events.push(ServerEvent::ToolCall(call.function_calls));
    }

    if let Some(error) = inbound.error {
        events.push(ServerEvent::Error(error));
    }

    if events.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "unrecognized message: {}",
            truncate(raw, 120)
        )));
    }

    Ok(events)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
