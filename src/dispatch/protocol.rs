//! Wire protocol of the understanding service
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.
//! Audio travels base64-encoded inside `process_audio`.

use serde::{Deserialize, Serialize};

/// Answer text in the primary and secondary display languages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyText {
    #[serde(rename = "response_primary", alias = "response_en")]
    pub primary: String,
    #[serde(rename = "response_secondary", alias = "response_ur", default)]
    pub secondary: String,
}

impl ReplyText {
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
        }
    }

    /// Shown when the connection drops with a request in flight
    pub fn connection_lost() -> Self {
        Self::new(
            "Sorry, I lost my connection. Please try again.",
            "معذرت، رابطہ منقطع ہو گیا۔ دوبارہ کوشش کریں۔",
        )
    }

    /// Shown when the service never answers
    pub fn no_reply() -> Self {
        Self::new(
            "Sorry, I didn't get an answer in time. Please try again.",
            "معذرت، بروقت جواب نہیں ملا۔ دوبارہ کوشش کریں۔",
        )
    }
}

/// `process_audio` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessAudio {
    #[serde(with = "base64_bytes")]
    pub audio_data: Vec<u8>,
    pub lang: String,
}

/// Frames sent to the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    ProcessAudio(ProcessAudio),
}

/// Frames received from the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    Response(ReplyText),
    FallbackResponse(ReplyText),
}

/// One captured utterance to be understood
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionRequest {
    pub audio: Vec<u8>,
    pub language: String,
}

impl From<RecognitionRequest> for OutboundEvent {
    fn from(request: RecognitionRequest) -> Self {
        OutboundEvent::ProcessAudio(ProcessAudio {
            audio_data: request.audio,
            lang: request.language,
        })
    }
}

/// Terminal outcome of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionOutcome {
    Answer(ReplyText),
    Fallback(ReplyText),
}

impl From<InboundEvent> for RecognitionOutcome {
    fn from(event: InboundEvent) -> Self {
        match event {
            InboundEvent::Response(text) => RecognitionOutcome::Answer(text),
            InboundEvent::FallbackResponse(text) => RecognitionOutcome::Fallback(text),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
