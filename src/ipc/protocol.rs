//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.
//! The presentation layer reports taps and clip completion as requests and,
//! once subscribed, receives every [`Directive`] as a push notification.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::events::{Clip, Control, Directive};
use crate::state::{SessionSnapshot, SessionState};

/// Requests from the presentation layer to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping to check connectivity
    Ping,

    /// Request current kiosk status
    GetStatus,

    /// Subscribe to directive notifications
    Subscribe,

    /// The user tapped one of the on-screen controls
    Tap { control: Control },

    /// A non-looping clip reached its end
    ClipFinished { clip: Clip },

    /// Use a local audio file instead of the microphone
    SubmitFile { path: PathBuf },
}

/// Responses from daemon to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current kiosk status
    Status(KioskStatus),

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Input queued for the session controller
    Accepted,

    /// Error response
    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Push notification for subscribed clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Directive { directive: Directive },
}

/// Full kiosk status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KioskStatus {
    /// Daemon version
    pub version: String,

    /// Current session state
    pub state: SessionState,

    /// Session generation, incremented on every return to Idle
    pub generation: u64,

    /// False once the detection model failed to load
    pub detection_available: bool,

    /// Whether the understanding service is reachable
    pub connected: bool,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl KioskStatus {
    pub fn new(snapshot: SessionSnapshot, uptime_secs: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: snapshot.state,
            generation: snapshot.generation,
            detection_available: snapshot.detection_available,
            connected: snapshot.connected,
            uptime_secs,
        }
    }
}
