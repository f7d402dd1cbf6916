//! Events module for the session controller
//!
//! Inbound: every asynchronous source (detector, taps, recordings, timers,
//! the network) is reduced to a [`SessionEvent`] on one queue.
//! Outbound: the controller only talks to the presentation layer through
//! declarative [`Directive`]s.

use serde::{Deserialize, Serialize};

use crate::capture::{CaptureError, CaptureReport};
use crate::dispatch::{RecognitionOutcome, TransportEvent};
use crate::presence::{DetectorFault, DetectorProgress};
use crate::state::SessionState;

/// Messages consumed by the session controller, one at a time
#[derive(Debug)]
pub enum SessionEvent {
    /// Dwell confirmed while the detector was armed under `arm_epoch`
    Activated { arm_epoch: u64 },

    /// The detector could not load or lost its camera
    DetectorFault { fault: DetectorFault },

    /// The detector reached a milestone worth showing while idle
    DetectorProgress(DetectorProgress),

    /// The presentation layer finished playing a non-looping clip
    ClipFinished(Clip),

    /// A user tap on one of the kiosk affordances
    Tap(Control),

    /// Audio supplied from a local file instead of the microphone
    FileSupplied(Vec<u8>),

    /// A recording terminated (or could not start)
    RecordingFinished {
        generation: u64,
        result: Result<CaptureReport, CaptureError>,
    },

    /// The activation lockout elapsed without a tap
    LockoutElapsed { generation: u64 },

    /// No reply arrived within the reply timeout
    ReplyTimedOut { generation: u64 },

    /// An outcome produced locally for a request (e.g. not connected)
    Outcome {
        generation: u64,
        outcome: RecognitionOutcome,
    },

    /// Something happened on the connection to the understanding service
    Transport(TransportEvent),
}

/// User-facing affordances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// "Tap to speak"
    Speak,
    /// Finish the recording early
    Stop,
    /// "Ask another question" / "Try again"
    Reset,
}

/// Scenes the presentation layer knows how to show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scene {
    /// Idle loop with the "wave at the camera" prompt
    Attract,
    Activating,
    Greeting,
    Listening,
    Processing,
    Answer,
    Fallback,
}

/// Scripted video clips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Clip {
    IdleLoop,
    StandUp,
    GreetingLoop,
    ProcessingLoop,
}

impl Clip {
    /// Asset path served to the renderer
    pub fn asset(&self) -> &'static str {
        match self {
            Clip::IdleLoop => "/Videos/idle_loop.mp4",
            Clip::StandUp => "/Videos/stand_up_and_walk.mp4",
            Clip::GreetingLoop => "/Videos/greeting_loop.mp4",
            Clip::ProcessingLoop => "/Videos/processing_loop.mp4",
        }
    }

    /// Looping clips never report completion
    pub fn looping(&self) -> bool {
        !matches!(self, Clip::StandUp)
    }
}

/// Directives emitted by the controller for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    /// The session moved between states
    StateChanged {
        from: SessionState,
        to: SessionState,
        generation: u64,
    },

    /// Switch the visible scene
    ShowScene { scene: Scene },

    /// Start a clip from the beginning
    PlayClip { clip: Clip, asset: String, looping: bool },

    /// Status line (permission problems, connectivity)
    Status { message: String },

    /// Answer returned by the service
    ShowAnswer { primary: String, secondary: String },

    /// Failure-path guidance with a retry affordance
    ShowFallback { primary: String, secondary: String },
}

impl Directive {
    pub fn play(clip: Clip) -> Self {
        Directive::PlayClip {
            clip,
            asset: clip.asset().to_string(),
            looping: clip.looping(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Directive::Status {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Directive::StateChanged {
                from,
                to,
                generation,
            } => write!(f, "STATE_CHANGED {} -> {} (gen {})", from, to, generation),
            Directive::ShowScene { scene } => write!(f, "SHOW_SCENE {:?}", scene),
            Directive::PlayClip { clip, .. } => write!(f, "PLAY_CLIP {:?}", clip),
            Directive::Status { message } => write!(f, "STATUS {}", message),
            Directive::ShowAnswer { primary, .. } => write!(f, "SHOW_ANSWER {}", primary),
            Directive::ShowFallback { primary, .. } => write!(f, "SHOW_FALLBACK {}", primary),
        }
    }
}
