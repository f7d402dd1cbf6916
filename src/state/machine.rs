//! Session transition table
//!
//! A pure function from `(state, input)` to the next state plus the effects
//! the controller must carry out. Nothing here touches a timer, a device or
//! a socket.

use serde::{Deserialize, Serialize};

use crate::capture::{CaptureError, CapturedAudio};
use crate::dispatch::RecognitionOutcome;
use crate::events::{Clip, Directive, Scene};
use crate::presence::DetectorFault;

/// The seven states of a kiosk session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Attract loop, detector armed
    #[default]
    Idle,
    /// Activation clip playing
    Activating,
    /// Greeting shown, waiting for a tap
    Greeting,
    /// Microphone recording
    Listening,
    /// Waiting for the service
    Processing,
    /// Answer on screen
    Answered,
    /// Failure guidance on screen
    Fallback,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Activating => write!(f, "Activating"),
            SessionState::Greeting => write!(f, "Greeting"),
            SessionState::Listening => write!(f, "Listening"),
            SessionState::Processing => write!(f, "Processing"),
            SessionState::Answered => write!(f, "Answered"),
            SessionState::Fallback => write!(f, "Fallback"),
        }
    }
}

/// Unrecoverable problems with a physical resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceFailure {
    CameraDenied(String),
    CameraLost(String),
    DetectionUnavailable(String),
    MicrophoneDenied(String),
    MicrophoneFailed(String),
}

impl ResourceFailure {
    /// Status line shown to the user
    pub fn message(&self) -> String {
        match self {
            ResourceFailure::CameraDenied(_) => "Camera access denied.".to_string(),
            ResourceFailure::CameraLost(_) => "Camera disconnected.".to_string(),
            ResourceFailure::DetectionUnavailable(_) => {
                "Gesture detection unavailable. Please contact staff.".to_string()
            }
            ResourceFailure::MicrophoneDenied(_) => "Microphone access denied.".to_string(),
            ResourceFailure::MicrophoneFailed(_) => "Microphone unavailable.".to_string(),
        }
    }
}

impl From<DetectorFault> for ResourceFailure {
    fn from(fault: DetectorFault) -> Self {
        match fault {
            DetectorFault::LoadFailed(m) => ResourceFailure::DetectionUnavailable(m),
            DetectorFault::CameraDenied(m) => ResourceFailure::CameraDenied(m),
            DetectorFault::CameraLost(m) => ResourceFailure::CameraLost(m),
        }
    }
}

impl From<CaptureError> for ResourceFailure {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(m) => ResourceFailure::MicrophoneDenied(m),
            other => ResourceFailure::MicrophoneFailed(other.to_string()),
        }
    }
}

/// Inputs to the transition table, already filtered for staleness
#[derive(Debug)]
pub enum Input {
    Activated,
    ClipFinished(Clip),
    SpeakTapped,
    StopTapped,
    Reset,
    FileSupplied(Vec<u8>),
    RecordingFinished(CapturedAudio),
    LockoutElapsed,
    Outcome(RecognitionOutcome),
    Failure(ResourceFailure),
}

impl Input {
    /// Short name for logs
    pub fn label(&self) -> &'static str {
        match self {
            Input::Activated => "activated",
            Input::ClipFinished(_) => "clip_finished",
            Input::SpeakTapped => "speak_tapped",
            Input::StopTapped => "stop_tapped",
            Input::Reset => "reset",
            Input::FileSupplied(_) => "file_supplied",
            Input::RecordingFinished(_) => "recording_finished",
            Input::LockoutElapsed => "lockout_elapsed",
            Input::Outcome(_) => "outcome",
            Input::Failure(_) => "failure",
        }
    }
}

/// Work the controller performs on behalf of a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ArmDetector,
    DisarmDetector,
    StartLockout,
    CancelLockout,
    StartRecording,
    StopRecording,
    Submit(Vec<u8>),
    CancelReplyTimer,
    /// Cancel every timer, stream and request of the current generation
    ReleaseAll,
    NewGeneration,
    Present(Directive),
}

impl Effect {
    pub fn is_presentation(&self) -> bool {
        matches!(self, Effect::Present(_))
    }
}

/// Result of one accepted transition
#[derive(Debug, PartialEq)]
pub struct Step {
    pub next: SessionState,
    pub effects: Vec<Effect>,
}

impl Step {
    fn to(next: SessionState, effects: impl Into<Vec<Effect>>) -> Option<Self> {
        Some(Self {
            next,
            effects: effects.into(),
        })
    }
}

fn show(scene: Scene) -> Effect {
    Effect::Present(Directive::ShowScene { scene })
}

fn play(clip: Clip) -> Effect {
    Effect::Present(Directive::play(clip))
}

/// Effects of (re-)entering the attract loop
pub fn attract_effects() -> Vec<Effect> {
    vec![Effect::ArmDetector, show(Scene::Attract), play(Clip::IdleLoop)]
}

/// Back to Idle, releasing everything the session held
fn reset(status: Option<String>) -> Option<Step> {
    let mut effects = vec![Effect::ReleaseAll, Effect::NewGeneration];
    effects.extend(attract_effects());
    if let Some(message) = status {
        effects.push(Effect::Present(Directive::status(message)));
    }
    Step::to(SessionState::Idle, effects)
}

fn enter_processing(submit: Option<Vec<u8>>, stop: bool) -> Vec<Effect> {
    let mut effects = Vec::new();
    if stop {
        effects.push(Effect::StopRecording);
    }
    if let Some(audio) = submit {
        effects.push(Effect::Submit(audio));
    }
    effects.push(show(Scene::Processing));
    effects.push(play(Clip::ProcessingLoop));
    effects
}

/// The session transition table. `None` means the input does not apply in
/// `state` and must be ignored.
pub fn transition(state: SessionState, input: Input) -> Option<Step> {
    use SessionState::*;

    match (state, input) {
        (Idle, Input::Activated) => Step::to(
            Activating,
            [
                Effect::DisarmDetector,
                Effect::StartLockout,
                show(Scene::Activating),
                play(Clip::StandUp),
            ],
        ),

        (Activating, Input::ClipFinished(Clip::StandUp)) => Step::to(
            Greeting,
            [show(Scene::Greeting), play(Clip::GreetingLoop)],
        ),

        (Activating | Greeting, Input::LockoutElapsed) => reset(None),

        (Greeting, Input::SpeakTapped) => Step::to(
            Listening,
            [Effect::CancelLockout, Effect::StartRecording, show(Scene::Listening)],
        ),

        (Greeting, Input::FileSupplied(audio)) => {
            let mut effects = vec![Effect::CancelLockout];
            effects.extend(enter_processing(Some(audio), false));
            Step::to(Processing, effects)
        }

        (Listening, Input::StopTapped) => Step::to(Processing, enter_processing(None, true)),

        (Listening, Input::RecordingFinished(audio)) => {
            Step::to(Processing, enter_processing(Some(audio.into_bytes()), false))
        }

        // Recording stopped early: the buffer arrives after the transition.
        (Processing, Input::RecordingFinished(audio)) => {
            Step::to(Processing, [Effect::Submit(audio.into_bytes())])
        }

        (Processing, Input::Outcome(RecognitionOutcome::Answer(text))) => Step::to(
            Answered,
            [
                Effect::CancelReplyTimer,
                show(Scene::Answer),
                Effect::Present(Directive::ShowAnswer {
                    primary: text.primary,
                    secondary: text.secondary,
                }),
            ],
        ),

        (Processing, Input::Outcome(RecognitionOutcome::Fallback(text))) => Step::to(
            Fallback,
            [
                Effect::CancelReplyTimer,
                show(Scene::Fallback),
                Effect::Present(Directive::ShowFallback {
                    primary: text.primary,
                    secondary: text.secondary,
                }),
            ],
        ),

        (_, Input::Reset) => reset(None),

        // Already idle: surface the problem, keep the detector down.
        (Idle, Input::Failure(failure)) => Step::to(
            Idle,
            [
                Effect::DisarmDetector,
                Effect::Present(Directive::status(failure.message())),
            ],
        ),

        (_, Input::Failure(failure)) => reset(Some(failure.message())),

        _ => None,
    }
}
