//! Session controller
//!
//! Consumes [`SessionEvent`]s one at a time, drops the ones that belong to
//! an earlier session, runs the transition table and carries out its
//! effects: arming the detector, timers, recordings, requests and the
//! directives sent to the presentation layer.
//!
//! Every event is handled to completion before the next one is read, so a
//! reset and the release of the resources it implies are atomic with
//! respect to everything else.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::machine::{attract_effects, transition, Effect, Input, SessionState};
use super::timer::Timer;
use crate::capture::{CaptureHandle, CaptureManager, OnComplete};
use crate::config::Timings;
use crate::dispatch::{
    QueryDispatcher, RecognitionOutcome, RecognitionRequest, ReplyText, TransportEvent,
};
use crate::events::{Control, Directive, SessionEvent};
use crate::presence::{ArmSwitch, DetectorFault};

/// Externally visible summary of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub generation: u64,
    pub detection_available: bool,
    pub connected: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            generation: 0,
            detection_available: true,
            connected: false,
        }
    }
}

/// What the current generation holds right now
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub detector_armed: bool,
    pub lockout_pending: bool,
    pub recording_open: bool,
    pub request_pending: bool,
    pub reply_timer_pending: bool,
}

/// Channels the controller talks through
pub struct ControllerLinks {
    pub arm: ArmSwitch,
    pub capture: CaptureManager,
    pub dispatcher: QueryDispatcher,
    /// Loopback into the controller's own queue, for timers and callbacks
    pub event_tx: mpsc::UnboundedSender<SessionEvent>,
    pub directive_tx: broadcast::Sender<Directive>,
    pub snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// Runs the session state machine against timers, devices and the network
pub struct SessionController {
    /// Current state
    state: SessionState,

    /// Session generation, incremented on every reset
    generation: u64,

    /// When the current state was entered
    entered_at: Instant,

    /// Cleared for good once the detection model failed to load
    detection_available: bool,

    /// Lockout, recording and reply durations
    timings: Timings,

    /// Language tag sent with every request
    language: String,

    /// Arms and disarms the presence detector
    arm: ArmSwitch,

    /// Starts microphone recordings
    capture: CaptureManager,

    /// The open recording, if any
    recording: Option<CaptureHandle>,

    /// Sends requests and correlates their replies
    dispatcher: QueryDispatcher,

    /// Activation lockout timer
    lockout: Option<Timer>,

    /// Reply timeout timer
    reply_timer: Option<Timer>,

    /// Loopback into the controller's own queue
    event_tx: mpsc::UnboundedSender<SessionEvent>,

    /// Directive broadcaster to the presentation layer
    directive_tx: broadcast::Sender<Directive>,

    /// Snapshot publisher for status queries
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    /// Create a new session controller in the Idle state
    pub fn new(timings: Timings, language: impl Into<String>, links: ControllerLinks) -> Self {
        Self {
            state: SessionState::Idle,
            generation: 0,
            entered_at: Instant::now(),
            detection_available: true,
            timings,
            language: language.into(),
            arm: links.arm,
            capture: links.capture,
            recording: None,
            dispatcher: links.dispatcher,
            lockout: None,
            reply_timer: None,
            event_tx: links.event_tx,
            directive_tx: links.directive_tx,
            snapshot_tx: links.snapshot_tx,
        }
    }

    /// Get current state
    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get current session generation
    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resources held on behalf of the current generation
    #[cfg(test)]
    pub fn resources(&self) -> Resources {
        Resources {
            detector_armed: self.arm.current().armed,
            lockout_pending: self.lockout.is_some(),
            recording_open: self.recording.is_some(),
            request_pending: self.dispatcher.is_pending(self.generation),
            reply_timer_pending: self.reply_timer.is_some(),
        }
    }

    /// Enter the attract loop. Called once before the first event.
    pub fn start(&mut self) {
        info!(generation = self.generation, "session controller started in Idle state");
        self.apply(attract_effects());
        self.publish_snapshot();
    }

    /// Run until every sender of the queue is gone
    pub async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        self.start();
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
        self.shutdown();
    }

    /// Release everything and leave the detector disarmed
    pub fn shutdown(&mut self) {
        self.release_all();
        info!(state = %self.state, generation = self.generation, "session controller stopped");
    }

    /// Handle one event to completion
    pub fn handle_event(&mut self, event: SessionEvent) {
        let input = match event {
            SessionEvent::Activated { arm_epoch } => {
                let arm = self.arm.current();
                if !arm.armed || arm.epoch != arm_epoch {
                    debug!(arm_epoch, current = arm.epoch, "discarding stale activation");
                    return;
                }
                Input::Activated
            }

            SessionEvent::DetectorFault { fault } => match self.on_detector_fault(fault) {
                Some(input) => input,
                None => return,
            },

            SessionEvent::DetectorProgress(progress) => {
                if self.state == SessionState::Idle {
                    self.present(Directive::status(progress.message()));
                }
                return;
            }

            SessionEvent::ClipFinished(clip) => Input::ClipFinished(clip),

            SessionEvent::Tap(Control::Speak) => Input::SpeakTapped,
            SessionEvent::Tap(Control::Stop) => Input::StopTapped,
            SessionEvent::Tap(Control::Reset) => Input::Reset,

            SessionEvent::FileSupplied(audio) => Input::FileSupplied(audio),

            SessionEvent::RecordingFinished { generation, result } => {
                if self.is_stale(generation, "recording_finished") {
                    return;
                }
                self.recording = None;
                match result {
                    Ok(report) => {
                        if report.audio.is_empty() {
                            info!(generation, reason = ?report.reason, "recording captured no audio");
                        }
                        Input::RecordingFinished(report.audio)
                    }
                    Err(e) => Input::Failure(e.into()),
                }
            }

            SessionEvent::LockoutElapsed { generation } => {
                if self.is_stale(generation, "lockout_elapsed") {
                    return;
                }
                self.lockout = None;
                info!(generation, "activation lockout elapsed");
                Input::LockoutElapsed
            }

            SessionEvent::ReplyTimedOut { generation } => {
                if self.is_stale(generation, "reply_timed_out") {
                    return;
                }
                self.reply_timer = None;
                if !self.dispatcher.expire(generation) {
                    return;
                }
                warn!(generation, "no reply from understanding service");
                Input::Outcome(RecognitionOutcome::Fallback(ReplyText::no_reply()))
            }

            SessionEvent::Outcome {
                generation,
                outcome,
            } => {
                if self.is_stale(generation, "outcome") {
                    return;
                }
                Input::Outcome(outcome)
            }

            SessionEvent::Transport(event) => {
                self.on_transport(event);
                return;
            }
        };

        self.apply_input(input);
    }

    fn is_stale(&self, generation: u64, event: &str) -> bool {
        let stale = generation != self.generation;
        if stale {
            debug!(
                event,
                generation,
                current = self.generation,
                "discarding event from an earlier session"
            );
        }
        stale
    }

    fn on_detector_fault(&mut self, fault: DetectorFault) -> Option<Input> {
        error!(?fault, "presence detector fault");
        if matches!(fault, DetectorFault::LoadFailed(_)) {
            self.detection_available = false;
            self.publish_snapshot();
        }
        // Camera faults can only be raised while armed, i.e. in Idle.
        if self.state != SessionState::Idle {
            debug!(state = %self.state, "detector fault outside Idle, ignoring");
            return None;
        }
        Some(Input::Failure(fault.into()))
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match &event {
            TransportEvent::Connected => {
                self.present(Directive::status("Connected."));
            }
            TransportEvent::Disconnected { .. } => {
                self.present(Directive::status("Connection lost. Reconnecting..."));
            }
            TransportEvent::Inbound(_) => {}
        }

        for correlated in self.dispatcher.on_transport(event) {
            if correlated.generation == self.generation {
                self.apply_input(Input::Outcome(correlated.outcome));
            } else {
                info!(
                    generation = correlated.generation,
                    current = self.generation,
                    "discarding outcome for an earlier session"
                );
            }
        }
        self.publish_snapshot();
    }

    fn apply_input(&mut self, input: Input) {
        let from = self.state;
        let label = input.label();

        let Some(step) = transition(from, input) else {
            debug!(state = %from, event = label, "event ignored in current state");
            return;
        };

        // Resources first, then the state change, then presentation.
        let (presentation, work): (Vec<Effect>, Vec<Effect>) =
            step.effects.into_iter().partition(Effect::is_presentation);
        self.apply(work);

        if step.next != from {
            let duration_ms = self.entered_at.elapsed().as_millis() as u64;
            self.state = step.next;
            self.entered_at = Instant::now();
            info!(
                from = %from,
                to = %step.next,
                event = label,
                generation = self.generation,
                duration_ms,
                "state transition"
            );
            self.present(Directive::StateChanged {
                from,
                to: step.next,
                generation: self.generation,
            });
        }

        self.apply(presentation);
        self.publish_snapshot();
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::ArmDetector => self.arm_detector(),
                Effect::DisarmDetector => self.arm.disarm(),
                Effect::StartLockout => self.start_lockout(),
                Effect::CancelLockout => {
                    if let Some(timer) = self.lockout.take() {
                        timer.cancel();
                    }
                }
                Effect::StartRecording => self.start_recording(),
                Effect::StopRecording => {
                    if let Some(recording) = self.recording.as_mut() {
                        debug!("stopping recording early");
                        recording.stop();
                    }
                }
                Effect::Submit(audio) => self.submit(audio),
                Effect::CancelReplyTimer => {
                    if let Some(timer) = self.reply_timer.take() {
                        timer.cancel();
                    }
                }
                Effect::ReleaseAll => self.release_all(),
                Effect::NewGeneration => {
                    self.generation += 1;
                    debug!(generation = self.generation, "new session generation");
                }
                Effect::Present(directive) => self.present(directive),
            }
        }
    }

    fn arm_detector(&mut self) {
        if !self.detection_available {
            debug!("gesture detection unavailable, staying disarmed");
            return;
        }
        let epoch = self.arm.arm();
        debug!(epoch, "detector armed");
    }

    fn start_lockout(&mut self) {
        let Some(duration) = self.timings.activation_lockout else {
            return;
        };
        self.lockout = Some(Timer::start(
            duration,
            self.event_tx.clone(),
            SessionEvent::LockoutElapsed {
                generation: self.generation,
            },
        ));
    }

    fn start_recording(&mut self) {
        let generation = self.generation;
        let tx = self.event_tx.clone();
        let on_complete: OnComplete = Box::new(move |result| {
            let _ = tx.send(SessionEvent::RecordingFinished { generation, result });
        });

        match self.capture.begin(self.timings.recording_duration, on_complete) {
            Ok(handle) => self.recording = Some(handle),
            Err(e) => {
                error!(?e, "could not start recording");
                let _ = self
                    .event_tx
                    .send(SessionEvent::RecordingFinished {
                        generation,
                        result: Err(e),
                    });
            }
        }
    }

    fn submit(&mut self, audio: Vec<u8>) {
        let generation = self.generation;
        let request = RecognitionRequest {
            audio,
            language: self.language.clone(),
        };

        match self.dispatcher.submit(generation, request) {
            Ok(()) => {
                self.reply_timer = Some(Timer::start(
                    self.timings.reply_timeout,
                    self.event_tx.clone(),
                    SessionEvent::ReplyTimedOut { generation },
                ));
            }
            Err(e) => {
                warn!(?e, generation, "cannot submit request");
                let _ = self.event_tx.send(SessionEvent::Outcome {
                    generation,
                    outcome: RecognitionOutcome::Fallback(ReplyText::connection_lost()),
                });
            }
        }
    }

    /// Cancel everything owned by the current generation
    fn release_all(&mut self) {
        self.arm.disarm();
        if let Some(timer) = self.lockout.take() {
            timer.cancel();
        }
        if let Some(timer) = self.reply_timer.take() {
            timer.cancel();
        }
        if self.recording.take().is_some() {
            debug!("recording aborted");
        }
        if self.dispatcher.abandon(self.generation) {
            info!(generation = self.generation, "in-flight request abandoned");
        }
    }

    fn present(&self, directive: Directive) {
        debug!(%directive, "emitting directive");
        let _ = self.directive_tx.send(directive);
    }

    fn publish_snapshot(&self) {
        let snapshot = SessionSnapshot {
            state: self.state,
            generation: self.generation,
            detection_available: self.detection_available,
            connected: self.dispatcher.is_connected(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            let changed = *current != snapshot;
            *current = snapshot;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;
    use crate::capture::{FakeMicrophone, MicProbe};
    use crate::dispatch::{InboundEvent, OutboundEvent};
    use crate::events::{Clip, Scene};
    use crate::presence::{
        ArmState, DetectorAdapter, DetectorProgress, PollTimings, ScriptedDetector,
    };

    struct Harness {
        controller: SessionController,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        directives: broadcast::Receiver<Directive>,
        arm_rx: watch::Receiver<ArmState>,
        outbound: mpsc::Receiver<OutboundEvent>,
        snapshot: watch::Receiver<SessionSnapshot>,
        mic: MicProbe,
    }

    fn harness_with(timings: Timings, mic: FakeMicrophone) -> Harness {
        let probe = mic.probe.clone();
        let (arm, arm_rx) = ArmSwitch::new();
        let (outbound_tx, outbound) = mpsc::channel(8);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (directive_tx, directives) = broadcast::channel(256);
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::default());

        let links = ControllerLinks {
            arm,
            capture: CaptureManager::new(Arc::new(mic)),
            dispatcher: QueryDispatcher::new(outbound_tx, timings.reply_timeout),
            event_tx,
            directive_tx,
            snapshot_tx,
        };
        let mut controller = SessionController::new(timings, "en", links);
        controller.start();

        Harness {
            controller,
            events,
            directives,
            arm_rx,
            outbound,
            snapshot,
            mic: probe,
        }
    }

    fn harness() -> Harness {
        // One 4-byte fragment every 100ms, the first at 50ms.
        harness_with(
            Timings::default(),
            FakeMicrophone::periodic(Duration::from_millis(100), 200),
        )
    }

    impl Harness {
        fn send(&mut self, event: SessionEvent) {
            self.controller.handle_event(event);
        }

        /// Wait for the next timer or recording event and handle it
        async fn step(&mut self) {
            let event = self.events.recv().await.expect("controller queue closed");
            self.controller.handle_event(event);
        }

        fn state(&self) -> SessionState {
            self.controller.state()
        }

        fn connect(&mut self) {
            self.send(SessionEvent::Transport(TransportEvent::Connected));
        }

        fn activate(&mut self) {
            let arm_epoch = self.arm_rx.borrow().epoch;
            self.send(SessionEvent::Activated { arm_epoch });
        }

        fn to_greeting(&mut self) {
            self.activate();
            assert_eq!(self.state(), SessionState::Activating);
            self.send(SessionEvent::ClipFinished(Clip::StandUp));
            assert_eq!(self.state(), SessionState::Greeting);
        }

        fn inbound(&mut self, event: InboundEvent) {
            self.send(SessionEvent::Transport(TransportEvent::Inbound(event)));
        }

        fn reply(&mut self, text: &str) {
            self.inbound(InboundEvent::Response(ReplyText::new(text, "")));
        }

        fn submitted_audio(&mut self) -> Vec<u8> {
            match self.outbound.try_recv() {
                Ok(OutboundEvent::ProcessAudio(payload)) => {
                    assert_eq!(payload.lang, "en");
                    payload.audio_data
                }
                Err(e) => panic!("nothing submitted: {:?}", e),
            }
        }

        fn drain_directives(&mut self) -> Vec<Directive> {
            let mut out = Vec::new();
            while let Ok(directive) = self.directives.try_recv() {
                out.push(directive);
            }
            out
        }

        fn assert_released(&self) {
            assert_eq!(
                self.controller.resources(),
                Resources {
                    detector_armed: true,
                    ..Resources::default()
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_in_attract_loop_armed() {
        let mut h = harness();

        assert_eq!(h.state(), SessionState::Idle);
        assert_eq!(
            *h.arm_rx.borrow(),
            ArmState {
                armed: true,
                epoch: 1
            }
        );
        let directives = h.drain_directives();
        assert!(directives.contains(&Directive::ShowScene {
            scene: Scene::Attract
        }));
        assert!(directives.contains(&Directive::play(Clip::IdleLoop)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_disarms_and_plays_stand_up() {
        let mut h = harness();
        h.drain_directives();

        h.activate();
        assert_eq!(h.state(), SessionState::Activating);
        assert!(!h.arm_rx.borrow().armed);
        assert!(h.controller.resources().lockout_pending);

        let directives = h.drain_directives();
        assert_eq!(
            directives[0],
            Directive::StateChanged {
                from: SessionState::Idle,
                to: SessionState::Activating,
                generation: 0,
            }
        );
        assert!(directives.contains(&Directive::play(Clip::StandUp)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_session_with_spoken_query() {
        let mut h = harness();
        h.connect();
        h.to_greeting();

        let start = Instant::now();
        h.send(SessionEvent::Tap(Control::Speak));
        assert_eq!(h.state(), SessionState::Listening);
        assert!(!h.controller.resources().lockout_pending);

        h.step().await;
        assert_eq!(h.state(), SessionState::Processing);
        assert_eq!(start.elapsed(), Duration::from_millis(5000));

        // Fragments at 50, 150, ..., 4950ms.
        assert_eq!(h.submitted_audio().len(), 50 * 4);
        assert_eq!(h.mic.live_streams.load(Ordering::SeqCst), 0);

        h.drain_directives();
        h.reply("Ward 4 is upstairs");
        assert_eq!(h.state(), SessionState::Answered);
        assert!(h.drain_directives().contains(&Directive::ShowAnswer {
            primary: "Ward 4 is upstairs".into(),
            secondary: String::new(),
        }));
        assert!(!h.controller.resources().reply_timer_pending);

        h.send(SessionEvent::Tap(Control::Reset));
        assert_eq!(h.state(), SessionState::Idle);
        assert_eq!(h.controller.generation(), 1);
        assert_eq!(h.arm_rx.borrow().epoch, 2);
        h.assert_released();
        assert_eq!(h.snapshot.borrow().generation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tap_submits_partial_recording() {
        let mut h = harness();
        h.connect();
        h.to_greeting();
        h.send(SessionEvent::Tap(Control::Speak));

        sleep(Duration::from_millis(1000)).await;
        h.send(SessionEvent::Tap(Control::Stop));
        assert_eq!(h.state(), SessionState::Processing);
        assert!(h.outbound.try_recv().is_err());

        h.step().await;
        assert_eq!(h.state(), SessionState::Processing);
        assert_eq!(h.submitted_audio().len(), 10 * 4);
        assert!(h.controller.resources().request_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supplied_file_skips_listening() {
        let mut h = harness();
        h.connect();
        h.to_greeting();

        h.send(SessionEvent::FileSupplied(vec![0x52, 0x49, 0x46, 0x46]));
        assert_eq!(h.state(), SessionState::Processing);
        assert_eq!(h.submitted_audio(), vec![0x52, 0x49, 0x46, 0x46]);
        assert_eq!(h.mic.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_response() {
        let mut h = harness();
        h.connect();
        h.to_greeting();
        h.send(SessionEvent::FileSupplied(vec![1]));
        h.drain_directives();

        h.inbound(InboundEvent::FallbackResponse(ReplyText::new("Please ask again", "")));
        assert_eq!(h.state(), SessionState::Fallback);
        assert!(h.drain_directives().contains(&Directive::ShowFallback {
            primary: "Please ask again".into(),
            secondary: String::new(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_processing_falls_back() {
        let mut h = harness();
        h.connect();
        h.to_greeting();
        h.send(SessionEvent::FileSupplied(vec![1, 2, 3]));
        h.drain_directives();

        h.send(SessionEvent::Transport(TransportEvent::Disconnected {
            reason: "reset by peer".into(),
        }));
        assert_eq!(h.state(), SessionState::Fallback);
        let lost = ReplyText::connection_lost();
        assert!(h.drain_directives().contains(&Directive::ShowFallback {
            primary: lost.primary,
            secondary: lost.secondary,
        }));
        assert!(!h.snapshot.borrow().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_idle_only_reports_status() {
        let mut h = harness();
        h.connect();
        h.drain_directives();

        h.send(SessionEvent::Transport(TransportEvent::Disconnected {
            reason: "closed".into(),
        }));
        assert_eq!(h.state(), SessionState::Idle);
        assert_eq!(
            h.drain_directives(),
            vec![Directive::status("Connection lost. Reconnecting...")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_while_disconnected_falls_back() {
        let mut h = harness();
        h.to_greeting();

        h.send(SessionEvent::FileSupplied(vec![1, 2, 3]));
        assert_eq!(h.state(), SessionState::Processing);
        h.step().await;
        assert_eq!(h.state(), SessionState::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_after_reset_is_discarded() {
        let mut h = harness();
        h.connect();
        h.to_greeting();
        h.send(SessionEvent::FileSupplied(vec![1]));
        h.submitted_audio();

        h.send(SessionEvent::Tap(Control::Reset));
        assert_eq!(h.state(), SessionState::Idle);
        h.assert_released();
        h.drain_directives();

        h.reply("answer for the previous visitor");
        assert_eq!(h.state(), SessionState::Idle);
        assert!(!h
            .drain_directives()
            .iter()
            .any(|d| matches!(d, Directive::ShowAnswer { .. })));

        // The next visitor gets their own answer.
        h.to_greeting();
        h.send(SessionEvent::FileSupplied(vec![2]));
        h.reply("fresh");
        assert_eq!(h.state(), SessionState::Answered);
        assert!(h.drain_directives().contains(&Directive::ShowAnswer {
            primary: "fresh".into(),
            secondary: String::new(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_timeout_falls_back() {
        let mut h = harness();
        h.connect();
        h.to_greeting();
        h.send(SessionEvent::FileSupplied(vec![1]));

        let start = Instant::now();
        h.step().await;
        assert_eq!(h.state(), SessionState::Fallback);
        assert_eq!(start.elapsed(), Duration::from_secs(30));

        h.reply("too late");
        assert_eq!(h.state(), SessionState::Fallback);
        assert!(!h.controller.resources().request_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_does_not_swallow_next_answer() {
        let mut h = harness();
        h.connect();
        h.to_greeting();
        h.send(SessionEvent::FileSupplied(vec![1]));

        // The service never answers the first visitor.
        h.step().await;
        assert_eq!(h.state(), SessionState::Fallback);
        h.send(SessionEvent::Tap(Control::Reset));
        assert_eq!(h.state(), SessionState::Idle);

        h.to_greeting();
        h.send(SessionEvent::FileSupplied(vec![2]));
        h.drain_directives();
        h.reply("answer for visitor two");
        assert_eq!(h.state(), SessionState::Answered);
        assert!(h.drain_directives().contains(&Directive::ShowAnswer {
            primary: "answer for visitor two".into(),
            secondary: String::new(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_abandoned_by_reset_expires_after_reply_window() {
        let mut h = harness();
        h.connect();
        h.to_greeting();
        h.send(SessionEvent::FileSupplied(vec![1]));
        h.send(SessionEvent::Tap(Control::Reset));
        assert_eq!(h.state(), SessionState::Idle);

        // Nobody comes by until the abandoned request is long dead.
        sleep(Duration::from_secs(45)).await;

        h.to_greeting();
        h.send(SessionEvent::FileSupplied(vec![2]));
        h.reply("fresh");
        assert_eq!(h.state(), SessionState::Answered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_progress_is_shown_only_while_idle() {
        let mut h = harness();
        h.drain_directives();

        h.send(SessionEvent::DetectorProgress(DetectorProgress::Scanning));
        assert_eq!(
            h.drain_directives(),
            vec![Directive::status("Scanning for hand...")]
        );

        h.activate();
        h.drain_directives();
        h.send(SessionEvent::DetectorProgress(DetectorProgress::PresenceSeen));
        assert!(h.drain_directives().is_empty());
        assert_eq!(h.state(), SessionState::Activating);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_returns_to_idle() {
        let mut h = harness();
        let start = Instant::now();
        h.to_greeting();

        h.step().await;
        assert_eq!(h.state(), SessionState::Idle);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
        assert_eq!(h.controller.generation(), 1);
        h.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_lockout_greeting_waits_for_a_tap() {
        let timings = Timings {
            activation_lockout: None,
            ..Timings::default()
        };
        let mut h = harness_with(timings, FakeMicrophone::default());
        h.to_greeting();

        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.state(), SessionState::Greeting);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_activation_is_ignored() {
        let mut h = harness();
        let old_epoch = h.arm_rx.borrow().epoch;

        h.send(SessionEvent::Tap(Control::Reset));
        assert!(h.arm_rx.borrow().epoch > old_epoch);

        h.send(SessionEvent::Activated {
            arm_epoch: old_epoch,
        });
        assert_eq!(h.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_taps_outside_their_state_are_ignored() {
        let mut h = harness();
        h.send(SessionEvent::Tap(Control::Speak));
        h.send(SessionEvent::Tap(Control::Stop));
        h.send(SessionEvent::ClipFinished(Clip::StandUp));
        assert_eq!(h.state(), SessionState::Idle);
        assert_eq!(h.mic.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_microphone_denied_returns_to_idle() {
        let mic = FakeMicrophone {
            deny: true,
            ..FakeMicrophone::default()
        };
        let mut h = harness_with(Timings::default(), mic);
        h.to_greeting();
        h.send(SessionEvent::Tap(Control::Speak));
        h.drain_directives();

        h.step().await;
        assert_eq!(h.state(), SessionState::Idle);
        assert!(h
            .drain_directives()
            .contains(&Directive::status("Microphone access denied.")));
        assert_eq!(h.mic.opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.mic.live_streams.load(Ordering::SeqCst), 0);
        h.assert_released();
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_denied_keeps_detector_down_until_reset() {
        let mut h = harness();
        h.drain_directives();

        h.send(SessionEvent::DetectorFault {
            fault: DetectorFault::CameraDenied("NotAllowedError".into()),
        });
        assert_eq!(h.state(), SessionState::Idle);
        assert!(!h.arm_rx.borrow().armed);
        assert!(h
            .drain_directives()
            .contains(&Directive::status("Camera access denied.")));

        h.send(SessionEvent::Tap(Control::Reset));
        assert!(h.arm_rx.borrow().armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_disables_gesture_activation() {
        let mut h = harness();
        h.send(SessionEvent::DetectorFault {
            fault: DetectorFault::LoadFailed("model missing".into()),
        });
        assert!(!h.arm_rx.borrow().armed);
        assert!(!h.snapshot.borrow().detection_available);

        h.send(SessionEvent::Tap(Control::Reset));
        assert!(!h.arm_rx.borrow().armed);
    }

    async fn drive_to(h: &mut Harness, target: SessionState) {
        h.connect();
        if target == SessionState::Idle {
            return;
        }
        h.activate();
        if target == SessionState::Activating {
            return;
        }
        h.send(SessionEvent::ClipFinished(Clip::StandUp));
        match target {
            SessionState::Greeting => {}
            SessionState::Listening => {
                h.send(SessionEvent::Tap(Control::Speak));
                sleep(Duration::from_millis(10)).await;
                assert_eq!(h.mic.live_streams.load(Ordering::SeqCst), 1);
            }
            SessionState::Processing => h.send(SessionEvent::FileSupplied(vec![1])),
            SessionState::Answered => {
                h.send(SessionEvent::FileSupplied(vec![1]));
                h.reply("answer");
            }
            SessionState::Fallback => {
                h.send(SessionEvent::FileSupplied(vec![1]));
                h.inbound(InboundEvent::FallbackResponse(ReplyText::new("fallback", "")));
            }
            _ => unreachable!(),
        }
        assert_eq!(h.state(), target);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_from_every_state_releases_everything() {
        for target in [
            SessionState::Idle,
            SessionState::Activating,
            SessionState::Greeting,
            SessionState::Listening,
            SessionState::Processing,
            SessionState::Answered,
            SessionState::Fallback,
        ] {
            let mut h = harness();
            drive_to(&mut h, target).await;
            let generation = h.controller.generation();

            h.send(SessionEvent::Tap(Control::Reset));
            assert_eq!(h.state(), SessionState::Idle, "from {target}");
            assert_eq!(h.controller.generation(), generation + 1);
            h.assert_released();

            // Aborted recordings give their stream back once the task is dropped.
            sleep(Duration::from_millis(10)).await;
            assert_eq!(h.mic.live_streams.load(Ordering::SeqCst), 0, "from {target}");

            // Nothing from the old session reaches the new one.
            sleep(Duration::from_secs(60)).await;
            while let Ok(event) = h.events.try_recv() {
                h.controller.handle_event(event);
            }
            assert_eq!(h.state(), SessionState::Idle, "from {target}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detector_activation_end_to_end() {
        let (detector, probe) = ScriptedDetector::new(&[true; 13]);
        let (arm, arm_rx) = ArmSwitch::new();
        let (outbound_tx, _outbound) = mpsc::channel(8);
        let (event_tx, events) = mpsc::unbounded_channel();
        let (directive_tx, mut directives) = broadcast::channel(64);
        let (snapshot_tx, _snapshot) = watch::channel(SessionSnapshot::default());

        let poll = PollTimings {
            poll_interval: Duration::from_millis(100),
            arm_delay: Duration::from_millis(2000),
            dwell_threshold: Duration::from_millis(1200),
        };
        let adapter = DetectorAdapter::new(detector, arm_rx, event_tx.clone(), poll);
        let detector_task = tokio::spawn(adapter.run());

        let links = ControllerLinks {
            arm,
            capture: CaptureManager::new(Arc::new(FakeMicrophone::default())),
            dispatcher: QueryDispatcher::new(outbound_tx, Timings::default().reply_timeout),
            event_tx,
            directive_tx,
            snapshot_tx,
        };
        let mut controller = SessionController::new(Timings::default(), "en", links);

        let start = Instant::now();
        let controller_task = tokio::spawn(async move { controller.run(events).await });

        loop {
            match directives.recv().await.unwrap() {
                Directive::StateChanged { to, .. } if to == SessionState::Activating => break,
                _ => continue,
            }
        }
        assert_eq!(start.elapsed(), Duration::from_millis(3200));
        assert!(!probe.camera_open.load(Ordering::SeqCst));

        controller_task.abort();
        detector_task.abort();
    }
}
