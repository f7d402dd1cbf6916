//! Presence detector adapter
//!
//! Wraps an external detection capability behind [`PresenceDetector`] and
//! polls it on a fixed cadence, but only while the controller has armed it.
//! The adapter owns the camera for the lifetime of one armed period and
//! releases it before reporting back.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::dwell::DwellConfirmer;
use super::sample::PresenceSample;
use crate::events::SessionEvent;

/// External presence/gesture detection capability
#[async_trait::async_trait]
pub trait PresenceDetector: Send {
    /// Load the detection model. Called once.
    async fn load(&mut self) -> Result<(), DetectorError>;

    /// Acquire the camera stream
    async fn open_camera(&mut self) -> Result<(), DetectorError>;

    /// Run the model on the current frame
    async fn poll(&mut self) -> Result<PresenceSample, DetectorError>;

    /// Stop the camera stream. Must be safe to call when nothing is open.
    async fn release_camera(&mut self);

    /// Detector name for logging
    fn name(&self) -> &str;
}

/// Errors raised by a presence detector
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("detection model failed to load: {0}")]
    Load(String),

    #[error("camera access denied: {0}")]
    CameraDenied(String),

    #[error("camera stream lost: {0}")]
    CameraLost(String),

    #[error("detection failed: {0}")]
    Poll(String),
}

/// Failures reported to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorFault {
    /// Gesture activation is disabled until restart
    LoadFailed(String),
    CameraDenied(String),
    CameraLost(String),
}

impl From<DetectorError> for DetectorFault {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::Load(m) => DetectorFault::LoadFailed(m),
            DetectorError::CameraDenied(m) => DetectorFault::CameraDenied(m),
            DetectorError::CameraLost(m) | DetectorError::Poll(m) => DetectorFault::CameraLost(m),
        }
    }
}

/// Milestones of the detector, shown to the visitor while idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorProgress {
    Loading,
    RequestingCamera,
    Scanning,
    PresenceSeen,
}

impl DetectorProgress {
    pub fn message(&self) -> &'static str {
        match self {
            DetectorProgress::Loading => "Loading detection model...",
            DetectorProgress::RequestingCamera => "Requesting camera access...",
            DetectorProgress::Scanning => "Scanning for hand...",
            DetectorProgress::PresenceSeen => "Hand detected!",
        }
    }
}

/// Arming state published by the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArmState {
    pub armed: bool,
    /// Incremented on every arm; activations carry the epoch they fired under
    pub epoch: u64,
}

/// Controller side of the arm/disarm channel
#[derive(Debug)]
pub struct ArmSwitch {
    tx: watch::Sender<ArmState>,
}

impl ArmSwitch {
    pub fn new() -> (Self, watch::Receiver<ArmState>) {
        let (tx, rx) = watch::channel(ArmState::default());
        (Self { tx }, rx)
    }

    /// Arm detection under a fresh epoch and return it
    pub fn arm(&self) -> u64 {
        self.tx.send_modify(|state| {
            state.armed = true;
            state.epoch += 1;
        });
        self.tx.borrow().epoch
    }

    /// Disarm detection. No-op when already disarmed.
    pub fn disarm(&self) {
        self.tx.send_if_modified(|state| std::mem::replace(&mut state.armed, false));
    }

    pub fn current(&self) -> ArmState {
        *self.tx.borrow()
    }
}

/// Timing constants for the polling loop
#[derive(Debug, Clone, Copy)]
pub struct PollTimings {
    pub poll_interval: Duration,
    pub arm_delay: Duration,
    pub dwell_threshold: Duration,
}

/// Why an armed period ended
#[derive(Debug)]
enum ArmedExit {
    Activated,
    Disarmed,
    Fault(DetectorFault),
    Closed,
}

/// Polls a [`PresenceDetector`] while armed and reports activations
pub struct DetectorAdapter<D> {
    detector: D,
    arm_rx: watch::Receiver<ArmState>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    timings: PollTimings,
    dwell: DwellConfirmer,
    last_epoch: u64,
}

impl<D: PresenceDetector> DetectorAdapter<D> {
    pub fn new(
        detector: D,
        arm_rx: watch::Receiver<ArmState>,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        timings: PollTimings,
    ) -> Self {
        Self {
            detector,
            arm_rx,
            event_tx,
            timings,
            dwell: DwellConfirmer::new(timings.dwell_threshold),
            last_epoch: 0,
        }
    }

    /// Run until the controller goes away
    pub async fn run(mut self) {
        info!(detector = self.detector.name(), "loading presence detector");
        self.report(DetectorProgress::Loading);

        if let Err(e) = self.detector.load().await {
            error!(?e, "presence detection unavailable");
            let _ = self.event_tx.send(SessionEvent::DetectorFault { fault: e.into() });
            return;
        }
        info!(detector = self.detector.name(), "presence detector loaded");

        while let Some(epoch) = self.wait_armed().await {
            let exit = self.run_armed(epoch).await;
            self.detector.release_camera().await;
            debug!(epoch, ?exit, "armed period ended, camera released");

            let event = match exit {
                ArmedExit::Activated => SessionEvent::Activated { arm_epoch: epoch },
                ArmedExit::Fault(fault) => {
                    warn!(?fault, "presence detector fault");
                    SessionEvent::DetectorFault { fault }
                }
                ArmedExit::Disarmed => continue,
                ArmedExit::Closed => break,
            };
            if self.event_tx.send(event).is_err() {
                break;
            }
        }

        self.detector.release_camera().await;
        info!("presence detector stopped");
    }

    /// Wait for an arm under an epoch we have not served yet
    async fn wait_armed(&mut self) -> Option<u64> {
        loop {
            let state = *self.arm_rx.borrow_and_update();
            if state.armed && state.epoch != self.last_epoch {
                self.last_epoch = state.epoch;
                return Some(state.epoch);
            }
            self.arm_rx.changed().await.ok()?;
        }
    }

    fn report(&self, progress: DetectorProgress) {
        let _ = self.event_tx.send(SessionEvent::DetectorProgress(progress));
    }

    fn still_armed(&self, epoch: u64) -> bool {
        let state = *self.arm_rx.borrow();
        state.armed && state.epoch == epoch
    }

    async fn run_armed(&mut self, epoch: u64) -> ArmedExit {
        self.dwell.reset();
        self.report(DetectorProgress::RequestingCamera);
        if let Err(e) = self.detector.open_camera().await {
            return ArmedExit::Fault(e.into());
        }
        if !self.still_armed(epoch) {
            return ArmedExit::Disarmed;
        }

        // Ignore the first frames while the camera settles.
        tokio::select! {
            biased;
            exit = wait_disarmed(&mut self.arm_rx, epoch) => return exit,
            _ = sleep(self.timings.arm_delay) => {}
        }

        let mut ticker = interval(self.timings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(epoch, "presence detection armed");
        self.report(DetectorProgress::Scanning);

        loop {
            let deadline = self.dwell.deadline();
            tokio::select! {
                biased;
                exit = wait_disarmed(&mut self.arm_rx, epoch) => return exit,
                _ = sleep_until_opt(deadline) => {
                    if self.dwell.fire_if_due(Instant::now()) {
                        info!(epoch, "dwell confirmed");
                        return ArmedExit::Activated;
                    }
                }
                _ = ticker.tick() => {
                    let sample = match self.detector.poll().await {
                        Ok(sample) => sample,
                        Err(DetectorError::CameraLost(m)) => {
                            return ArmedExit::Fault(DetectorFault::CameraLost(m));
                        }
                        Err(e) => {
                            warn!(?e, "presence poll failed, counting as absent");
                            PresenceSample::absent()
                        }
                    };
                    if !self.still_armed(epoch) {
                        return ArmedExit::Disarmed;
                    }
                    self.dwell.observe(&sample, Instant::now());
                    if deadline.is_none() && self.dwell.deadline().is_some() {
                        self.report(DetectorProgress::PresenceSeen);
                    }
                }
            }
        }
    }
}

async fn wait_disarmed(arm_rx: &mut watch::Receiver<ArmState>, epoch: u64) -> ArmedExit {
    loop {
        if arm_rx.changed().await.is_err() {
            return ArmedExit::Closed;
        }
        let state = *arm_rx.borrow_and_update();
        if !state.armed || state.epoch != epoch {
            return ArmedExit::Disarmed;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
