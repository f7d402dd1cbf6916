//! Presence module: camera-based activation
//!
//! Turns a periodic presence signal from an external detection capability
//! into a single debounced activation per armed period.

mod detector;
mod dwell;
mod sample;
mod sidecar;

pub use detector::{ArmSwitch, DetectorAdapter, DetectorFault, DetectorProgress, PollTimings};
pub use sample::PresencePredicate;
pub use sidecar::SidecarDetector;

#[cfg(test)]
pub(crate) use detector::{tests::ScriptedDetector, ArmState};
