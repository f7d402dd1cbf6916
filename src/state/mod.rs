//! Session state module
//!
//! The session moves through seven states:
//! - Idle: attract loop, detector armed
//! - Activating: activation clip playing
//! - Greeting: waiting for "tap to speak"
//! - Listening: microphone recording, bounded by the recording duration
//! - Processing: waiting for the understanding service
//! - Answered / Fallback: result on screen until the user resets
//!
//! The transition table is a pure function; [`SessionController`] runs it
//! against real timers, devices and the network.

mod controller;
mod machine;
mod timer;

pub use controller::{ControllerLinks, SessionController, SessionSnapshot};
pub use machine::SessionState;
