//! Capture module: bounded microphone recordings

mod command;
mod manager;

pub use command::CommandMicrophone;
pub use manager::{
    CaptureError, CaptureHandle, CaptureManager, CaptureReport, CapturedAudio, OnComplete,
};

#[cfg(test)]
pub(crate) use manager::tests::{FakeMicrophone, MicProbe};
