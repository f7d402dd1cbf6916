//! Microphone backed by an external recorder process
//!
//! The recorder writes encoded audio to stdout (by default `arecord`
//! producing 16 kHz mono WAV). Releasing the stream kills the process.

use std::io::ErrorKind;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use super::manager::{AudioStream, CaptureError, Microphone};
use crate::config::MicrophoneCommand;

/// 100 ms of 16-bit mono audio at 16 kHz
const DEFAULT_FRAGMENT_BYTES: usize = 3200;

pub struct CommandMicrophone {
    command: MicrophoneCommand,
    fragment_bytes: usize,
}

impl CommandMicrophone {
    pub fn new(command: MicrophoneCommand) -> Self {
        Self {
            command,
            fragment_bytes: DEFAULT_FRAGMENT_BYTES,
        }
    }
}

#[async_trait::async_trait]
impl Microphone for CommandMicrophone {
    async fn open(&self) -> Result<Box<dyn AudioStream>, CaptureError> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => CaptureError::PermissionDenied(e.to_string()),
                _ => CaptureError::Unavailable(format!("{}: {}", self.command.program, e)),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Unavailable("recorder stdout not captured".into()))?;

        debug!(program = %self.command.program, pid = ?child.id(), "recorder started");
        Ok(Box::new(CommandStream {
            child: Some(child),
            stdout,
            buf: vec![0u8; self.fragment_bytes],
        }))
    }

    fn name(&self) -> &str {
        &self.command.program
    }
}

struct CommandStream {
    child: Option<Child>,
    stdout: ChildStdout,
    buf: Vec<u8>,
}

#[async_trait::async_trait]
impl AudioStream for CommandStream {
    async fn next_fragment(&mut self) -> Option<Result<Vec<u8>, CaptureError>> {
        match self.stdout.read(&mut self.buf).await {
            Ok(0) => {
                let status = self.child.as_mut().and_then(|c| c.try_wait().ok().flatten());
                match status {
                    Some(status) if !status.success() => Some(Err(CaptureError::StreamFailed(
                        format!("recorder exited with {status}"),
                    ))),
                    _ => None,
                }
            }
            Ok(n) => Some(Ok(self.buf[..n].to_vec())),
            Err(e) => Some(Err(CaptureError::StreamFailed(e.to_string()))),
        }
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                // Already exited.
                debug!(?e, "recorder kill skipped");
            }
            tokio::spawn(async move {
                if let Err(e) = child.wait().await {
                    warn!(?e, "failed to reap recorder");
                }
            });
        }
    }
}
