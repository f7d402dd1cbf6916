//! Presence detection through an external sidecar process
//!
//! The sidecar owns the camera and the detection model. It speaks
//! line-delimited JSON on stdin/stdout, one reply per request:
//!
//! ```text
//! > {"cmd":"load"}            < {"ok":true}
//! > {"cmd":"open_camera"}     < {"ok":false,"error":"permission denied"}
//! > {"cmd":"sample"}          < {"ok":true,"observation":{"hand":{"confidence":0.97,"x":0.52}}}
//! > {"cmd":"release_camera"}  < {"ok":true}
//! ```

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::detector::{DetectorError, PresenceDetector};
use super::sample::{Observation, PresenceSample};
use crate::config::DetectorCommand;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum SidecarRequest {
    Load,
    OpenCamera,
    Sample,
    ReleaseCamera,
}

#[derive(Debug, Deserialize)]
struct SidecarReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    observation: Option<Observation>,
}

impl SidecarReply {
    fn error_message(&self) -> String {
        self.error.clone().unwrap_or_else(|| "unspecified".to_string())
    }
}

/// [`PresenceDetector`] backed by a child process
pub struct SidecarDetector {
    command: DetectorCommand,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    camera_open: bool,
}

impl SidecarDetector {
    pub fn new(command: DetectorCommand) -> Self {
        Self {
            command,
            child: None,
            stdin: None,
            stdout: None,
            camera_open: false,
        }
    }

    /// Send one request and wait for its reply line
    async fn request(&mut self, request: SidecarRequest) -> Result<SidecarReply, String> {
        let (stdin, stdout) = match (self.stdin.as_mut(), self.stdout.as_mut()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err("sidecar not running".to_string()),
        };

        let mut line = serde_json::to_vec(&request).map_err(|e| e.to_string())?;
        line.push(b'\n');
        stdin.write_all(&line).await.map_err(|e| e.to_string())?;
        stdin.flush().await.map_err(|e| e.to_string())?;

        let reply = stdout
            .next_line()
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "sidecar exited".to_string())?;

        debug!(?request, reply = %reply, "sidecar reply");
        serde_json::from_str(&reply).map_err(|e| format!("malformed sidecar reply: {e}"))
    }
}

#[async_trait::async_trait]
impl PresenceDetector for SidecarDetector {
    async fn load(&mut self) -> Result<(), DetectorError> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DetectorError::Load(format!("{}: {}", self.command.program, e)))?;

        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        self.child = Some(child);

        let reply = self.request(SidecarRequest::Load).await.map_err(DetectorError::Load)?;
        if !reply.ok {
            return Err(DetectorError::Load(reply.error_message()));
        }

        info!(program = %self.command.program, "detection sidecar ready");
        Ok(())
    }

    async fn open_camera(&mut self) -> Result<(), DetectorError> {
        let reply = self
            .request(SidecarRequest::OpenCamera)
            .await
            .map_err(DetectorError::CameraLost)?;
        if !reply.ok {
            return Err(DetectorError::CameraDenied(reply.error_message()));
        }
        self.camera_open = true;
        Ok(())
    }

    async fn poll(&mut self) -> Result<PresenceSample, DetectorError> {
        let reply = self
            .request(SidecarRequest::Sample)
            .await
            .map_err(DetectorError::CameraLost)?;
        if !reply.ok {
            return Err(DetectorError::Poll(reply.error_message()));
        }

        let observation = reply.observation.unwrap_or_default();
        Ok(self
            .command
            .predicate
            .evaluate(&observation, self.command.confidence_threshold))
    }

    async fn release_camera(&mut self) {
        if !self.camera_open {
            return;
        }
        self.camera_open = false;
        match self.request(SidecarRequest::ReleaseCamera).await {
            Ok(reply) if reply.ok => debug!("camera released"),
            Ok(reply) => warn!(error = %reply.error_message(), "sidecar failed to release camera"),
            Err(e) => warn!(error = %e, "sidecar failed to release camera"),
        }
    }

    fn name(&self) -> &str {
        &self.command.program
    }
}
