//! Configuration loading and management
//!
//! Every value is a static constant for the lifetime of the daemon. Defaults
//! match the kiosk as deployed; each can be overridden through a `KIOSK_*`
//! environment variable (durations in milliseconds).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::presence::PresencePredicate;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for the presentation layer
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// WebSocket endpoint of the understanding service
    pub server_url: String,

    /// Language tag attached to every `process_audio` request
    pub language: String,

    /// Session timing constants
    pub timings: Timings,

    /// External presence detection process
    pub detector: DetectorCommand,

    /// External recorder process
    pub microphone: MicrophoneCommand,
}

/// Timing constants shared by the controller and its collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Fixed length of one voice recording
    pub recording_duration: Duration,
    /// Sustained presence required before activation
    pub dwell_threshold: Duration,
    /// Grace delay between camera start and the first poll
    pub arm_delay: Duration,
    /// Presence polling cadence
    pub poll_interval: Duration,
    /// Return to Idle if nobody taps while activating/greeting.
    /// `None` selects the scripted variant without a lockout.
    pub activation_lockout: Option<Duration>,
    /// Longest wait for a reply before the request is abandoned
    pub reply_timeout: Duration,
    /// Pause between reconnection attempts to the service
    pub reconnect_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            recording_duration: Duration::from_millis(5000),
            dwell_threshold: Duration::from_millis(1200),
            arm_delay: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(100),
            activation_lockout: Some(Duration::from_secs(15)),
            reply_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Command line of the presence detection sidecar
#[derive(Debug, Clone)]
pub struct DetectorCommand {
    pub program: String,
    pub args: Vec<String>,
    pub predicate: PresencePredicate,
    /// Minimum landmark confidence counted as presence
    pub confidence_threshold: f32,
}

/// Command line of the recorder process (audio on stdout)
#[derive(Debug, Clone)]
pub struct MicrophoneCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for MicrophoneCommand {
    fn default() -> Self {
        Self {
            program: "arecord".to_string(),
            args: ["-q", "-f", "S16_LE", "-r", "16000", "-c", "1", "-t", "wav", "-"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("kiosk");

        let socket_path = env_string("KIOSK_SOCKET_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("kiosk.sock"));

        let defaults = Timings::default();
        let lockout_ms = env_millis("KIOSK_ACTIVATION_LOCKOUT_MS")?;
        let timings = Timings {
            recording_duration: env_millis("KIOSK_RECORDING_MS")?
                .unwrap_or(defaults.recording_duration),
            dwell_threshold: env_millis("KIOSK_DWELL_MS")?.unwrap_or(defaults.dwell_threshold),
            arm_delay: env_millis("KIOSK_ARM_DELAY_MS")?.unwrap_or(defaults.arm_delay),
            poll_interval: env_millis("KIOSK_POLL_MS")?.unwrap_or(defaults.poll_interval),
            activation_lockout: match lockout_ms {
                Some(d) if d.is_zero() => None,
                Some(d) => Some(d),
                None => defaults.activation_lockout,
            },
            reply_timeout: env_millis("KIOSK_REPLY_TIMEOUT_MS")?.unwrap_or(defaults.reply_timeout),
            reconnect_delay: env_millis("KIOSK_RECONNECT_MS")?
                .unwrap_or(defaults.reconnect_delay),
        };

        let predicate = match env_string("KIOSK_PRESENCE_PREDICATE") {
            Some(name) => name.parse()?,
            None => PresencePredicate::HandOnly,
        };
        let confidence_threshold = match env_string("KIOSK_PRESENCE_CONFIDENCE") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid KIOSK_PRESENCE_CONFIDENCE: {raw}"))?,
            None => 0.9,
        };
        let detector = DetectorCommand {
            program: env_string("KIOSK_DETECTOR_CMD").unwrap_or_else(|| "kiosk-presence".into()),
            args: env_args("KIOSK_DETECTOR_ARGS"),
            predicate,
            confidence_threshold,
        };

        let microphone = match env_string("KIOSK_RECORDER_CMD") {
            Some(program) => MicrophoneCommand {
                program,
                args: env_args("KIOSK_RECORDER_ARGS"),
            },
            None => MicrophoneCommand::default(),
        };

        Ok(Self {
            socket_path,
            data_dir,
            server_url: env_string("KIOSK_SERVER_URL")
                .unwrap_or_else(|| "ws://localhost:5001/ws".to_string()),
            language: env_string("KIOSK_LANGUAGE").unwrap_or_else(|| "en".to_string()),
            timings,
            detector,
            microphone,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_args(name: &str) -> Vec<String> {
    env_string(name)
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    env_string(name)
        .map(|raw| parse_millis(&raw).with_context(|| format!("invalid {name}: {raw}")))
        .transpose()
}

fn parse_millis(raw: &str) -> Result<Duration> {
    let ms: u64 = raw.trim().parse()?;
    Ok(Duration::from_millis(ms))
}
