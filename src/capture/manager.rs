//! Capture session manager
//!
//! Owns the microphone for exactly one bounded recording at a time. A
//! recording ends at its hard deadline, on explicit stop, or when the device
//! ends the stream; in every case the stream is released before the
//! completion callback runs, and dropping the handle releases it too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// External microphone acquisition
#[async_trait::async_trait]
pub trait Microphone: Send + Sync {
    /// Acquire a live input stream. This is where permission is checked.
    async fn open(&self) -> Result<Box<dyn AudioStream>, CaptureError>;

    /// Device name for logging
    fn name(&self) -> &str;
}

/// A live microphone stream
#[async_trait::async_trait]
pub trait AudioStream: Send {
    /// Next encoded fragment, or `None` once the device ends the stream
    async fn next_fragment(&mut self) -> Option<Result<Vec<u8>, CaptureError>>;

    /// Stop the underlying tracks. Must be idempotent.
    fn release(&mut self);
}

/// Errors raised while acquiring or reading the microphone
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("microphone unavailable: {0}")]
    Unavailable(String),

    #[error("microphone stream failed: {0}")]
    StreamFailed(String),

    #[error("a recording is already in progress")]
    Busy,
}

/// Why a recording ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The fixed recording duration elapsed
    Deadline,
    /// Explicit stop requested
    Stopped,
    /// The device closed the stream
    EndOfStream,
}

/// Assembled audio of one recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedAudio {
    /// No fragment was captured
    Empty,
    /// Concatenation of every fragment, in arrival order
    Buffer { bytes: Vec<u8>, fragments: usize },
}

impl CapturedAudio {
    pub fn len(&self) -> usize {
        match self {
            CapturedAudio::Empty => 0,
            CapturedAudio::Buffer { bytes, .. } => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CapturedAudio::Empty)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            CapturedAudio::Empty => Vec::new(),
            CapturedAudio::Buffer { bytes, .. } => bytes,
        }
    }
}

/// Result delivered to the completion callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub audio: CapturedAudio,
    pub reason: StopReason,
    pub elapsed: Duration,
}

/// Completion callback, invoked at most once per recording
pub type OnComplete = Box<dyn FnOnce(Result<CaptureReport, CaptureError>) + Send>;

/// Starts recordings and enforces that only one is open at a time
pub struct CaptureManager {
    microphone: Arc<dyn Microphone>,
    active: Arc<AtomicBool>,
}

impl CaptureManager {
    pub fn new(microphone: Arc<dyn Microphone>) -> Self {
        Self {
            microphone,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while a recording holds (or is acquiring) the microphone
    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start a recording bounded by `max_duration`
    ///
    /// The deadline counts from the moment the stream is acquired. The
    /// callback receives the assembled audio, or the acquisition/stream
    /// error. Dropping the handle aborts the recording without a callback.
    pub fn begin(
        &self,
        max_duration: Duration,
        on_complete: OnComplete,
    ) -> Result<CaptureHandle, CaptureError> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::Busy);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let recording = Recording {
            microphone: Arc::clone(&self.microphone),
            max_duration,
            busy: BusyFlag(Arc::clone(&self.active)),
        };
        let task = tokio::spawn(recording.run(stop_rx, on_complete));

        Ok(CaptureHandle {
            stop_tx: Some(stop_tx),
            task,
        })
    }
}

/// Owned handle to the open recording
#[derive(Debug)]
pub struct CaptureHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    /// Ask the recording to finish early. The callback still fires.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Clears the manager's active flag when the recording goes away
struct BusyFlag(Arc<AtomicBool>);

impl Drop for BusyFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Releases the stream on every exit path, including task abort
struct StreamGuard(Option<Box<dyn AudioStream>>);

impl StreamGuard {
    fn release(&mut self) {
        if let Some(mut stream) = self.0.take() {
            stream.release();
            debug!("microphone stream released");
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.release();
    }
}

struct Recording {
    microphone: Arc<dyn Microphone>,
    max_duration: Duration,
    busy: BusyFlag,
}

impl Recording {
    async fn run(self, mut stop_rx: oneshot::Receiver<()>, on_complete: OnComplete) {
        let Recording {
            microphone,
            max_duration,
            busy,
        } = self;

        let stream = match microphone.open().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(?e, device = microphone.name(), "failed to acquire microphone");
                drop(busy);
                on_complete(Err(e));
                return;
            }
        };
        let mut guard = StreamGuard(Some(stream));
        let started_at = Instant::now();
        info!(
            device = microphone.name(),
            max_ms = max_duration.as_millis() as u64,
            "recording started"
        );

        let deadline = sleep(max_duration);
        tokio::pin!(deadline);
        let mut chunks: Vec<Vec<u8>> = Vec::new();

        let ended = loop {
            let Some(stream) = guard.0.as_mut() else {
                break Err(CaptureError::StreamFailed("stream released".into()));
            };
            tokio::select! {
                biased;
                _ = &mut stop_rx => break Ok(StopReason::Stopped),
                _ = &mut deadline => break Ok(StopReason::Deadline),
                fragment = stream.next_fragment() => match fragment {
                    Some(Ok(fragment)) if fragment.is_empty() => {}
                    Some(Ok(fragment)) => chunks.push(fragment),
                    Some(Err(e)) => break Err(e),
                    None => break Ok(StopReason::EndOfStream),
                },
            }
        };

        let result = ended.map(|reason| {
            let fragments = chunks.len();
            let audio = if fragments == 0 {
                CapturedAudio::Empty
            } else {
                CapturedAudio::Buffer {
                    bytes: chunks.concat(),
                    fragments,
                }
            };
            CaptureReport {
                audio,
                reason,
                elapsed: started_at.elapsed(),
            }
        });

        // Release before reporting so the controller never sees a finished
        // recording with a live microphone.
        guard.release();
        drop(busy);

        match &result {
            Ok(report) => info!(
                reason = ?report.reason,
                bytes = report.audio.len(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "recording finished"
            ),
            Err(e) => warn!(?e, "recording failed"),
        }
        on_complete(result);
    }
}
