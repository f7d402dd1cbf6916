//! Unix domain socket server for IPC
//!
//! Provides request-response communication for the presentation layer and
//! pushes directives to subscribed clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::events::{Directive, SessionEvent};
use crate::state::SessionSnapshot;

use super::protocol::{KioskStatus, Notification, Request, Response};

const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Endpoints of the session the server talks to
#[derive(Clone)]
pub struct SessionLink {
    pub event_tx: mpsc::UnboundedSender<SessionEvent>,
    pub snapshot_rx: watch::Receiver<SessionSnapshot>,
    pub directive_tx: broadcast::Sender<Directive>,
}

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
}

struct Shared {
    session: SessionLink,
    start_time: Instant,
}

impl Server {
    /// Create a new IPC server
    pub fn new(socket_path: &Path, session: SessionLink) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
            shared: Arc::new(Shared {
                session,
                start_time: Instant::now(),
            }),
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let shared = Arc::clone(&self.shared);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, shared) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(stream: UnixStream, shared: Arc<Shared>) -> Result<()> {
        let (reader, writer) = stream.into_split();
        let (request_tx, request_rx) = mpsc::channel(8);

        // Reads are not cancellation safe, so they live in their own task.
        let reader_task = tokio::spawn(Self::read_requests(reader, request_tx));
        let result = Self::serve_client(writer, request_rx, &shared).await;
        reader_task.abort();
        result
    }

    /// Read length-prefixed requests until the client goes away
    async fn read_requests(
        mut reader: OwnedReadHalf,
        request_tx: mpsc::Sender<Result<Request, String>>,
    ) -> Result<()> {
        let mut len_buf = [0u8; 4];

        loop {
            // Read message length (4-byte little-endian)
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_MESSAGE_LEN {
                warn!(len, "message too large, disconnecting");
                return Ok(());
            }

            let mut msg_buf = vec![0u8; len];
            reader.read_exact(&mut msg_buf).await?;

            let request = serde_json::from_slice(&msg_buf).map_err(|e| e.to_string());
            if request_tx.send(request).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn serve_client(
        mut writer: OwnedWriteHalf,
        mut request_rx: mpsc::Receiver<Result<Request, String>>,
        shared: &Shared,
    ) -> Result<()> {
        let mut directives: Option<broadcast::Receiver<Directive>> = None;

        loop {
            tokio::select! {
                request = request_rx.recv() => {
                    let Some(request) = request else {
                        return Ok(());
                    };
                    let response = match request {
                        Ok(request) => {
                            debug!(?request, "received request");
                            if request == Request::Subscribe && directives.is_none() {
                                directives = Some(shared.session.directive_tx.subscribe());
                                debug!("client subscribed to directives");
                            }
                            Self::process_request(request, shared).await
                        }
                        Err(e) => {
                            warn!(error = %e, "malformed request");
                            Response::error("bad_request", e)
                        }
                    };
                    Self::send_message(&mut writer, &response).await?;
                }
                directive = next_directive(&mut directives) => match directive {
                    Ok(directive) => {
                        Self::send_message(&mut writer, &Notification::Directive { directive }).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "directive subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        directives = None;
                    }
                },
            }
        }
    }

    /// Send a length-prefixed JSON message
    async fn send_message<T: serde::Serialize>(writer: &mut OwnedWriteHalf, msg: &T) -> Result<()> {
        let msg_bytes = serde_json::to_vec(msg)?;
        let msg_len = (msg_bytes.len() as u32).to_le_bytes();

        writer.write_all(&msg_len).await?;
        writer.write_all(&msg_bytes).await?;

        Ok(())
    }

    /// Process a request and return a response
    async fn process_request(request: Request, shared: &Shared) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => {
                let snapshot = *shared.session.snapshot_rx.borrow();
                let uptime_secs = shared.start_time.elapsed().as_secs();
                Response::Status(KioskStatus::new(snapshot, uptime_secs))
            }

            Request::Subscribe => Response::Subscribed,

            Request::Tap { control } => {
                info!(?control, "tap received");
                Self::forward(shared, SessionEvent::Tap(control))
            }

            Request::ClipFinished { clip } => {
                debug!(?clip, "clip finished");
                Self::forward(shared, SessionEvent::ClipFinished(clip))
            }

            Request::SubmitFile { path } => match tokio::fs::read(&path).await {
                Ok(audio) => {
                    info!(?path, bytes = audio.len(), "audio file supplied");
                    Self::forward(shared, SessionEvent::FileSupplied(audio))
                }
                Err(e) => {
                    warn!(?path, ?e, "failed to read audio file");
                    Response::error("read_failed", format!("{}: {}", path.display(), e))
                }
            },
        }
    }

    fn forward(shared: &Shared, event: SessionEvent) -> Response {
        match shared.session.event_tx.send(event) {
            Ok(()) => Response::Accepted,
            Err(_) => Response::error("unavailable", "session controller has stopped"),
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

async fn next_directive(
    directives: &mut Option<broadcast::Receiver<Directive>>,
) -> Result<Directive, broadcast::error::RecvError> {
    match directives {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
