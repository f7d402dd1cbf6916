//! kiosk-daemon: Session controller for an unattended voice-query kiosk
//!
//! This daemon runs next to the kiosk's renderer and provides:
//! - Camera-based activation through a presence detection sidecar
//! - An explicit session state machine (attract, greeting, listening, answer)
//! - Bounded microphone recordings forwarded to a remote understanding service
//! - IPC server through which the renderer reports taps and receives directives

mod capture;
mod config;
mod dispatch;
mod events;
mod ipc;
mod lifecycle;
mod presence;
mod state;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::capture::{CaptureManager, CommandMicrophone};
use crate::config::Config;
use crate::dispatch::{Connection, QueryDispatcher};
use crate::events::Directive;
use crate::ipc::{Server, SessionLink};
use crate::lifecycle::ShutdownSignal;
use crate::presence::{ArmSwitch, DetectorAdapter, PollTimings, SidecarDetector};
use crate::state::{ControllerLinks, SessionController, SessionSnapshot};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "kiosk-daemon starting");

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        socket_path = ?config.socket_path,
        server_url = %config.server_url,
        lockout = ?config.timings.activation_lockout,
        "configuration loaded"
    );

    let mut shutdown = ShutdownSignal::new()?;

    // Detector, timers, recordings and the connection -> controller
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    // Controller -> IPC subscribers
    let (directive_tx, _directive_rx) = broadcast::channel::<Directive>(64);
    // Controller -> IPC status queries
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
    // Dispatcher -> connection
    let (outbound_tx, outbound_rx) = mpsc::channel(8);

    // Presence detection
    let (arm, arm_rx) = ArmSwitch::new();
    let poll = PollTimings {
        poll_interval: config.timings.poll_interval,
        arm_delay: config.timings.arm_delay,
        dwell_threshold: config.timings.dwell_threshold,
    };
    let detector = SidecarDetector::new(config.detector.clone());
    let detector_task =
        tokio::spawn(DetectorAdapter::new(detector, arm_rx, event_tx.clone(), poll).run());

    // Understanding service
    let connection = Connection::new(
        config.server_url.clone(),
        config.timings.reconnect_delay,
        outbound_rx,
        event_tx.clone(),
    );
    let connection_task = tokio::spawn(connection.run());

    // IPC server
    let server = Server::new(
        &config.socket_path,
        SessionLink {
            event_tx: event_tx.clone(),
            snapshot_rx,
            directive_tx: directive_tx.clone(),
        },
    )?;

    // Session controller
    let microphone = CommandMicrophone::new(config.microphone.clone());
    let mut controller = SessionController::new(
        config.timings,
        config.language.clone(),
        ControllerLinks {
            arm,
            capture: CaptureManager::new(Arc::new(microphone)),
            dispatcher: QueryDispatcher::new(outbound_tx, config.timings.reply_timeout),
            event_tx,
            directive_tx,
            snapshot_tx,
        },
    );

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        _ = controller.run(event_rx) => {
            info!("session controller exited");
        }

        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    controller.shutdown();
    detector_task.abort();
    connection_task.abort();
    server.shutdown().await;

    info!("kiosk-daemon stopped");

    Ok(())
}
