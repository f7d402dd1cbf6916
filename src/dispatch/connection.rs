//! Persistent WebSocket connection to the understanding service
//!
//! Runs as its own task. Outbound frames arrive on a channel; everything
//! that happens on the socket is reported to the controller queue as a
//! [`TransportEvent`]. Lost connections are retried after a fixed delay.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::protocol::{InboundEvent, OutboundEvent};
use crate::events::SessionEvent;

/// Connection-level happenings delivered to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Inbound(InboundEvent),
}

enum Ended {
    Lost(String),
    Shutdown,
}

pub struct Connection {
    url: String,
    reconnect_delay: Duration,
    outbound_rx: mpsc::Receiver<OutboundEvent>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Connection {
    pub fn new(
        url: impl Into<String>,
        reconnect_delay: Duration,
        outbound_rx: mpsc::Receiver<OutboundEvent>,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
            outbound_rx,
            event_tx,
        }
    }

    /// Connect, serve, and reconnect until the dispatcher or controller goes away
    pub async fn run(mut self) {
        let mut attempts: u32 = 0;

        loop {
            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((socket, _response)) => {
                    attempts = 0;
                    info!(url = %self.url, "connected to understanding service");
                    if !self.report(TransportEvent::Connected) {
                        return;
                    }

                    match self.serve(socket).await {
                        Ended::Shutdown => return,
                        Ended::Lost(reason) => {
                            warn!(%reason, "connection to understanding service lost");
                            if !self.report(TransportEvent::Disconnected { reason }) {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    attempts += 1;
                    if attempts == 1 {
                        warn!(url = %self.url, error = %e, "cannot reach understanding service");
                    } else {
                        debug!(attempts, error = %e, "reconnect attempt failed");
                    }
                }
            }

            // Requests queued while offline have already been failed.
            while let Ok(frame) = self.outbound_rx.try_recv() {
                debug!(?frame, "dropping frame queued while disconnected");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = self.event_tx.closed() => return,
            }
        }
    }

    fn report(&self, event: TransportEvent) -> bool {
        self.event_tx.send(SessionEvent::Transport(event)).is_ok()
    }

    async fn serve<S>(&mut self, socket: S) -> Ended
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    {
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                frame = self.outbound_rx.recv() => {
                    let Some(frame) = frame else {
                        let _ = sink.close().await;
                        return Ended::Shutdown;
                    };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(?e, "failed to encode outbound frame");
                            continue;
                        }
                    };
                    debug!(bytes = text.len(), "sending process_audio");
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        return Ended::Lost(e.to_string());
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundEvent>(&text) {
                            Ok(event) => {
                                if !self.report(TransportEvent::Inbound(event)) {
                                    return Ended::Shutdown;
                                }
                            }
                            Err(e) => warn!(error = %e, "ignoring unrecognized frame"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return Ended::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(_))) => return Ended::Lost("closed by server".into()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ended::Lost(e.to_string()),
                    None => return Ended::Lost("stream ended".into()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::dispatch::protocol::{RecognitionRequest, ReplyText};

    async fn expect_transport(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> TransportEvent {
        match rx.recv().await {
            Some(SessionEvent::Transport(event)) => event,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_round_trip_then_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        // Minimal service: answer one process_audio, then hang up.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let frame = loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => break text,
                    _ => continue,
                }
            };
            let request: OutboundEvent = serde_json::from_str(&frame).unwrap();
            let reply = InboundEvent::Response(ReplyText::new("Pharmacy is on the left", ""));
            ws.send(Message::Text(serde_json::to_string(&reply).unwrap()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
            request
        });

        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(url, Duration::from_secs(60), outbound_rx, event_tx);
        let task = tokio::spawn(connection.run());

        assert_eq!(expect_transport(&mut event_rx).await, TransportEvent::Connected);

        let request = RecognitionRequest {
            audio: vec![9, 8, 7],
            language: "en".into(),
        };
        outbound_tx.send(request.clone().into()).await.unwrap();

        assert_eq!(
            expect_transport(&mut event_rx).await,
            TransportEvent::Inbound(InboundEvent::Response(ReplyText::new(
                "Pharmacy is on the left",
                ""
            )))
        );
        assert!(matches!(
            expect_transport(&mut event_rx).await,
            TransportEvent::Disconnected { .. }
        ));
        assert_eq!(server.await.unwrap(), OutboundEvent::from(request));

        task.abort();
    }
}
