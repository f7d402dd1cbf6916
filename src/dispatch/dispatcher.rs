//! Query dispatcher
//!
//! Sends one request per session over the shared connection and correlates
//! replies back to the session generation that asked. The service replies
//! in submission order, so correlation is first-in, first-out. Requests of
//! a reset session stay in the queue as abandoned so that their late reply
//! is consumed and dropped instead of being credited to a newer session.
//! The service does not answer every request, so an abandoned slot is only
//! kept for one reply window, and a request whose reply timed out gives its
//! slot up immediately.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::TransportEvent;
use super::protocol::{
    InboundEvent, OutboundEvent, RecognitionOutcome, RecognitionRequest, ReplyText,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("request for session {0} is still outstanding")]
    Busy(u64),

    #[error("not connected to the understanding service")]
    NotConnected,

    #[error("transport queue is full")]
    QueueFull,

    #[error("transport task has stopped")]
    ChannelClosed,
}

/// An outcome attributed to the session that submitted the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlated {
    pub generation: u64,
    pub outcome: RecognitionOutcome,
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    abandoned: bool,
    submitted_at: Instant,
}

pub struct QueryDispatcher {
    outbound: mpsc::Sender<OutboundEvent>,
    connected: bool,
    in_flight: VecDeque<InFlight>,
    /// How long an abandoned request keeps its slot for a late reply
    reply_window: Duration,
}

impl QueryDispatcher {
    pub fn new(outbound: mpsc::Sender<OutboundEvent>, reply_window: Duration) -> Self {
        Self {
            outbound,
            connected: false,
            in_flight: VecDeque::new(),
            reply_window,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Requests whose reply has not arrived yet, abandoned ones included
    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// True if `generation` has a live (not abandoned) request
    #[cfg(test)]
    pub fn is_pending(&self, generation: u64) -> bool {
        self.in_flight
            .iter()
            .any(|f| f.generation == generation && !f.abandoned)
    }

    /// Send one request on behalf of `generation`
    pub fn submit(
        &mut self,
        generation: u64,
        request: RecognitionRequest,
    ) -> Result<(), DispatchError> {
        self.purge_expired(Instant::now());
        if let Some(live) = self.in_flight.iter().find(|f| !f.abandoned) {
            return Err(DispatchError::Busy(live.generation));
        }
        if !self.connected {
            return Err(DispatchError::NotConnected);
        }

        let bytes = request.audio.len();
        self.outbound
            .try_send(request.into())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DispatchError::ChannelClosed,
            })?;

        self.in_flight.push_back(InFlight {
            generation,
            abandoned: false,
            submitted_at: Instant::now(),
        });
        info!(generation, bytes, "process_audio submitted");
        Ok(())
    }

    /// Give up on the request of `generation`; its reply will be discarded
    pub fn abandon(&mut self, generation: u64) -> bool {
        let mut found = false;
        for entry in self
            .in_flight
            .iter_mut()
            .filter(|f| f.generation == generation && !f.abandoned)
        {
            entry.abandoned = true;
            found = true;
        }
        if found {
            debug!(generation, "request abandoned");
        }
        found
    }

    /// Drop the request of `generation` whose reply never came. A reply
    /// arriving after this is treated as unsolicited.
    pub fn expire(&mut self, generation: u64) -> bool {
        let before = self.in_flight.len();
        self.in_flight
            .retain(|f| f.generation != generation || f.abandoned);
        let expired = self.in_flight.len() < before;
        if expired {
            debug!(generation, "request expired without reply");
        }
        expired
    }

    /// Forget abandoned requests that have been silent for a whole reply window
    fn purge_expired(&mut self, now: Instant) {
        let window = self.reply_window;
        let before = self.in_flight.len();
        self.in_flight.retain(|f| {
            !(f.abandoned && now.saturating_duration_since(f.submitted_at) >= window)
        });
        let purged = before - self.in_flight.len();
        if purged > 0 {
            info!(purged, "dropped abandoned requests that never got a reply");
        }
    }

    /// Fold a transport event into zero or more correlated outcomes
    pub fn on_transport(&mut self, event: TransportEvent) -> Vec<Correlated> {
        match event {
            TransportEvent::Connected => {
                self.connected = true;
                Vec::new()
            }
            TransportEvent::Disconnected { reason } => {
                self.connected = false;
                let failed: Vec<Correlated> = self
                    .in_flight
                    .drain(..)
                    .filter(|f| !f.abandoned)
                    .map(|f| Correlated {
                        generation: f.generation,
                        outcome: RecognitionOutcome::Fallback(ReplyText::connection_lost()),
                    })
                    .collect();
                if !failed.is_empty() {
                    warn!(%reason, failed = failed.len(), "in-flight requests failed by disconnect");
                }
                failed
            }
            TransportEvent::Inbound(event) => {
                self.purge_expired(Instant::now());
                self.correlate(event)
            }
        }
    }

    fn correlate(&mut self, event: InboundEvent) -> Vec<Correlated> {
        match self.in_flight.pop_front() {
            Some(entry) if entry.abandoned => {
                info!(
                    generation = entry.generation,
                    "discarding late reply for abandoned request"
                );
                Vec::new()
            }
            Some(entry) => {
                debug!(
                    generation = entry.generation,
                    latency_ms = entry.submitted_at.elapsed().as_millis() as u64,
                    "reply correlated"
                );
                vec![Correlated {
                    generation: entry.generation,
                    outcome: event.into(),
                }]
            }
            None => {
                warn!(?event, "reply with no outstanding request, ignoring");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(30);

    fn request() -> RecognitionRequest {
        RecognitionRequest {
            audio: vec![1, 2, 3, 4],
            language: "en".into(),
        }
    }

    fn answer(text: &str) -> TransportEvent {
        TransportEvent::Inbound(InboundEvent::Response(ReplyText::new(text, "")))
    }

    fn connected() -> (QueryDispatcher, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(4);
        let mut dispatcher = QueryDispatcher::new(tx, WINDOW);
        dispatcher.on_transport(TransportEvent::Connected);
        (dispatcher, rx)
    }

    #[tokio::test]
    async fn test_submit_sends_one_frame() {
        let (mut dispatcher, mut rx) = connected();
        dispatcher.submit(1, request()).unwrap();

        assert_eq!(rx.recv().await.unwrap(), OutboundEvent::from(request()));
        assert!(dispatcher.is_pending(1));
        assert_eq!(dispatcher.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_reply_correlates_to_submitter() {
        let (mut dispatcher, _rx) = connected();
        dispatcher.submit(7, request()).unwrap();

        let outcomes = dispatcher.on_transport(answer("Gate B"));
        assert_eq!(
            outcomes,
            vec![Correlated {
                generation: 7,
                outcome: RecognitionOutcome::Answer(ReplyText::new("Gate B", "")),
            }]
        );
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_submission_is_rejected() {
        let (mut dispatcher, _rx) = connected();
        dispatcher.submit(1, request()).unwrap();
        assert_eq!(dispatcher.submit(1, request()), Err(DispatchError::Busy(1)));
    }

    #[tokio::test]
    async fn test_submit_while_disconnected() {
        let (tx, _rx) = mpsc::channel(4);
        let mut dispatcher = QueryDispatcher::new(tx, WINDOW);
        assert_eq!(dispatcher.submit(1, request()), Err(DispatchError::NotConnected));
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_after_abandon_is_discarded() {
        let (mut dispatcher, _rx) = connected();
        dispatcher.submit(1, request()).unwrap();
        assert!(dispatcher.abandon(1));

        // A new session may submit while the old reply is still on its way.
        dispatcher.submit(2, request()).unwrap();

        assert!(dispatcher.on_transport(answer("stale")).is_empty());
        let outcomes = dispatcher.on_transport(answer("fresh"));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].generation, 2);
        assert_eq!(
            outcomes[0].outcome,
            RecognitionOutcome::Answer(ReplyText::new("fresh", ""))
        );
    }

    #[tokio::test]
    async fn test_disconnect_fails_live_requests_only() {
        let (mut dispatcher, _rx) = connected();
        dispatcher.submit(1, request()).unwrap();
        dispatcher.abandon(1);
        dispatcher.submit(2, request()).unwrap();

        let outcomes = dispatcher.on_transport(TransportEvent::Disconnected {
            reason: "reset by peer".into(),
        });
        assert_eq!(
            outcomes,
            vec![Correlated {
                generation: 2,
                outcome: RecognitionOutcome::Fallback(ReplyText::connection_lost()),
            }]
        );
        assert!(!dispatcher.is_connected());
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_reply_is_ignored() {
        let (mut dispatcher, _rx) = connected();
        assert!(dispatcher.on_transport(answer("nobody asked")).is_empty());
    }

    #[tokio::test]
    async fn test_expired_request_frees_its_slot() {
        let (mut dispatcher, _rx) = connected();
        dispatcher.submit(1, request()).unwrap();
        assert!(dispatcher.expire(1));
        assert!(!dispatcher.expire(1));
        assert_eq!(dispatcher.outstanding(), 0);

        // The next session's reply is not swallowed by the silent request.
        dispatcher.submit(2, request()).unwrap();
        let outcomes = dispatcher.on_transport(answer("answer for visitor two"));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].generation, 2);
    }

    #[tokio::test]
    async fn test_expire_leaves_abandoned_requests_alone() {
        let (mut dispatcher, _rx) = connected();
        dispatcher.submit(1, request()).unwrap();
        dispatcher.abandon(1);
        assert!(!dispatcher.expire(1));
        assert_eq!(dispatcher.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_slot_is_dropped_after_reply_window() {
        let (mut dispatcher, _rx) = connected();
        dispatcher.submit(1, request()).unwrap();
        dispatcher.abandon(1);

        tokio::time::advance(WINDOW).await;
        dispatcher.submit(2, request()).unwrap();
        assert_eq!(dispatcher.outstanding(), 1);

        let outcomes = dispatcher.on_transport(answer("fresh"));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_slot_within_window_absorbs_one_reply() {
        let (mut dispatcher, _rx) = connected();
        dispatcher.submit(1, request()).unwrap();
        dispatcher.abandon(1);

        tokio::time::advance(Duration::from_secs(5)).await;
        dispatcher.submit(2, request()).unwrap();
        assert_eq!(dispatcher.outstanding(), 2);

        tokio::time::advance(WINDOW).await;
        // The abandoned request has been silent for longer than the window.
        let outcomes = dispatcher.on_transport(answer("fresh"));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].generation, 2);
    }

    #[tokio::test]
    async fn test_closed_transport() {
        let (tx, rx) = mpsc::channel(4);
        let mut dispatcher = QueryDispatcher::new(tx, WINDOW);
        dispatcher.on_transport(TransportEvent::Connected);
        drop(rx);
        assert_eq!(dispatcher.submit(1, request()), Err(DispatchError::ChannelClosed));
    }
}
