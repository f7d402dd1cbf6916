//! Dispatch module: requests to the remote understanding service

mod connection;
mod dispatcher;
mod protocol;

pub use connection::{Connection, TransportEvent};
pub use dispatcher::QueryDispatcher;
pub use protocol::{RecognitionOutcome, RecognitionRequest, ReplyText};

#[cfg(test)]
pub(crate) use protocol::{InboundEvent, OutboundEvent};
