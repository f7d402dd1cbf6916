//! IPC module for daemon to presentation-layer communication

mod protocol;
mod server;

pub use server::{Server, SessionLink};
