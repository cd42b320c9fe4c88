//! The message transport underneath a Wisp connection.
//!
//! The multiplexer only needs an ordered, message-oriented duplex channel
//! (typically a WebSocket): something that can send one binary message and
//! reports `open` / `message` / `close` / `error` events back. Outbound is the
//! `Transport` trait; inbound events are fed to the connection as
//! `TransportEvent` values.

pub mod channel;

use bytes::Bytes;

use crate::error::Result;

pub use channel::ChannelTransport;

/// Sending side of the underlying transport.
pub trait Transport: Send {
    /// Begin opening the transport towards `endpoint`. Completion is reported
    /// asynchronously with `TransportEvent::Open`.
    fn connect(&mut self, endpoint: &str) -> Result<()>;

    /// Send one complete binary message.
    fn send(&mut self, message: Bytes) -> Result<()>;

    /// Shut the transport down. Should eventually produce
    /// `TransportEvent::Close`.
    fn close(&mut self) -> Result<()>;
}

/// Events reported by the transport, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    /// One complete binary message.
    Message(Bytes),
    Close,
    Error(String),
}

impl TransportEvent {
    /// Whether this event ends the transport's life.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Close | TransportEvent::Error(_))
    }
}
