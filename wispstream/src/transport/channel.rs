//! In-memory transport backed by a tokio channel.
//!
//! Every outbound message is pushed onto an unbounded mpsc channel. The
//! receiving half is handed to whatever actually owns the socket (or to a
//! test, which inspects the frames directly).

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Result, WispError};
use crate::transport::Transport;

pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    endpoint: Option<String>,
    closed: bool,
}

impl ChannelTransport {
    /// Create a transport and the receiver its outbound messages land on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                endpoint: None,
                closed: false,
            },
            rx,
        )
    }

    /// The endpoint passed to `connect`, if it has been called.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

impl Transport for ChannelTransport {
    fn connect(&mut self, endpoint: &str) -> Result<()> {
        tracing::debug!(endpoint, "channel transport connecting");
        self.endpoint = Some(endpoint.to_owned());
        Ok(())
    }

    fn send(&mut self, message: Bytes) -> Result<()> {
        if self.closed {
            return Err(WispError::Transport("channel transport closed".into()));
        }
        self.tx
            .send(message)
            .map_err(|_| WispError::Transport("outbound receiver dropped".into()))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
