//! Individual stream state and operations.
//!
//! A stream is created open and stays open until a close is processed, after
//! which every send fails. Outbound DATA goes through the stream's
//! `FlowController`: TCP sends beyond the granted credit are buffered in an
//! outbound queue and released, in order, when the next CONTINUE arrives.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Result, WispError};
use crate::flow_control::{Credit, FlowController};
use crate::packet::{CloseReason, ConnectPayload, Packet, StreamType};

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Open => write!(f, "Open"),
            StreamState::Closed => write!(f, "Closed"),
        }
    }
}

/// Notifications delivered to whoever holds the stream's event receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Payload of an inbound DATA packet.
    Message(Bytes),
    /// The stream closed with this reason. Always the last event.
    Close(CloseReason),
}

/// A single multiplexed stream.
pub struct Stream {
    id: u32,
    hostname: String,
    port: u16,
    stream_type: StreamType,
    state: StreamState,
    flow: FlowController,
    /// Payloads waiting for credit, oldest first.
    outbound_queue: VecDeque<Bytes>,
    /// Packets produced by operations on this stream, not yet handed to the
    /// transport.
    pending_packets: Vec<Packet>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl Stream {
    /// Create a new open stream and queue its CONNECT packet.
    pub fn new(
        id: u32,
        info: ConnectPayload,
        credit: Credit,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        let connect = Packet::connect(id, &info);
        Self {
            id,
            hostname: info.hostname,
            port: info.port,
            stream_type: info.stream_type,
            state: StreamState::Open,
            flow: FlowController::new(info.stream_type, credit),
            outbound_queue: VecDeque::new(),
            pending_packets: vec![connect],
            events,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn credit(&self) -> Credit {
        self.flow.credit()
    }

    /// Number of payloads waiting for credit.
    pub fn queued_len(&self) -> usize {
        self.outbound_queue.len()
    }

    /// Send `data`, or buffer it if the stream has run out of credit.
    pub fn send(&mut self, data: Bytes) -> Result<()> {
        if self.state == StreamState::Closed {
            return Err(WispError::StreamClosed(self.id));
        }
        if self.outbound_queue.is_empty() && self.flow.can_send() {
            self.transmit(data);
        } else {
            tracing::trace!(
                stream_id = self.id,
                payload_len = data.len(),
                queued = self.outbound_queue.len() + 1,
                "out of credit, queueing"
            );
            self.outbound_queue.push_back(data);
        }
        Ok(())
    }

    /// Apply a CONTINUE from the peer and release as much of the queue as the
    /// new credit allows.
    pub fn continue_received(&mut self, credit: u32) {
        self.flow.grant(credit);
        while self.flow.can_send() {
            let Some(data) = self.outbound_queue.pop_front() else {
                break;
            };
            self.transmit(data);
        }
        tracing::trace!(
            stream_id = self.id,
            credit = %self.flow.credit(),
            still_queued = self.outbound_queue.len(),
            "credit updated"
        );
    }

    fn transmit(&mut self, data: Bytes) {
        self.pending_packets.push(Packet::data(self.id, data));
        self.flow.on_sent();
    }

    /// Hand an inbound DATA payload to the application.
    pub fn deliver(&mut self, payload: Bytes) {
        if self.events.send(StreamEvent::Message(payload)).is_err() {
            tracing::trace!(stream_id = self.id, "message dropped: no receiver");
        }
    }

    /// Close the stream, sending CLOSE to the peer.
    ///
    /// Returns `false` if the stream was already closed, in which case
    /// nothing is sent and no event fires.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.state == StreamState::Closed {
            return false;
        }
        self.pending_packets.push(Packet::close(self.id, reason));
        self.state = StreamState::Closed;
        self.outbound_queue.clear();
        if self.events.send(StreamEvent::Close(reason)).is_err() {
            tracing::trace!(stream_id = self.id, "close notification dropped: no receiver");
        }
        true
    }

    /// Take every packet produced since the last drain.
    pub fn drain_packets(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.pending_packets)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("stream_type", &self.stream_type)
            .field("state", &self.state)
            .field("credit", &self.flow.credit())
            .field("queued", &self.outbound_queue.len())
            .finish()
    }
}
