//! Connection state machine.
//!
//! Manages the lifecycle of a Wisp connection:
//! Connecting -> Open -> Closed.
//!
//! The connection is unusable for data until the server's first CONTINUE on
//! stream 0 announces the default per-stream credit. Transport close or error
//! tears everything down: each open stream is closed with `NetworkError` and
//! a connection-level event is broadcast. There is no reconnect.
//!
//! All state lives behind one mutex so inbound events and caller operations
//! are applied one at a time. `StreamHandle` refers back to its stream by id
//! through the same shared state rather than owning anything.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::{Result, WispError};
use crate::flow_control::Credit;
use crate::mux::{Multiplexer, StreamId};
use crate::packet::{self, CloseReason, Packet, PacketType, StreamType, CONTROL_STREAM_ID};
use crate::stream::StreamEvent;
use crate::transport::{Transport, TransportEvent};

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport opening or waiting for the server's initial CONTINUE.
    Connecting,
    /// Handshake complete.
    Open,
    /// Transport gone. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Connection-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed. Fires once per connection.
    Open,
    /// The transport closed.
    Close,
    /// The transport failed, or the server broke the protocol.
    Error(String),
}

/// Configuration for a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transport endpoint, e.g. `wss://example.com/wisp/`. Must end in `/`.
    pub endpoint: String,
    /// Buffer size of the connection event broadcast channel.
    pub event_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.endpoint.ends_with('/') {
            return Err(WispError::Configuration(format!(
                "wisp endpoint must end with '/': {:?}",
                self.endpoint
            )));
        }
        if self.event_capacity == 0 {
            return Err(WispError::Configuration(
                "event_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            event_capacity: 64,
        }
    }
}

struct Shared {
    state: ConnectionState,
    /// Default credit for new streams, from the server's stream-0 CONTINUE.
    max_buffer_size: Option<u32>,
    mux: Multiplexer,
    transport: Box<dyn Transport>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    /// Hand every queued packet to the transport, in order.
    ///
    /// Stops at the first failed send; that packet and everything after it
    /// stay queued for the next flush.
    fn flush(&mut self) -> Result<()> {
        let mut packets = self.mux.drain_packets().into_iter();
        while let Some(packet) = packets.next() {
            tracing::trace!(%packet, "transmit");
            if let Err(e) = self.transport.send(packet.encode()) {
                tracing::warn!(
                    error = %e,
                    %packet,
                    unsent = packets.len() + 1,
                    "transport send failed, keeping unsent packets"
                );
                self.mux.requeue_front(std::iter::once(packet).chain(packets));
                return Err(e);
            }
        }
        Ok(())
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle_message(&mut self, data: &[u8]) -> Result<()> {
        let packet = match Packet::decode(data) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed packet");
                return Err(e);
            }
        };

        if packet.stream_id == CONTROL_STREAM_ID
            && packet.kind().ok() == Some(PacketType::Continue)
        {
            return self.handle_control_continue(&packet);
        }

        match self.state {
            ConnectionState::Connecting => {
                let err = WispError::ProtocolViolation {
                    packet_type: packet.packet_type,
                    stream_id: packet.stream_id,
                };
                tracing::warn!(%packet, "packet before handshake, discarding");
                self.emit(ConnectionEvent::Error(err.to_string()));
                return Err(err);
            }
            ConnectionState::Closed => {
                tracing::warn!(%packet, "packet after close, discarding");
                return Err(WispError::ConnectionClosed);
            }
            ConnectionState::Open => {}
        }

        if let Err(e) = self.mux.dispatch(&packet) {
            tracing::warn!(error = %e, %packet, "discarding packet");
            return Err(e);
        }
        self.flush()
    }

    fn handle_control_continue(&mut self, packet: &Packet) -> Result<()> {
        let credit = match packet::parse_continue(&packet.payload) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "discarding connection-level CONTINUE");
                return Err(e);
            }
        };
        self.max_buffer_size = Some(credit);

        match self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Open;
                tracing::debug!(max_buffer_size = credit, "handshake complete");
                self.emit(ConnectionEvent::Open);
            }
            ConnectionState::Open => {
                tracing::debug!(max_buffer_size = credit, "default credit refreshed");
            }
            ConnectionState::Closed => {
                tracing::warn!("connection-level CONTINUE after close");
            }
        }
        Ok(())
    }

    /// Close every stream with `NetworkError` and enter `Closed`.
    ///
    /// Returns `false` if the connection was already closed.
    fn teardown(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closed;
        let closed = self.mux.close_all(CloseReason::NetworkError);
        tracing::debug!(closed_streams = closed, "transport gone, streams closed");
        // The transport is usually dead by now; the CLOSE packets are best effort.
        if let Err(e) = self.flush() {
            let dropped = self.mux.drain_packets().len();
            tracing::debug!(error = %e, dropped, "could not deliver CLOSE packets");
        }
        true
    }
}

/// A Wisp client connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Mutex<Shared>>,
    endpoint: Arc<str>,
}

impl Connection {
    /// Validate `config` and start opening `transport` towards its endpoint.
    pub fn new(config: ConnectionConfig, mut transport: impl Transport + 'static) -> Result<Self> {
        config.validate()?;
        transport.connect(&config.endpoint)?;
        let (events, _) = broadcast::channel(config.event_capacity);

        tracing::debug!(endpoint = %config.endpoint, "connecting");
        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Connecting,
                max_buffer_size: None,
                mux: Multiplexer::new(),
                transport: Box::new(transport),
                events,
            })),
            endpoint: config.endpoint.into(),
        })
    }

    /// Shorthand for `Connection::new(ConnectionConfig::new(endpoint), transport)`.
    pub fn connect(endpoint: &str, transport: impl Transport + 'static) -> Result<Self> {
        Self::new(ConnectionConfig::new(endpoint), transport)
    }

    /// Subscribe to connection-level events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.lock().events.subscribe()
    }

    /// Apply one transport event. Events must be fed in delivery order.
    ///
    /// Discarded packets are logged and reported as `Err`; none of them
    /// affect the connection's state.
    pub fn handle_event(&self, event: TransportEvent) -> Result<()> {
        let mut shared = self.shared.lock();
        match event {
            TransportEvent::Open => {
                tracing::debug!("transport open, awaiting initial CONTINUE");
                Ok(())
            }
            TransportEvent::Message(data) => shared.handle_message(&data),
            TransportEvent::Close => {
                if shared.teardown() {
                    shared.emit(ConnectionEvent::Close);
                }
                Ok(())
            }
            TransportEvent::Error(message) => {
                tracing::warn!(error = %message, "transport error");
                if shared.teardown() {
                    shared.emit(ConnectionEvent::Error(message));
                }
                Ok(())
            }
        }
    }

    /// Feed one inbound binary message.
    pub fn handle_message(&self, data: &[u8]) -> Result<()> {
        self.shared.lock().handle_message(data)
    }

    /// Open a new stream to `hostname:port`.
    ///
    /// The stream is usable immediately; sends are subject to flow control.
    pub fn create_stream(
        &self,
        hostname: &str,
        port: u16,
        stream_type: StreamType,
    ) -> Result<StreamHandle> {
        let mut shared = self.shared.lock();
        if shared.state == ConnectionState::Closed {
            return Err(WispError::ConnectionClosed);
        }
        let credit = Credit::from_default(shared.max_buffer_size);
        let (id, events) = shared.mux.create_stream(hostname, port, stream_type, credit);
        shared.flush()?;

        Ok(StreamHandle {
            id,
            hostname: hostname.to_owned(),
            port,
            stream_type,
            shared: Arc::clone(&self.shared),
            events,
        })
    }

    /// Close every stream voluntarily, then close the transport.
    pub fn close(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.state == ConnectionState::Closed {
            return Ok(());
        }
        shared.mux.close_all(CloseReason::Voluntary);
        let flushed = shared.flush();
        let closed = shared.transport.close();
        shared.teardown();
        shared.emit(ConnectionEvent::Close);
        flushed.and(closed)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// Default credit announced by the server, once the handshake is done.
    pub fn max_buffer_size(&self) -> Option<u32> {
        self.shared.lock().max_buffer_size
    }

    pub fn active_stream_count(&self) -> usize {
        self.shared.lock().mux.active_stream_count()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &shared.state)
            .field("max_buffer_size", &shared.max_buffer_size)
            .field("active_streams", &shared.mux.active_stream_count())
            .finish()
    }
}

/// Caller-side handle to one stream.
///
/// Holds the stream id and the receiving end of its events. The stream
/// itself lives in the connection's registry.
pub struct StreamHandle {
    id: StreamId,
    hostname: String,
    port: u16,
    stream_type: StreamType,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
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

    /// Send bytes or text. Buffered rather than sent when out of credit.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.mux.send(self.id, data.into())?;
        shared.flush()
    }

    /// Close the stream. Does nothing if it is already closed.
    pub fn close(&self, reason: CloseReason) -> Result<()> {
        if !reason.client_may_send() {
            tracing::warn!(
                stream_id = self.id,
                reason = reason.as_u8(),
                "closing with a reason reserved for the server"
            );
        }
        let mut shared = self.shared.lock();
        if shared.mux.close_stream(self.id, reason) {
            shared.flush()?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().mux.contains(self.id)
    }

    /// Remaining credit, or `None` once the stream is closed.
    pub fn credit(&self) -> Option<Credit> {
        self.shared.lock().mux.get_stream(self.id).map(|s| s.credit())
    }

    /// Payloads waiting for credit.
    pub fn queued_len(&self) -> usize {
        self.shared
            .lock()
            .mux
            .get_stream(self.id)
            .map_or(0, |s| s.queued_len())
    }

    /// Wait for the next message or close notification.
    ///
    /// Returns `None` after the close event has been consumed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Take the next event if one is ready.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("stream_type", &self.stream_type)
            .finish()
    }
}
