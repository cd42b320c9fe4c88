//! Stream registry and inbound routing.
//!
//! Owns every open stream keyed by `StreamId`. A stream leaves the map the
//! moment it closes, so presence in the map means "open". Packets produced by
//! stream operations are collected in order into a single outbound list that
//! the connection flushes to the transport.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Result, WispError};
use crate::flow_control::Credit;
use crate::packet::{self, CloseReason, ConnectPayload, Packet, PacketType, StreamType};
use crate::stream::{Stream, StreamEvent};

/// Type alias for stream identifiers.
pub type StreamId = u32;

/// Multiplexer managing all streams on a connection.
pub struct Multiplexer {
    streams: HashMap<StreamId, Stream>,
    /// Next client-allocated stream id. Starts at 1, never reused.
    next_stream_id: StreamId,
    outbound: Vec<Packet>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            next_stream_id: 1,
            outbound: Vec::new(),
        }
    }

    /// Open a new stream and queue its CONNECT packet.
    ///
    /// Returns the stream id and the receiver for the stream's events.
    pub fn create_stream(
        &mut self,
        hostname: &str,
        port: u16,
        stream_type: StreamType,
        credit: Credit,
    ) -> (StreamId, mpsc::UnboundedReceiver<StreamEvent>) {
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1);

        let (tx, rx) = mpsc::unbounded_channel();
        let info = ConnectPayload {
            stream_type,
            port,
            hostname: hostname.to_owned(),
        };
        let mut stream = Stream::new(id, info, credit, tx);
        self.outbound.extend(stream.drain_packets());
        self.streams.insert(id, stream);

        tracing::debug!(stream_id = id, hostname, port, %stream_type, %credit, "stream created");
        (id, rx)
    }

    /// Send data on a stream, subject to its flow control.
    pub fn send(&mut self, stream_id: StreamId, data: Bytes) -> Result<()> {
        let stream = self.lookup(stream_id)?;
        stream.send(data)?;
        let packets = stream.drain_packets();
        self.outbound.extend(packets);
        Ok(())
    }

    /// Close a stream and drop it from the registry.
    ///
    /// Returns `false` if the stream was not open.
    pub fn close_stream(&mut self, stream_id: StreamId, reason: CloseReason) -> bool {
        let Some(mut stream) = self.streams.remove(&stream_id) else {
            return false;
        };
        let closed = stream.close(reason);
        self.outbound.extend(stream.drain_packets());
        if closed {
            tracing::debug!(stream_id, reason = reason.as_u8(), "stream closed");
        }
        closed
    }

    /// Close every open stream with the same reason.
    pub fn close_all(&mut self, reason: CloseReason) -> usize {
        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter(|id| self.close_stream(*id, reason))
            .count()
    }

    /// Route an inbound packet addressed to a stream.
    ///
    /// Connection-level packets (stream 0) are handled by the connection and
    /// must not reach this point; they are reported as unknown streams.
    pub fn dispatch(&mut self, packet: &Packet) -> Result<()> {
        let stream_id = packet.stream_id;
        if !self.streams.contains_key(&stream_id) {
            return Err(WispError::StreamNotFound(stream_id));
        }

        match packet.kind()? {
            PacketType::Data => {
                let stream = self.lookup(stream_id)?;
                stream.deliver(packet.payload.clone());
            }
            PacketType::Continue => {
                let credit = packet::parse_continue(&packet.payload)?;
                let stream = self.lookup(stream_id)?;
                stream.continue_received(credit);
                let packets = stream.drain_packets();
                self.outbound.extend(packets);
            }
            PacketType::Close => {
                let reason = packet::parse_close(&packet.payload);
                self.close_stream(stream_id, reason);
            }
            PacketType::Connect => {
                tracing::warn!(stream_id, "ignoring CONNECT sent by the server");
            }
        }
        Ok(())
    }

    fn lookup(&mut self, stream_id: StreamId) -> Result<&mut Stream> {
        let next = self.next_stream_id;
        self.streams.get_mut(&stream_id).ok_or_else(|| {
            // Ids below the allocator were handed out and have since closed.
            if stream_id != 0 && stream_id < next {
                WispError::StreamClosed(stream_id)
            } else {
                WispError::StreamNotFound(stream_id)
            }
        })
    }

    /// Take every packet queued for the transport, in production order.
    pub fn drain_packets(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbound)
    }

    /// Put packets the transport did not accept back at the head of the
    /// outbound list, ahead of anything queued since.
    pub fn requeue_front(&mut self, packets: impl IntoIterator<Item = Packet>) {
        let mut unsent: Vec<Packet> = packets.into_iter().collect();
        unsent.append(&mut self.outbound);
        self.outbound = unsent;
    }

    /// Returns a reference to an open stream.
    pub fn get_stream(&self, stream_id: StreamId) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Returns the number of open streams.
    pub fn active_stream_count(&self) -> usize {
        self.streams.len()
    }

    /// The id the next `create_stream` call will use.
    pub fn next_stream_id(&self) -> StreamId {
        self.next_stream_id
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(
        mux: &mut Multiplexer,
        credit: Credit,
    ) -> (StreamId, mpsc::UnboundedReceiver<StreamEvent>) {
        mux.create_stream("example.com", 443, StreamType::Tcp, credit)
    }

    #[test]
    fn ids_increase_and_are_not_reused() {
        let mut mux = Multiplexer::new();
        let (a, _) = tcp(&mut mux, Credit::Unbounded);
        let (b, _) = tcp(&mut mux, Credit::Unbounded);
        assert_eq!((a, b), (1, 2));

        mux.close_stream(b, CloseReason::Voluntary);
        let (c, _) = tcp(&mut mux, Credit::Unbounded);
        assert_eq!(c, 3);
        assert_eq!(mux.active_stream_count(), 2);
    }

    #[test]
    fn create_queues_connect() {
        let mut mux = Multiplexer::new();
        tcp(&mut mux, Credit::Unbounded);
        let packets = mux.drain_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind().unwrap(), PacketType::Connect);
    }

    #[test]
    fn dispatch_data_to_stream() {
        let mut mux = Multiplexer::new();
        let (id, mut rx) = tcp(&mut mux, Credit::Unbounded);

        mux.dispatch(&Packet::data(id, Bytes::from_static(b"incoming")))
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Message(Bytes::from_static(b"incoming"))
        );
    }

    #[test]
    fn dispatch_unknown_stream() {
        let mut mux = Multiplexer::new();
        let result = mux.dispatch(&Packet::data(42, Bytes::from_static(b"orphan")));
        assert!(matches!(result, Err(WispError::StreamNotFound(42))));
    }

    #[test]
    fn dispatch_unknown_type() {
        let mut mux = Multiplexer::new();
        let (id, _rx) = tcp(&mut mux, Credit::Unbounded);
        let packet = Packet {
            packet_type: 0x09,
            stream_id: id,
            payload: Bytes::new(),
        };
        assert!(matches!(
            mux.dispatch(&packet),
            Err(WispError::UnknownPacketType(0x09))
        ));
        assert!(mux.contains(id));
    }

    #[test]
    fn inbound_close_removes_stream_and_echoes() {
        let mut mux = Multiplexer::new();
        let (id, mut rx) = tcp(&mut mux, Credit::Unbounded);
        mux.drain_packets();

        mux.dispatch(&Packet::close(id, CloseReason::ConnectionRefused))
            .unwrap();
        assert!(!mux.contains(id));
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Close(CloseReason::ConnectionRefused)
        );

        let packets = mux.drain_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind().unwrap(), PacketType::Close);
    }

    #[test]
    fn continue_drains_queue() {
        let mut mux = Multiplexer::new();
        let (id, _rx) = tcp(&mut mux, Credit::Limited(0));
        mux.drain_packets();

        mux.send(id, Bytes::from_static(b"held")).unwrap();
        assert!(mux.drain_packets().is_empty());

        mux.dispatch(&Packet::continue_(id, 4)).unwrap();
        let packets = mux.drain_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].payload[..], b"held");
        assert_eq!(mux.get_stream(id).unwrap().credit(), Credit::Limited(3));
    }

    #[test]
    fn short_continue_is_rejected() {
        let mut mux = Multiplexer::new();
        let (id, _rx) = tcp(&mut mux, Credit::Limited(0));
        let packet = Packet::new(PacketType::Continue, id, Bytes::from_static(&[1, 0]));
        assert!(matches!(
            mux.dispatch(&packet),
            Err(WispError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn send_on_closed_stream() {
        let mut mux = Multiplexer::new();
        let (id, _rx) = tcp(&mut mux, Credit::Unbounded);
        mux.close_stream(id, CloseReason::Voluntary);
        assert!(matches!(
            mux.send(id, Bytes::from_static(b"x")),
            Err(WispError::StreamClosed(1))
        ));
        assert!(matches!(
            mux.send(77, Bytes::from_static(b"x")),
            Err(WispError::StreamNotFound(77))
        ));
    }

    #[test]
    fn requeued_packets_go_first() {
        let mut mux = Multiplexer::new();
        let (id, _rx) = tcp(&mut mux, Credit::Unbounded);
        mux.drain_packets();

        mux.send(id, Bytes::from_static(b"a")).unwrap();
        let unsent = mux.drain_packets();
        mux.send(id, Bytes::from_static(b"b")).unwrap();
        mux.requeue_front(unsent);

        let payloads: Vec<_> = mux.drain_packets().into_iter().map(|p| p.payload).collect();
        assert_eq!(
            payloads,
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    #[test]
    fn close_all_empties_registry() {
        let mut mux = Multiplexer::new();
        let mut receivers: Vec<_> = (0..3)
            .map(|_| tcp(&mut mux, Credit::Unbounded).1)
            .collect();

        assert_eq!(mux.close_all(CloseReason::NetworkError), 3);
        assert_eq!(mux.active_stream_count(), 0);
        for rx in receivers.iter_mut() {
            assert_eq!(
                rx.try_recv().unwrap(),
                StreamEvent::Close(CloseReason::NetworkError)
            );
        }
    }
}
