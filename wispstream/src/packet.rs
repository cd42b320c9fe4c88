//! Wisp wire packets.
//!
//! Every transport message carries exactly one packet:
//!
//! ```text
//! +-------+----------------+--- variable ---+
//! | type  | stream_id (LE) |    payload     |
//! | (1B)  |      (4B)      |                |
//! +-------+----------------+----------------+
//! ```
//!
//! There is no length field; the payload runs to the end of the message.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WispError};

/// Size of the fixed packet header (type + stream id).
pub const HEADER_LEN: usize = 5;

/// Stream id reserved for connection-level control packets.
pub const CONTROL_STREAM_ID: u32 = 0;

/// Packet type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0x01,
    Data = 0x02,
    Continue = 0x03,
    Close = 0x04,
}

impl TryFrom<u8> for PacketType {
    type Error = WispError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(PacketType::Connect),
            0x02 => Ok(PacketType::Data),
            0x03 => Ok(PacketType::Continue),
            0x04 => Ok(PacketType::Close),
            other => Err(WispError::UnknownPacketType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Connect => write!(f, "CONNECT"),
            PacketType::Data => write!(f, "DATA"),
            PacketType::Continue => write!(f, "CONTINUE"),
            PacketType::Close => write!(f, "CLOSE"),
        }
    }
}

/// Kind of logical connection tunnelled by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum StreamType {
    #[default]
    Tcp = 0x01,
    Udp = 0x02,
}

impl TryFrom<u8> for StreamType {
    type Error = WispError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(StreamType::Tcp),
            0x02 => Ok(StreamType::Udp),
            other => Err(WispError::InvalidStreamType(other)),
        }
    }
}

impl FromStr for StreamType {
    type Err = std::convert::Infallible;

    /// `"udp"` selects UDP; every other string falls back to TCP.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(StreamType::Udp)
        } else {
            Ok(StreamType::Tcp)
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Tcp => write!(f, "tcp"),
            StreamType::Udp => write!(f, "udp"),
        }
    }
}

/// Which side of the connection may send a given close reason.
///
/// Encoded in the two most-significant bits of the reason byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSender {
    Either,
    Server,
    Client,
    Reserved,
}

/// Reason carried by a CLOSE packet.
///
/// Any byte is accepted on receive; values without a name land in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CloseReason {
    #[default]
    Unknown,
    Voluntary,
    NetworkError,
    InvalidInfo,
    HostUnreachable,
    ConnectTimeout,
    ConnectionRefused,
    TcpTimeout,
    BlockedDestination,
    Throttled,
    ClientFatal,
    Other(u8),
}

impl CloseReason {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => CloseReason::Unknown,
            0x02 => CloseReason::Voluntary,
            0x03 => CloseReason::NetworkError,
            0x41 => CloseReason::InvalidInfo,
            0x42 => CloseReason::HostUnreachable,
            0x43 => CloseReason::ConnectTimeout,
            0x44 => CloseReason::ConnectionRefused,
            0x47 => CloseReason::TcpTimeout,
            0x48 => CloseReason::BlockedDestination,
            0x49 => CloseReason::Throttled,
            0x81 => CloseReason::ClientFatal,
            other => CloseReason::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            CloseReason::Unknown => 0x01,
            CloseReason::Voluntary => 0x02,
            CloseReason::NetworkError => 0x03,
            CloseReason::InvalidInfo => 0x41,
            CloseReason::HostUnreachable => 0x42,
            CloseReason::ConnectTimeout => 0x43,
            CloseReason::ConnectionRefused => 0x44,
            CloseReason::TcpTimeout => 0x47,
            CloseReason::BlockedDestination => 0x48,
            CloseReason::Throttled => 0x49,
            CloseReason::ClientFatal => 0x81,
            CloseReason::Other(v) => v,
        }
    }

    /// The side permitted to send this reason.
    pub fn permitted_sender(self) -> CloseSender {
        match self.as_u8() >> 6 {
            0b00 => CloseSender::Either,
            0b01 => CloseSender::Server,
            0b10 => CloseSender::Client,
            _ => CloseSender::Reserved,
        }
    }

    /// Whether a client may put this reason on the wire.
    pub fn client_may_send(self) -> bool {
        matches!(
            self.permitted_sender(),
            CloseSender::Either | CloseSender::Client
        )
    }
}

impl From<u8> for CloseReason {
    fn from(value: u8) -> Self {
        CloseReason::from_u8(value)
    }
}

impl From<CloseReason> for u8 {
    fn from(reason: CloseReason) -> Self {
        reason.as_u8()
    }
}

/// Payload of a CONNECT packet: `stream_type(1) || port(2, LE) || hostname(UTF-8)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPayload {
    pub stream_type: StreamType,
    pub port: u16,
    pub hostname: String,
}

impl ConnectPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.hostname.len());
        buf.put_u8(self.stream_type as u8);
        buf.put_u16_le(self.port);
        buf.put_slice(self.hostname.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        ensure_len(data, 3, "CONNECT")?;
        let stream_type = StreamType::try_from(data.get_u8())?;
        let port = data.get_u16_le();
        let hostname = String::from_utf8_lossy(data).into_owned();
        Ok(Self {
            stream_type,
            port,
            hostname,
        })
    }
}

/// Encode a CONTINUE payload granting `credit` further sends.
pub fn continue_payload(credit: u32) -> Bytes {
    Bytes::copy_from_slice(&credit.to_le_bytes())
}

/// Parse the credit carried by a CONTINUE payload.
pub fn parse_continue(mut data: &[u8]) -> Result<u32> {
    ensure_len(data, 4, "CONTINUE")?;
    Ok(data.get_u32_le())
}

/// Parse the reason carried by a CLOSE payload.
///
/// A CLOSE without a reason byte reads as `Unknown`.
pub fn parse_close(data: &[u8]) -> CloseReason {
    data.first()
        .copied()
        .map_or(CloseReason::Unknown, CloseReason::from_u8)
}

fn ensure_len(data: &[u8], needed: usize, context: &'static str) -> Result<()> {
    if data.len() < needed {
        Err(WispError::InvalidPayload {
            context,
            expected: needed,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}

/// A single Wisp packet.
///
/// The type byte is kept raw so that packets of unrecognised types survive
/// decoding; dispatch decides what to do with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type: packet_type as u8,
            stream_id,
            payload: payload.into(),
        }
    }

    pub fn connect(stream_id: u32, info: &ConnectPayload) -> Self {
        Self::new(PacketType::Connect, stream_id, info.encode())
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(PacketType::Data, stream_id, payload)
    }

    pub fn continue_(stream_id: u32, credit: u32) -> Self {
        Self::new(PacketType::Continue, stream_id, continue_payload(credit))
    }

    pub fn close(stream_id: u32, reason: CloseReason) -> Self {
        Self::new(
            PacketType::Close,
            stream_id,
            Bytes::copy_from_slice(&[reason.as_u8()]),
        )
    }

    /// The recognised packet type, if any.
    pub fn kind(&self) -> Result<PacketType> {
        PacketType::try_from(self.packet_type)
    }

    /// The total number of bytes this packet occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode this packet into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated `BytesMut`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.packet_type);
        buf.put_u32_le(self.stream_id);
        buf.put_slice(&self.payload);
    }

    /// Decode a packet from one complete transport message.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(WispError::MalformedPacket {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let packet_type = data.get_u8();
        let stream_id = data.get_u32_le();
        Ok(Self {
            packet_type,
            stream_id,
            payload: Bytes::copy_from_slice(data),
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Ok(kind) => write!(f, "{kind}")?,
            Err(_) => write!(f, "0x{:02x}", self.packet_type)?,
        }
        write!(f, " stream={} len={}", self.stream_id, self.payload.len())
    }
}

/// Encode `packet_type || stream_id (LE) || payload`.
pub fn encode(packet_type: PacketType, stream_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(packet_type as u8);
    buf.put_u32_le(stream_id);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decode one transport message into a packet.
pub fn decode(data: &[u8]) -> Result<Packet> {
    Packet::decode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_little_endian() {
        let bytes = encode(PacketType::Data, 0x0403_0201, b"hi");
        assert_eq!(&bytes[..], &[0x02u8, 0x01, 0x02, 0x03, 0x04, b'h', b'i']);
    }

    #[test]
    fn decode_too_short() {
        let err = Packet::decode(&[0x02, 0x01, 0x00, 0x00]).unwrap_err();
        assert!(matches!(
            err,
            WispError::MalformedPacket {
                expected: 5,
                actual: 4
            }
        ));
    }

    #[test]
    fn decode_header_only_has_empty_payload() {
        let packet = Packet::decode(&[0x04, 0x07, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(packet.kind().unwrap(), PacketType::Close);
        assert_eq!(packet.stream_id, 7);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn unknown_type_survives_decode() {
        let packet = Packet::decode(&[0x7f, 0x01, 0x00, 0x00, 0x00, 0xaa]).unwrap();
        assert_eq!(packet.packet_type, 0x7f);
        assert!(matches!(
            packet.kind(),
            Err(WispError::UnknownPacketType(0x7f))
        ));
    }

    #[test]
    fn close_reason_permission_bits() {
        assert_eq!(CloseReason::Voluntary.permitted_sender(), CloseSender::Either);
        assert_eq!(CloseReason::Throttled.permitted_sender(), CloseSender::Server);
        assert_eq!(CloseReason::ClientFatal.permitted_sender(), CloseSender::Client);
        assert_eq!(CloseReason::Other(0xc0).permitted_sender(), CloseSender::Reserved);
        assert!(!CloseReason::HostUnreachable.client_may_send());
        assert!(CloseReason::ClientFatal.client_may_send());
    }

    #[test]
    fn close_reason_accepts_any_byte() {
        for b in 0..=u8::MAX {
            assert_eq!(CloseReason::from_u8(b).as_u8(), b);
        }
    }

    #[test]
    fn stream_type_from_str() {
        assert_eq!("udp".parse::<StreamType>().unwrap(), StreamType::Udp);
        assert_eq!("tcp".parse::<StreamType>().unwrap(), StreamType::Tcp);
        assert_eq!("anything".parse::<StreamType>().unwrap(), StreamType::Tcp);
    }

    #[test]
    fn continue_payload_short() {
        assert!(parse_continue(&[0x01, 0x00]).is_err());
        assert_eq!(parse_continue(&[0x00, 0x01, 0x00, 0x00]).unwrap(), 256);
    }
}
