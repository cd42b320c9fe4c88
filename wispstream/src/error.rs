use thiserror::Error;

/// All errors produced by the Wisp client.
#[derive(Debug, Error)]
pub enum WispError {
    #[error("malformed packet: expected at least {expected} bytes, got {actual}")]
    MalformedPacket { expected: usize, actual: usize },

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("invalid stream type: 0x{0:02x}")]
    InvalidStreamType(u8),

    #[error("invalid {context} payload: expected {expected} bytes, got {actual}")]
    InvalidPayload {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("stream {0} not found")]
    StreamNotFound(u32),

    #[error("stream {0} is closed")]
    StreamClosed(u32),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol violation: expected CONTINUE on stream 0 before anything else, got type 0x{packet_type:02x} on stream {stream_id}")]
    ProtocolViolation { packet_type: u8, stream_id: u32 },

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, WispError>;
