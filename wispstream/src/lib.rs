//! wispstream -- client side of the Wisp stream multiplexing protocol.
//!
//! Tunnels many TCP- and UDP-like byte streams over one ordered, message
//! oriented transport (usually a WebSocket):
//! - **Packet codec**: `type(1) || stream_id(4, LE) || payload`
//! - **Streams**: per-stream identity, credit and outbound queue
//! - **Credit-based flow control**: TCP sends beyond the server's grant are
//!   queued until the next CONTINUE; UDP is never limited
//! - **Connection**: handshake, inbound routing and teardown

pub mod connection;
pub mod driver;
pub mod error;
pub mod flow_control;
pub mod mux;
pub mod packet;
pub mod stream;
pub mod transport;

// Re-export key public types at crate root.
pub use connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, StreamHandle,
};
pub use error::{Result, WispError};
pub use flow_control::{Credit, FlowController};
pub use mux::{Multiplexer, StreamId};
pub use packet::{CloseReason, CloseSender, ConnectPayload, Packet, PacketType, StreamType};
pub use stream::{Stream, StreamEvent, StreamState};
pub use transport::{ChannelTransport, Transport, TransportEvent};
