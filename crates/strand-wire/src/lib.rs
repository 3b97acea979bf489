//! The data-plane wire protocol: length-prefixed framed messages,
//! versioned by a protocol version negotiated in the HELLO/ACK
//! handshake.
//!
//! Serialization is deterministic: bodies are bincode with a fixed
//! field order, headers are hand-framed.

pub mod connect;
pub mod header;
pub mod message;
pub mod status;

pub use connect::{requires_ssl, ConnectionKind, HandshakeState, TransportSecurity};
pub use header::{FrameError, ProtocolHeader};
pub use message::{
    Message, MessageType, NodeStatsBucket, ReadFilter, StoreHeader, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
pub use status::Status;
