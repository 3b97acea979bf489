//! Message types and their version-aware bodies.
//!
//! Type codes are single bytes and must never be renumbered. A peer
//! that receives a type above its negotiated protocol version treats
//! the message as unsupported; optional trailing fields are modeled as
//! `Option`s, which bincode encodes presence-prefixed so older peers
//! never misparse them.

use crate::header::{encode_frame, try_decode_frame, FrameError, ProtocolHeader};
use crate::status::Status;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use strand_membership::{NodeIndex, ShardId};
use strand_record::{Epoch, GapKind, KeyKind, LogId, Lsn};

/// Protocol version this build speaks.
pub const PROTOCOL_VERSION: u16 = 2;
/// Oldest peer protocol this build still talks to.
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Wire message type codes (one byte, stable forever).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = b'H',
    Ack = b'A',
    GetSeqState = b'S',
    GetSeqStateReply = b's',
    Append = b'a',
    Appended = b'p',
    Store = b'O',
    Stored = b'o',
    Release = b'R',
    Start = b't',
    Started = b'T',
    Record = b'r',
    Gap = b'g',
    Window = b'W',
    Stop = b'x',
    ConfigFetch = b'C',
    ConfigChanged = b'c',
    Gossip = b'G',
    NodeStatsAggregate = b'N',
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MessageType::*;
        Some(match v {
            b'H' => Hello,
            b'A' => Ack,
            b'S' => GetSeqState,
            b's' => GetSeqStateReply,
            b'a' => Append,
            b'p' => Appended,
            b'O' => Store,
            b'o' => Stored,
            b'R' => Release,
            b't' => Start,
            b'T' => Started,
            b'r' => Record,
            b'g' => Gap,
            b'W' => Window,
            b'x' => Stop,
            b'C' => ConfigFetch,
            b'c' => ConfigChanged,
            b'G' => Gossip,
            b'N' => NodeStatsAggregate,
            _ => return None,
        })
    }

    /// Lowest protocol version that understands this type.
    pub fn min_protocol(self) -> u16 {
        match self {
            MessageType::NodeStatsAggregate => 2,
            _ => 1,
        }
    }

    /// Only the handshake pair is legal before the handshake completes.
    pub fn is_handshake(self) -> bool {
        matches!(self, MessageType::Hello | MessageType::Ack)
    }

    /// Types allowed on the dedicated gossip connection.
    pub fn allowed_on_gossip_connection(self) -> bool {
        self == MessageType::Gossip || self.is_handshake()
    }
}

/// STORE metadata, shared between the wire and the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub log: LogId,
    pub lsn: Lsn,
    pub timestamp_ms: u64,
    /// Raw record flags (`strand_record::RecordFlags` bits).
    pub flags: u32,
    /// The copyset this record is being stored to, in order.
    pub copyset: Vec<ShardId>,
    /// Retry wave this store belongs to.
    pub wave: u32,
}

/// Server-side read filters carried on START.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadFilter {
    /// Pass records whose key of `kind` equals `value`.
    Key { kind: KeyKind, value: String },
    /// Pass records whose counter `counter` is at least `min`.
    CounterAtLeast { counter: u8, min: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// First message on every connection.
    Hello {
        min_protocol: u16,
        max_protocol: u16,
        node: Option<NodeIndex>,
        cluster_name: String,
    },
    /// Handshake reply; fixes the protocol version for the connection.
    Ack {
        status: Status,
        protocol: u16,
        cookie: u32,
    },
    GetSeqState {
        log: LogId,
    },
    GetSeqStateReply {
        log: LogId,
        status: Status,
        epoch: Epoch,
        last_released: Lsn,
        redirect: Option<NodeIndex>,
    },
    Append {
        log: LogId,
        payload: Bytes,
        /// Raw record flags requested by the client (batches etc.).
        flags: u32,
        timeout_ms: u64,
    },
    Appended {
        log: LogId,
        status: Status,
        lsn: Lsn,
        timestamp_ms: u64,
        redirect: Option<NodeIndex>,
    },
    Store {
        header: StoreHeader,
        payload: Bytes,
    },
    Stored {
        log: LogId,
        lsn: Lsn,
        wave: u32,
        status: Status,
        shard: ShardId,
        /// On `Preempted`: the epoch that sealed this log on the shard.
        seal_epoch: Option<Epoch>,
    },
    /// Advances the release pointer on storage nodes.
    Release {
        log: LogId,
        lsn: Lsn,
    },
    Start {
        log: LogId,
        read_stream: u64,
        shard: ShardId,
        start: Lsn,
        until: Lsn,
        window_bytes: u64,
        /// Single-copy delivery: false = send-all.
        scd: bool,
        filter: Option<ReadFilter>,
    },
    Started {
        read_stream: u64,
        status: Status,
        last_released: Lsn,
    },
    Record {
        read_stream: u64,
        shard: ShardId,
        /// Encoded `DataRecord` (record codec).
        record: Bytes,
    },
    Gap {
        read_stream: u64,
        shard: ShardId,
        log: LogId,
        lo: Lsn,
        hi: Lsn,
        kind: GapKind,
    },
    /// Client grants more outstanding bytes to a sub-stream.
    Window {
        read_stream: u64,
        window_bytes: u64,
    },
    Stop {
        read_stream: u64,
    },
    ConfigFetch {
        /// Version the requester already has.
        have_version: u64,
    },
    ConfigChanged {
        version: u64,
        config: Bytes,
    },
    /// Opaque gossip payload; rides the gossip connection only.
    Gossip {
        payload: Bytes,
    },
    /// Per-node append-success stats, aggregated for boycotting.
    NodeStatsAggregate {
        msg_id: u64,
        bucket_count: u32,
        separation_ms: u64,
        buckets: Vec<NodeStatsBucket>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatsBucket {
    pub node: NodeIndex,
    pub successes: u64,
    pub failures: u64,
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Hello { .. } => MessageType::Hello,
            Message::Ack { .. } => MessageType::Ack,
            Message::GetSeqState { .. } => MessageType::GetSeqState,
            Message::GetSeqStateReply { .. } => MessageType::GetSeqStateReply,
            Message::Append { .. } => MessageType::Append,
            Message::Appended { .. } => MessageType::Appended,
            Message::Store { .. } => MessageType::Store,
            Message::Stored { .. } => MessageType::Stored,
            Message::Release { .. } => MessageType::Release,
            Message::Start { .. } => MessageType::Start,
            Message::Started { .. } => MessageType::Started,
            Message::Record { .. } => MessageType::Record,
            Message::Gap { .. } => MessageType::Gap,
            Message::Window { .. } => MessageType::Window,
            Message::Stop { .. } => MessageType::Stop,
            Message::ConfigFetch { .. } => MessageType::ConfigFetch,
            Message::ConfigChanged { .. } => MessageType::ConfigChanged,
            Message::Gossip { .. } => MessageType::Gossip,
            Message::NodeStatsAggregate { .. } => MessageType::NodeStatsAggregate,
        }
    }

    /// Encodes into one frame at the given negotiated protocol.
    pub fn encode(
        &self,
        protocol: u16,
        cookie: u32,
        with_checksum: bool,
    ) -> Result<BytesMut, FrameError> {
        let msg_type = self.msg_type();
        if msg_type.min_protocol() > protocol {
            return Err(FrameError::ProtoNoSupport {
                needs: msg_type.min_protocol(),
                have: protocol,
            });
        }
        let body = bincode::serialize(self).map_err(|e| FrameError::Body(e.to_string()))?;
        Ok(encode_frame(msg_type, cookie, &body, with_checksum))
    }

    /// Decodes the next complete frame from a streaming buffer.
    pub fn try_decode(
        buf: &mut BytesMut,
        protocol: u16,
    ) -> Result<Option<(ProtocolHeader, Message)>, FrameError> {
        let Some((header, body)) = try_decode_frame(buf)? else {
            return Ok(None);
        };
        if header.msg_type.min_protocol() > protocol {
            return Err(FrameError::ProtoNoSupport {
                needs: header.msg_type.min_protocol(),
                have: protocol,
            });
        }
        let msg: Message =
            bincode::deserialize(&body).map_err(|e| FrameError::Body(e.to_string()))?;
        if msg.msg_type() != header.msg_type {
            return Err(FrameError::Body(format!(
                "body is {:?} but header says {:?}",
                msg.msg_type(),
                header.msg_type
            )));
        }
        Ok(Some((header, msg)))
    }
}
