//! Frame header and streaming frame extraction.
//!
//! Frame layout:
//! - total_len: u32 LE (header + body)
//! - msg_type: u8
//! - flags: u8 (bit 0: checksum present)
//! - cookie: u32 LE (connection cookie, echoed for tracing)
//! - checksum: u64 LE (crc32c of the body, present iff flagged)
//! - body

use crate::message::MessageType;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

const FLAG_CHECKSUM: u8 = 0x01;
const FIXED_HEADER_LEN: usize = 4 + 1 + 1 + 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
    #[error("frame shorter than its header")]
    Truncated,
    #[error("unknown message type: {0:#x}")]
    UnknownType(u8),
    #[error("body checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u64, actual: u64 },
    #[error("message requires protocol {needs}, connection speaks {have}")]
    ProtoNoSupport { needs: u16, have: u16 },
    #[error("body decode failed: {0}")]
    Body(String),
}

/// Hard cap on a single frame; anything larger is a protocol violation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub total_len: u32,
    pub msg_type: MessageType,
    pub cookie: u32,
    pub checksum: Option<u64>,
}

impl ProtocolHeader {
    pub fn len(&self) -> usize {
        FIXED_HEADER_LEN + if self.checksum.is_some() { 8 } else { 0 }
    }

    pub fn body_len(&self) -> usize {
        self.total_len as usize - self.len()
    }
}

/// Frames one encoded body.
pub fn encode_frame(
    msg_type: MessageType,
    cookie: u32,
    body: &[u8],
    with_checksum: bool,
) -> BytesMut {
    let checksum = with_checksum.then(|| crc32c::crc32c(body) as u64);
    let header_len = FIXED_HEADER_LEN + if with_checksum { 8 } else { 0 };
    let total_len = (header_len + body.len()) as u32;

    let mut buf = BytesMut::with_capacity(total_len as usize);
    buf.put_u32_le(total_len);
    buf.put_u8(msg_type as u8);
    buf.put_u8(if with_checksum { FLAG_CHECKSUM } else { 0 });
    buf.put_u32_le(cookie);
    if let Some(sum) = checksum {
        buf.put_u64_le(sum);
    }
    buf.put_slice(body);
    buf
}

/// Pulls one complete frame out of a streaming buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full frame;
/// the buffer is only consumed when a full frame is extracted.
pub fn try_decode_frame(
    buf: &mut BytesMut,
) -> Result<Option<(ProtocolHeader, BytesMut)>, FrameError> {
    if buf.len() < FIXED_HEADER_LEN {
        return Ok(None);
    }
    let total_len = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if total_len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(total_len));
    }
    if (total_len as usize) < FIXED_HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    if buf.len() < total_len as usize {
        return Ok(None);
    }

    let mut frame = buf.split_to(total_len as usize);
    frame.advance(4);
    let type_byte = frame.get_u8();
    let msg_type = MessageType::from_u8(type_byte).ok_or(FrameError::UnknownType(type_byte))?;
    let flags = frame.get_u8();
    let cookie = frame.get_u32_le();
    let checksum = if flags & FLAG_CHECKSUM != 0 {
        if frame.len() < 8 {
            return Err(FrameError::Truncated);
        }
        Some(frame.get_u64_le())
    } else {
        None
    };

    if let Some(expected) = checksum {
        let actual = crc32c::crc32c(&frame) as u64;
        if actual != expected {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }
    }

    Ok(Some((
        ProtocolHeader {
            total_len,
            msg_type,
            cookie,
            checksum,
        },
        frame,
    )))
}
