//! Buffered-writer batch codec.
//!
//! Batch format:
//! - flags: u8 (bit 0: payload-group body, bits 2-3 reserved)
//! - compression: u8 (identifier, see [`Compression`])
//! - count: varint (number of member payloads)
//! - uncompressed_len: varint (present iff compression != None)
//! - body: member payloads, compressed as a unit
//! - crc32c: u32 (little-endian) over everything above
//!
//! The flat body is a sequence of length-prefixed blobs. The group body is
//! a sequence of encoded payload groups.

use crate::payload::Payload;
use crate::record::{decode_varint, encode_varint};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Incomplete batch")]
    Incomplete,
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("Invalid compression id: {0}")]
    InvalidCompression(u8),
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    #[error("Record error: {0}")]
    Record(#[from] crate::record::RecordError),
}

/// Compression applied to a batch body.
///
/// Identifiers match the original wire format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Zstd,
    Lz4,
    Lz4Hc,
}

impl Compression {
    pub fn id(self) -> u8 {
        match self {
            Compression::None => 0x00,
            Compression::Zstd => 0x01,
            Compression::Lz4 => 0x04,
            Compression::Lz4Hc => 0x05,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, BatchError> {
        match id {
            0x00 => Ok(Compression::None),
            0x01 => Ok(Compression::Zstd),
            0x04 => Ok(Compression::Lz4),
            0x05 => Ok(Compression::Lz4Hc),
            other => Err(BatchError::InvalidCompression(other)),
        }
    }

    /// Parse the configuration spelling ("none", "zstd", "lz4", "lz4hc").
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Compression::None),
            "zstd" => Some(Compression::Zstd),
            "lz4" => Some(Compression::Lz4),
            "lz4hc" => Some(Compression::Lz4Hc),
            _ => None,
        }
    }
}

const FLAG_GROUP_BODY: u8 = 0x01;

/// Encodes a batch of payloads into a single blob.
///
/// If compression does not shrink the body the batch is written
/// uncompressed, whatever the caller asked for.
pub fn encode_batch(payloads: &[Payload], compression: Compression) -> Result<Bytes, BatchError> {
    let any_group = payloads.iter().any(Payload::is_group);

    let mut body = BytesMut::new();
    for payload in payloads {
        match payload {
            Payload::Flat(blob) => {
                if any_group {
                    // Promote to a single-member group so the body stays uniform.
                    encode_varint(&mut body, 1);
                    encode_varint(&mut body, 0);
                    encode_varint(&mut body, blob.len() as u64);
                    body.put_slice(blob);
                } else {
                    encode_varint(&mut body, blob.len() as u64);
                    body.put_slice(blob);
                }
            }
            Payload::Group(group) => {
                encode_varint(&mut body, group.len() as u64);
                for (key, value) in group {
                    encode_varint(&mut body, key.len() as u64);
                    body.put_slice(key.as_bytes());
                    encode_varint(&mut body, value.len() as u64);
                    body.put_slice(value);
                }
            }
        }
    }
    let body = body.freeze();

    let (compression, compressed) = compress(&body, compression)?;

    let mut buf = BytesMut::new();
    let mut flags = 0u8;
    if any_group {
        flags |= FLAG_GROUP_BODY;
    }
    buf.put_u8(flags);
    buf.put_u8(compression.id());
    encode_varint(&mut buf, payloads.len() as u64);
    if compression != Compression::None {
        encode_varint(&mut buf, body.len() as u64);
    }
    buf.put_slice(&compressed);

    let crc = crc32c::crc32c(&buf);
    buf.put_u32_le(crc);
    Ok(buf.freeze())
}

/// Decodes a batch back into its member payloads.
pub fn decode_batch(data: &[u8]) -> Result<Vec<Payload>, BatchError> {
    if data.len() < 2 + 4 {
        return Err(BatchError::Incomplete);
    }
    let stored_crc = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
    let actual = crc32c::crc32c(&data[..data.len() - 4]);
    if stored_crc != actual {
        return Err(BatchError::CrcMismatch {
            expected: stored_crc,
            actual,
        });
    }

    let mut cursor = &data[..data.len() - 4];
    let flags = cursor[0];
    let compression = Compression::from_id(cursor[1])?;
    cursor.advance(2);
    let count = decode_varint(&mut cursor)? as usize;

    let body: Bytes = if compression != Compression::None {
        let uncompressed_len = decode_varint(&mut cursor)? as usize;
        decompress(cursor, compression, uncompressed_len)?
    } else {
        Bytes::copy_from_slice(cursor)
    };

    let group_body = flags & FLAG_GROUP_BODY != 0;
    let mut cursor = &body[..];
    let mut payloads = Vec::with_capacity(count);
    for _ in 0..count {
        if group_body {
            let nparts = decode_varint(&mut cursor)?;
            let mut group = crate::payload::PayloadGroup::new();
            let mut flat = None;
            for _ in 0..nparts {
                let klen = decode_varint(&mut cursor)? as usize;
                let key = take(&mut cursor, klen)?;
                let vlen = decode_varint(&mut cursor)? as usize;
                let value = take(&mut cursor, vlen)?;
                if nparts == 1 && klen == 0 {
                    // Flat member promoted into the group body on encode.
                    flat = Some(value);
                } else {
                    let key = String::from_utf8(key.to_vec())
                        .map_err(|_| crate::record::RecordError::BadGroupKey)?;
                    group.insert(key, value);
                }
            }
            match flat {
                Some(blob) => payloads.push(Payload::Flat(blob)),
                None => payloads.push(Payload::Group(group)),
            }
        } else {
            let len = decode_varint(&mut cursor)? as usize;
            payloads.push(Payload::Flat(take(&mut cursor, len)?));
        }
    }
    Ok(payloads)
}

fn take(cursor: &mut &[u8], len: usize) -> Result<Bytes, BatchError> {
    if cursor.len() < len {
        return Err(BatchError::Incomplete);
    }
    let bytes = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(bytes)
}

fn compress(body: &[u8], compression: Compression) -> Result<(Compression, Bytes), BatchError> {
    let compressed = match compression {
        Compression::None => return Ok((Compression::None, Bytes::copy_from_slice(body))),
        Compression::Lz4 => lz4::block::compress(body, None, false)
            .map_err(|e| BatchError::CompressionFailed(e.to_string()))?,
        Compression::Lz4Hc => lz4::block::compress(
            body,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(9)),
            false,
        )
        .map_err(|e| BatchError::CompressionFailed(e.to_string()))?,
        Compression::Zstd => zstd::encode_all(body, 3)
            .map_err(|e| BatchError::CompressionFailed(e.to_string()))?,
    };
    if compressed.len() >= body.len() {
        Ok((Compression::None, Bytes::copy_from_slice(body)))
    } else {
        Ok((compression, Bytes::from(compressed)))
    }
}

fn decompress(
    body: &[u8],
    compression: Compression,
    uncompressed_len: usize,
) -> Result<Bytes, BatchError> {
    match compression {
        Compression::None => Ok(Bytes::copy_from_slice(body)),
        Compression::Lz4 | Compression::Lz4Hc => {
            let out = lz4::block::decompress(body, Some(uncompressed_len as i32))
                .map_err(|e| BatchError::DecompressionFailed(e.to_string()))?;
            Ok(Bytes::from(out))
        }
        Compression::Zstd => {
            let out = zstd::decode_all(body)
                .map_err(|e| BatchError::DecompressionFailed(e.to_string()))?;
            if out.len() != uncompressed_len {
                return Err(BatchError::DecompressionFailed(format!(
                    "expected {} bytes, got {}",
                    uncompressed_len,
                    out.len()
                )));
            }
            Ok(Bytes::from(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn flat(s: &str) -> Payload {
        Payload::flat(s.as_bytes().to_vec())
    }

    #[test]
    fn batch_roundtrip_uncompressed() {
        let payloads = vec![flat("one"), flat(""), flat("three")];
        let encoded = encode_batch(&payloads, Compression::None).unwrap();
        assert_eq!(decode_batch(&encoded).unwrap(), payloads);
    }

    #[test]
    fn batch_roundtrip_compressed() {
        let payloads: Vec<Payload> = (0..20).map(|_| flat(&"abc".repeat(50))).collect();
        for c in [Compression::Lz4, Compression::Lz4Hc, Compression::Zstd] {
            let encoded = encode_batch(&payloads, c).unwrap();
            assert_eq!(decode_batch(&encoded).unwrap(), payloads, "{c:?}");
            // Highly repetitive payloads must actually shrink.
            let plain = encode_batch(&payloads, Compression::None).unwrap();
            assert!(encoded.len() < plain.len(), "{c:?} did not compress");
        }
    }

    #[test]
    fn incompressible_batch_falls_back_to_none() {
        let noise: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 3) as u8).collect();
        let payloads = vec![Payload::flat(noise)];
        let encoded = encode_batch(&payloads, Compression::Lz4).unwrap();
        // compression id byte is the second byte of the header
        assert_eq!(encoded[1], Compression::None.id());
        assert_eq!(decode_batch(&encoded).unwrap(), payloads);
    }

    #[test]
    fn batch_roundtrip_payload_groups() {
        let payloads = vec![
            Payload::group(vec![
                ("body", Bytes::from_static(b"hello")),
                ("hdr", Bytes::from_static(b"h1")),
            ]),
            flat("plain-member"),
        ];
        let encoded = encode_batch(&payloads, Compression::Zstd).unwrap();
        assert_eq!(decode_batch(&encoded).unwrap(), payloads);
    }

    #[test]
    fn batch_corruption_detected() {
        let payloads = vec![flat("data")];
        let mut encoded = encode_batch(&payloads, Compression::None).unwrap().to_vec();
        encoded[3] ^= 0x80;
        assert!(matches!(
            decode_batch(&encoded),
            Err(BatchError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn compression_id_stability() {
        assert_eq!(Compression::None.id(), 0x00);
        assert_eq!(Compression::Zstd.id(), 0x01);
        assert_eq!(Compression::Lz4.id(), 0x04);
        assert_eq!(Compression::Lz4Hc.id(), 0x05);
        for c in [
            Compression::None,
            Compression::Zstd,
            Compression::Lz4,
            Compression::Lz4Hc,
        ] {
            assert_eq!(Compression::from_id(c.id()).unwrap(), c);
        }
    }

    #[test]
    fn compression_config_spelling() {
        assert_eq!(Compression::parse("lz4hc"), Some(Compression::Lz4Hc));
        assert_eq!(Compression::parse("gzip"), None);
    }
}
