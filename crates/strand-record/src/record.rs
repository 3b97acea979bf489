//! Record types and the on-wire/on-disk record codec.
//!
//! Record format:
//! - lsn: u64 (little-endian)
//! - timestamp_ms: varint
//! - flags: varint (u32)
//! - nkeys: varint, then per key: kind u8, len varint, bytes
//! - ncounters: varint, then per counter: key u8, value varint (zigzag)
//! - payload: group bit in flags selects flat vs group encoding
//! - crc32c: u32 (little-endian) over everything above

use crate::payload::{Payload, PayloadGroup};
use crate::types::{LogId, Lsn};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("Incomplete record")]
    Incomplete,
    #[error("Invalid key kind: {0}")]
    InvalidKeyKind(u8),
    #[error("Varint overflow")]
    VarintOverflow,
    #[error("Invalid UTF-8 in group key")]
    BadGroupKey,
}

bitflags::bitflags! {
    /// Flags carried by every stored record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecordFlags: u32 {
        /// Synthetic record marking an epoch boundary.
        const BRIDGE = 0x0000_0001;
        /// Plugged hole: the slot holds no user data.
        const HOLE = 0x0000_0002;
        /// Payload is a buffered-writer batch; readers must unbatch.
        const BUFFERED_WRITER_BATCH = 0x0000_0004;
        /// Authoritative copy written during epoch recovery.
        const WRITTEN_BY_RECOVERY = 0x0000_0008;
        /// Payload is a payload group rather than a flat blob.
        const PAYLOAD_GROUP = 0x0000_0010;
        /// Checksum bits. An odd number of the three must be set.
        const CHECKSUM = 0x0000_0100;
        const CHECKSUM_64BIT = 0x0000_0200;
        const CHECKSUM_PARITY = 0x0000_0400;
    }
}

impl RecordFlags {
    const CHECKSUM_BITS: RecordFlags = RecordFlags::CHECKSUM
        .union(RecordFlags::CHECKSUM_64BIT)
        .union(RecordFlags::CHECKSUM_PARITY);

    /// Set the checksum bits for the given kind, parity included.
    pub fn with_checksum(mut self, kind: ChecksumKind) -> Self {
        self.remove(Self::CHECKSUM_BITS);
        self |= match kind {
            ChecksumKind::None => RecordFlags::CHECKSUM_PARITY,
            ChecksumKind::Crc32 => RecordFlags::CHECKSUM,
            ChecksumKind::Crc64 => Self::CHECKSUM_BITS,
        };
        self
    }

    /// Decode the checksum bits; `None` if parity is violated.
    pub fn checksum_kind(self) -> Option<ChecksumKind> {
        let bits = self.intersection(Self::CHECKSUM_BITS);
        if bits == RecordFlags::CHECKSUM_PARITY {
            Some(ChecksumKind::None)
        } else if bits == RecordFlags::CHECKSUM {
            Some(ChecksumKind::Crc32)
        } else if bits == Self::CHECKSUM_BITS {
            Some(ChecksumKind::Crc64)
        } else {
            None
        }
    }
}

/// Checksum coverage advertised in the record flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    None,
    Crc32,
    Crc64,
}

/// Kinds of user-supplied record keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KeyKind {
    /// Key used by time/offset-style lookups.
    FindKey = 0,
    /// Key consulted by server-side read filters.
    Filterable = 1,
}

impl KeyKind {
    fn from_u8(v: u8) -> Result<Self, RecordError> {
        match v {
            0 => Ok(KeyKind::FindKey),
            1 => Ok(KeyKind::Filterable),
            other => Err(RecordError::InvalidKeyKind(other)),
        }
    }
}

/// A fully-formed data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    pub log: LogId,
    pub lsn: Lsn,
    /// Milliseconds since the epoch, assigned by the sequencer.
    pub timestamp_ms: u64,
    pub flags: RecordFlags,
    pub payload: Payload,
    pub keys: BTreeMap<KeyKind, String>,
    pub counters: BTreeMap<u8, i64>,
}

impl DataRecord {
    pub fn new(log: LogId, lsn: Lsn, timestamp_ms: u64, payload: Payload) -> Self {
        let mut flags = RecordFlags::empty();
        if payload.is_group() {
            flags |= RecordFlags::PAYLOAD_GROUP;
        }
        Self {
            log,
            lsn,
            timestamp_ms,
            flags,
            payload,
            keys: BTreeMap::new(),
            counters: BTreeMap::new(),
        }
    }

    /// A bridge record closing out an epoch at `lsn`.
    pub fn bridge(log: LogId, lsn: Lsn, timestamp_ms: u64) -> Self {
        let mut r = Self::new(log, lsn, timestamp_ms, Payload::empty());
        r.flags |= RecordFlags::BRIDGE | RecordFlags::WRITTEN_BY_RECOVERY;
        r
    }

    /// A plugged hole at `lsn`, written by recovery.
    pub fn hole(log: LogId, lsn: Lsn, timestamp_ms: u64) -> Self {
        let mut r = Self::new(log, lsn, timestamp_ms, Payload::empty());
        r.flags |= RecordFlags::HOLE | RecordFlags::WRITTEN_BY_RECOVERY;
        r
    }

    pub fn is_bridge(&self) -> bool {
        self.flags.contains(RecordFlags::BRIDGE)
    }

    pub fn is_hole(&self) -> bool {
        self.flags.contains(RecordFlags::HOLE)
    }

    /// Encodes the record with a crc32c trailer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.lsn.as_u64());
        encode_varint(&mut buf, self.timestamp_ms);

        let mut flags = self.flags;
        flags.set(RecordFlags::PAYLOAD_GROUP, self.payload.is_group());
        encode_varint(&mut buf, flags.bits() as u64);

        encode_varint(&mut buf, self.keys.len() as u64);
        for (kind, key) in &self.keys {
            buf.put_u8(*kind as u8);
            encode_varint(&mut buf, key.len() as u64);
            buf.put_slice(key.as_bytes());
        }

        encode_varint(&mut buf, self.counters.len() as u64);
        for (key, value) in &self.counters {
            buf.put_u8(*key);
            encode_varint(&mut buf, zigzag(*value));
        }

        match &self.payload {
            Payload::Flat(blob) => {
                encode_varint(&mut buf, blob.len() as u64);
                buf.put_slice(blob);
            }
            Payload::Group(group) => encode_group(&mut buf, group),
        }

        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decodes a record, validating the crc32c trailer.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn decode(log: LogId, data: &[u8]) -> Result<(Self, usize), RecordError> {
        if data.len() < 8 + 4 {
            return Err(RecordError::Incomplete);
        }

        let mut cursor = data;
        let lsn = Lsn(cursor.get_u64_le());
        let timestamp_ms = decode_varint(&mut cursor)?;
        let flags = RecordFlags::from_bits_truncate(decode_varint(&mut cursor)? as u32);

        let nkeys = decode_varint(&mut cursor)?;
        let mut keys = BTreeMap::new();
        for _ in 0..nkeys {
            if cursor.is_empty() {
                return Err(RecordError::Incomplete);
            }
            let kind = KeyKind::from_u8(cursor[0])?;
            cursor.advance(1);
            let len = decode_varint(&mut cursor)? as usize;
            let raw = take_bytes(&mut cursor, len)?;
            let key = String::from_utf8(raw.to_vec()).map_err(|_| RecordError::BadGroupKey)?;
            keys.insert(kind, key);
        }

        let ncounters = decode_varint(&mut cursor)?;
        let mut counters = BTreeMap::new();
        for _ in 0..ncounters {
            if cursor.is_empty() {
                return Err(RecordError::Incomplete);
            }
            let key = cursor[0];
            cursor.advance(1);
            let value = unzigzag(decode_varint(&mut cursor)?);
            counters.insert(key, value);
        }

        let payload = if flags.contains(RecordFlags::PAYLOAD_GROUP) {
            Payload::Group(decode_group(&mut cursor)?)
        } else {
            let len = decode_varint(&mut cursor)? as usize;
            Payload::Flat(take_bytes(&mut cursor, len)?)
        };

        let consumed = data.len() - cursor.len() + 4;
        if cursor.len() < 4 {
            return Err(RecordError::Incomplete);
        }
        let stored_crc = cursor.get_u32_le();
        let actual = crc32c::crc32c(&data[..consumed - 4]);
        if stored_crc != actual {
            return Err(RecordError::CrcMismatch {
                expected: stored_crc,
                actual,
            });
        }

        Ok((
            DataRecord {
                log,
                lsn,
                timestamp_ms,
                flags,
                payload,
                keys,
                counters,
            },
            consumed,
        ))
    }
}

/// Why a range of LSNs carries no data records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapKind {
    /// Epoch boundary; the next record is in a higher epoch.
    Bridge,
    /// Slot plugged by recovery with no user data.
    Hole,
    /// The reader is not permitted to see these records.
    AccessDenied,
    /// The range is below the trim point.
    Trim,
    /// The range was lost and cannot be recovered.
    Dataloss,
}

/// A gap delivered to readers in place of data records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapRecord {
    pub log: LogId,
    /// Inclusive range of LSNs the gap covers.
    pub lo: Lsn,
    pub hi: Lsn,
    pub kind: GapKind,
}

impl GapRecord {
    pub fn new(log: LogId, lo: Lsn, hi: Lsn, kind: GapKind) -> Self {
        debug_assert!(lo <= hi);
        Self { log, lo, hi, kind }
    }
}

fn encode_group(buf: &mut BytesMut, group: &PayloadGroup) {
    encode_varint(buf, group.len() as u64);
    for (key, value) in group {
        encode_varint(buf, key.len() as u64);
        buf.put_slice(key.as_bytes());
        encode_varint(buf, value.len() as u64);
        buf.put_slice(value);
    }
}

fn decode_group(cursor: &mut &[u8]) -> Result<PayloadGroup, RecordError> {
    let n = decode_varint(cursor)?;
    let mut group = PayloadGroup::new();
    for _ in 0..n {
        let klen = decode_varint(cursor)? as usize;
        let key = take_bytes(cursor, klen)?;
        let key = String::from_utf8(key.to_vec()).map_err(|_| RecordError::BadGroupKey)?;
        let vlen = decode_varint(cursor)? as usize;
        let value = take_bytes(cursor, vlen)?;
        group.insert(key, value);
    }
    Ok(group)
}

fn take_bytes(cursor: &mut &[u8], len: usize) -> Result<Bytes, RecordError> {
    if cursor.len() < len {
        return Err(RecordError::Incomplete);
    }
    let bytes = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(bytes)
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Encodes a u64 as a varint (LEB128).
pub(crate) fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint (LEB128) from bytes.
pub(crate) fn decode_varint(data: &mut &[u8]) -> Result<u64, RecordError> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        if data.is_empty() {
            return Err(RecordError::Incomplete);
        }
        let byte = data[0];
        data.advance(1);

        if shift >= 64 {
            return Err(RecordError::VarintOverflow);
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Epoch, Esn};
    use bytes::Bytes;

    fn lsn(e: u32, n: u32) -> Lsn {
        Lsn::new(Epoch(e), Esn(n))
    }

    #[test]
    fn record_roundtrip_flat() {
        let record = DataRecord::new(
            LogId::new(1),
            lsn(3, 7),
            1_700_000_000_000,
            Payload::flat(b"hello world".to_vec()),
        );
        let encoded = record.encode();
        let (decoded, consumed) = DataRecord::decode(LogId::new(1), &encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn record_roundtrip_group() {
        let record = DataRecord::new(
            LogId::new(9),
            lsn(1, 1),
            42,
            Payload::group(vec![
                ("body", Bytes::from_static(b"data")),
                ("meta", Bytes::from_static(b"{}")),
            ]),
        );
        let encoded = record.encode();
        let (decoded, _) = DataRecord::decode(LogId::new(9), &encoded).unwrap();
        assert_eq!(decoded.payload, record.payload);
        assert!(decoded.flags.contains(RecordFlags::PAYLOAD_GROUP));
    }

    #[test]
    fn record_roundtrip_keys_and_counters() {
        let mut record = DataRecord::new(LogId::new(2), lsn(1, 5), 10, Payload::flat(vec![0u8; 8]));
        record.keys.insert(KeyKind::FindKey, "k1".to_string());
        record.keys.insert(KeyKind::Filterable, "tenant-7".to_string());
        record.counters.insert(3, -12345);
        record.counters.insert(9, i64::MAX);

        let encoded = record.encode();
        let (decoded, _) = DataRecord::decode(LogId::new(2), &encoded).unwrap();
        assert_eq!(decoded.keys, record.keys);
        assert_eq!(decoded.counters, record.counters);
    }

    #[test]
    fn bridge_and_hole_flags() {
        let b = DataRecord::bridge(LogId::new(1), lsn(2, 8), 0);
        assert!(b.is_bridge());
        assert!(b.flags.contains(RecordFlags::WRITTEN_BY_RECOVERY));
        let h = DataRecord::hole(LogId::new(1), lsn(2, 4), 0);
        assert!(h.is_hole());
        assert!(!h.is_bridge());
    }

    #[test]
    fn corruption_detected() {
        let record = DataRecord::new(LogId::new(1), lsn(1, 1), 5, Payload::flat(b"xyz".to_vec()));
        let mut corrupted = record.encode().to_vec();
        corrupted[10] ^= 0xFF;
        assert!(matches!(
            DataRecord::decode(LogId::new(1), &corrupted),
            Err(RecordError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn truncation_detected() {
        let record = DataRecord::new(LogId::new(1), lsn(1, 1), 5, Payload::flat(b"xyz".to_vec()));
        let encoded = record.encode();
        assert!(matches!(
            DataRecord::decode(LogId::new(1), &encoded[..encoded.len() - 6]),
            Err(RecordError::Incomplete) | Err(RecordError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn checksum_bits_parity() {
        for kind in [ChecksumKind::None, ChecksumKind::Crc32, ChecksumKind::Crc64] {
            let flags = RecordFlags::empty().with_checksum(kind);
            assert_eq!(flags.checksum_kind(), Some(kind));
            let set = flags
                .intersection(RecordFlags::CHECKSUM_BITS)
                .bits()
                .count_ones();
            assert_eq!(set % 2, 1, "checksum bit parity must be odd");
        }
        // Even parity is invalid.
        let bad = RecordFlags::CHECKSUM | RecordFlags::CHECKSUM_PARITY;
        assert_eq!(bad.checksum_kind(), None);
        assert_eq!(RecordFlags::empty().checksum_kind(), None);
    }

    #[test]
    fn zigzag_roundtrip() {
        for v in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }
}
