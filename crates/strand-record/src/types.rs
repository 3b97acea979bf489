//! Log identifiers and sequence numbers.
//!
//! An LSN is a 64-bit value packed as `(epoch:32, esn:32)`; ordering is
//! lexicographic on the pair, which the packing gives us for free.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit opaque log identifier.
///
/// The id space is partitioned: a user range, a reserved internal range,
/// and a metadata-log bit. Every data log has a companion metadata log
/// whose id is the data log id with the metadata bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(pub u64);

impl LogId {
    /// Marks the metadata log of a data log.
    pub const METADATA_BIT: u64 = 1 << 63;

    /// Highest valid user log id.
    pub const MAX_USER: LogId = LogId((1 << 62) - 1);

    /// First id of the reserved internal range.
    pub const INTERNAL_MIN: LogId = LogId(1 << 62);

    /// Last id of the reserved internal range.
    pub const INTERNAL_MAX: LogId = LogId((1 << 62) + 999);

    pub const INVALID: LogId = LogId(0);

    pub fn new(id: u64) -> Self {
        LogId(id)
    }

    pub fn is_valid(self) -> bool {
        let base = LogId(self.0 & !Self::METADATA_BIT);
        base != Self::INVALID && (base <= Self::MAX_USER || base.is_internal())
    }

    /// True for ids in the reserved internal range (ignores the metadata bit).
    pub fn is_internal(self) -> bool {
        let raw = self.0 & !Self::METADATA_BIT;
        raw >= Self::INTERNAL_MIN.0 && raw <= Self::INTERNAL_MAX.0
    }

    pub fn is_metadata(self) -> bool {
        self.0 & Self::METADATA_BIT != 0
    }

    /// The metadata log that tracks this data log's epoch history.
    pub fn metadata_log(self) -> LogId {
        LogId(self.0 | Self::METADATA_BIT)
    }

    /// The data log a metadata log belongs to.
    pub fn data_log(self) -> LogId {
        LogId(self.0 & !Self::METADATA_BIT)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_metadata() {
            write!(f, "M{}", self.0 & !Self::METADATA_BIT)
        } else {
            write!(f, "L{}", self.0)
        }
    }
}

/// Per-log generation counter, bumped on every sequencer activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Epoch(pub u32);

impl Epoch {
    pub const INVALID: Epoch = Epoch(0);
    pub const MIN: Epoch = Epoch(1);
    pub const MAX: Epoch = Epoch(u32::MAX);

    pub fn next(self) -> Epoch {
        Epoch(self.0.saturating_add(1))
    }

    pub fn prev(self) -> Option<Epoch> {
        self.0.checked_sub(1).map(Epoch)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Sequence number within an epoch. Starts at 1; 0 is the invalid sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Esn(pub u32);

impl Esn {
    pub const INVALID: Esn = Esn(0);
    pub const MIN: Esn = Esn(1);
    pub const MAX: Esn = Esn(u32::MAX);

    pub fn next(self) -> Esn {
        Esn(self.0.saturating_add(1))
    }

    pub fn prev(self) -> Option<Esn> {
        self.0.checked_sub(1).map(Esn)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Esn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Log sequence number: `(epoch << 32) | esn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);
    /// The smallest LSN a record can carry (epoch 0, esn 1).
    pub const OLDEST: Lsn = Lsn(1);
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub fn new(epoch: Epoch, esn: Esn) -> Self {
        Lsn(((epoch.0 as u64) << 32) | esn.0 as u64)
    }

    pub fn epoch(self) -> Epoch {
        Epoch((self.0 >> 32) as u32)
    }

    pub fn esn(self) -> Esn {
        Esn(self.0 as u32)
    }

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    pub fn next(self) -> Lsn {
        Lsn(self.0.saturating_add(1))
    }

    pub fn prev(self) -> Lsn {
        Lsn(self.0.saturating_sub(1))
    }

    /// First LSN of the given epoch.
    pub fn first_in_epoch(epoch: Epoch) -> Lsn {
        Lsn::new(epoch, Esn::MIN)
    }

    /// Last possible LSN of the given epoch.
    pub fn last_in_epoch(epoch: Epoch) -> Lsn {
        Lsn::new(epoch, Esn::MAX)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.epoch(), self.esn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_ordering_is_lexicographic_on_epoch_esn() {
        let a = Lsn::new(Epoch(1), Esn(u32::MAX));
        let b = Lsn::new(Epoch(2), Esn(1));
        assert!(a < b);
        assert!(Lsn::new(Epoch(2), Esn(5)) < Lsn::new(Epoch(2), Esn(6)));
    }

    #[test]
    fn lsn_pack_unpack() {
        let lsn = Lsn::new(Epoch(7), Esn(42));
        assert_eq!(lsn.epoch(), Epoch(7));
        assert_eq!(lsn.esn(), Esn(42));
    }

    #[test]
    fn lsn_constants() {
        assert_eq!(Lsn::INVALID.epoch(), Epoch::INVALID);
        assert_eq!(Lsn::INVALID.esn(), Esn::INVALID);
        assert_eq!(Lsn::OLDEST, Lsn::INVALID.next());
        assert_eq!(Lsn::MAX.epoch(), Epoch::MAX);
        assert_eq!(Lsn::MAX.esn(), Esn::MAX);
        assert_eq!(Lsn::MAX.next(), Lsn::MAX);
    }

    #[test]
    fn metadata_log_mapping() {
        let log = LogId::new(42);
        let meta = log.metadata_log();
        assert!(meta.is_metadata());
        assert!(!log.is_metadata());
        assert_eq!(meta.data_log(), log);
    }

    #[test]
    fn internal_range() {
        assert!(!LogId::new(1).is_internal());
        assert!(LogId::INTERNAL_MIN.is_internal());
        assert!(LogId::INTERNAL_MAX.is_internal());
        assert!(!LogId::new(LogId::INTERNAL_MAX.0 + 1).is_internal());
        assert!(LogId::INTERNAL_MIN.metadata_log().is_internal());
    }

    #[test]
    fn display_forms() {
        assert_eq!(Lsn::new(Epoch(3), Esn(9)).to_string(), "e3n9");
        assert_eq!(LogId::new(5).to_string(), "L5");
        assert_eq!(LogId::new(5).metadata_log().to_string(), "M5");
    }
}
