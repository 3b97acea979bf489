//! Where to resume a reader that has stopped making progress.

use strand_record::{Epoch, Esn, Lsn};

/// Computes the LSN to restart a stuck reader from, given the reader's
/// current position and the log's known tail.
///
/// - both invalid: start from the oldest possible record;
/// - tail unknown: skip to the next epoch (the current one may be
///   damaged), saturating at the maximum;
/// - tail in a later epoch: jump to the tail's epoch;
/// - same epoch as the tail: stay put, never re-read.
pub fn next_from_lsn_when_stuck(current: Lsn, tail: Lsn) -> Lsn {
    if !current.is_valid() && !tail.is_valid() {
        return Lsn::OLDEST;
    }
    if !tail.is_valid() {
        if current.epoch() == Epoch::MAX {
            return Lsn::new(Epoch::MAX, Esn::MAX);
        }
        return Lsn::new(current.epoch().next(), Esn::MIN);
    }
    if current.epoch() < tail.epoch() {
        return Lsn::new(tail.epoch(), Esn::MIN);
    }
    current
}
