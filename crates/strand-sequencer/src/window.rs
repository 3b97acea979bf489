//! The sliding append window and releasable-prefix cursor.
//!
//! A record becomes visible to readers only once every lower esn in its
//! epoch is also replicated. The window tracks in-flight appenders,
//! admits new ones up to a capacity, and advances the released prefix
//! as completions come in.

use std::collections::BTreeMap;
use strand_record::{Epoch, Esn, Lsn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Releasable,
}

#[derive(Debug)]
pub struct AppendWindow {
    epoch: Epoch,
    capacity: usize,
    next_esn: Esn,
    slots: BTreeMap<u32, Slot>,
    /// Highest esn of the contiguous released prefix (0 = none).
    released: u32,
}

impl AppendWindow {
    pub fn new(epoch: Epoch, capacity: usize) -> Self {
        AppendWindow {
            epoch,
            capacity,
            next_esn: Esn::MIN,
            slots: BTreeMap::new(),
            released: 0,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Last released LSN, or INVALID when nothing is released yet.
    pub fn last_released(&self) -> Lsn {
        if self.released == 0 {
            Lsn::INVALID
        } else {
            Lsn::new(self.epoch, Esn(self.released))
        }
    }

    /// Admits one append and assigns the next esn.
    pub fn try_admit(&mut self) -> Option<Lsn> {
        if self.is_full() {
            return None;
        }
        let esn = self.next_esn;
        self.next_esn = esn.next();
        self.slots.insert(esn.as_u32(), Slot::Pending);
        Some(Lsn::new(self.epoch, esn))
    }

    /// Marks an esn fully replicated. Returns the new released LSN if
    /// the prefix advanced.
    pub fn complete(&mut self, esn: Esn) -> Option<Lsn> {
        if let Some(slot) = self.slots.get_mut(&esn.as_u32()) {
            *slot = Slot::Releasable;
        } else {
            return None;
        }
        let before = self.released;
        while let Some(Slot::Releasable) = self.slots.get(&(self.released + 1)) {
            self.released += 1;
            self.slots.remove(&self.released);
        }
        (self.released > before).then(|| Lsn::new(self.epoch, Esn(self.released)))
    }

    /// Drops a failed slot. The prefix can never advance past it; the
    /// epoch stays dirty until recovery.
    pub fn abandon(&mut self, esn: Esn) {
        self.slots.remove(&esn.as_u32());
    }

    /// True when a failed slot left a permanent hole below the highest
    /// assigned esn.
    pub fn is_dirty(&self) -> bool {
        let assigned = self.next_esn.as_u32() - 1;
        let holes = assigned - self.released;
        holes as usize > self.slots.len()
    }
}
