// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The driver-persistent-mapping (DPM) store adapter.
//!
//! Firmware owns a fixed-size table of identity records that survives power
//! cycles.  This module is the only place the wire encoding exists: a
//! little-endian record struct, a trait for the firmware page I/O, and a
//! shadow table with used/dirty bitmaps that batches writes until an
//! explicit flush.  Policy (what goes in a record, when) lives with the
//! reconciler; this adapter just moves records.

use bitvec::prelude::*;
use thiserror::Error;
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[derive(Debug, Error)]
pub enum DpmIoError {
    #[error("persistent table read failed")]
    ReadFailed,

    #[error("write of persistent record {0} failed")]
    WriteFailed(u16),
}

/// One slot of the firmware-resident persistent mapping table, as it
/// appears on the wire: 24 bytes, little-endian.  A zeroed record
/// (`physical_id == 0`) is unused; clearing and freeing are the same wire
/// state.
#[repr(C, packed)]
#[derive(Copy, Clone, Default, Debug, FromBytes, IntoBytes, Immutable)]
pub struct DpmRecord {
    physical_id: U64,
    phy_bits: U32,
    device_index: U16,
    slot_count: U16,
    missing_count: u8,
    rsvd: [u8; 7],
}

pub const DPM_RECORD_SIZE: usize = 24;
const _: () = assert!(std::mem::size_of::<DpmRecord>() == DPM_RECORD_SIZE);

impl DpmRecord {
    pub fn is_used(&self) -> bool {
        self.physical_id.get() != 0
    }

    pub fn physical_id(&self) -> u64 {
        self.physical_id.get()
    }

    pub fn phy_bits(&self) -> u32 {
        self.phy_bits.get()
    }

    /// Mapping-table index of the identity (an enclosure record's first
    /// slot).
    pub fn device_index(&self) -> u16 {
        self.device_index.get()
    }

    /// Number of contiguous mapping-table entries the record covers; 1 for
    /// devices and volumes.
    pub fn slot_count(&self) -> u16 {
        self.slot_count.get()
    }

    pub fn missing_count(&self) -> u8 {
        self.missing_count
    }

    pub fn set_physical_id(&mut self, id: u64) -> &mut Self {
        self.physical_id = U64::new(id);
        self
    }

    pub fn set_phy_bits(&mut self, bits: u32) -> &mut Self {
        self.phy_bits = U32::new(bits);
        self
    }

    pub fn set_device_index(&mut self, index: u16) -> &mut Self {
        self.device_index = U16::new(index);
        self
    }

    pub fn set_slot_count(&mut self, count: u16) -> &mut Self {
        self.slot_count = U16::new(count);
        self
    }

    pub fn set_missing_count(&mut self, count: u8) -> &mut Self {
        self.missing_count = count;
        self
    }
}

/// The firmware page I/O boundary.  Both calls are synchronous firmware
/// round trips; neither is retried here.
pub trait PersistentStore {
    /// Read the whole table.  Implementations may return fewer records than
    /// the configured capacity; missing tail records are treated as unused.
    fn load(&mut self) -> Result<Vec<DpmRecord>, DpmIoError>;

    fn write_one(
        &mut self,
        index: u16,
        record: &DpmRecord,
    ) -> Result<(), DpmIoError>;
}

/// Shadow of the firmware table plus occupancy and write-back state.
pub struct DpmTable {
    store: Box<dyn PersistentStore>,
    records: Vec<DpmRecord>,
    used: BitVec,
    dirty: BitVec,
    log: slog::Logger,
}

impl DpmTable {
    pub fn new(
        store: Box<dyn PersistentStore>,
        max_entries: u16,
        log: slog::Logger,
    ) -> Self {
        Self {
            store,
            records: vec![DpmRecord::default(); max_entries as usize],
            used: bitvec![0; max_entries as usize],
            dirty: bitvec![0; max_entries as usize],
            log,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.records.len() as u16
    }

    /// Replace the shadow with the firmware's current contents.
    pub fn load(&mut self) -> Result<(), DpmIoError> {
        let loaded = self.store.load()?;
        let capacity = self.records.len();
        self.records.fill(DpmRecord::default());
        self.used.fill(false);
        self.dirty.fill(false);
        for (idx, record) in loaded.into_iter().take(capacity).enumerate() {
            self.used.set(idx, record.is_used());
            self.records[idx] = record;
        }
        Ok(())
    }

    pub fn record(&self, idx: u16) -> &DpmRecord {
        &self.records[idx as usize]
    }

    /// Occupied slots, in index order.
    pub fn entries(&self) -> impl Iterator<Item = (u16, &DpmRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.used[*idx])
            .map(|(idx, record)| (idx as u16, record))
    }

    /// First unoccupied slot.
    pub fn find_free_entry(&self) -> Option<u16> {
        self.used.iter_zeros().next().map(|idx| idx as u16)
    }

    /// Mutate one record in the shadow and stage it for write-back.
    pub fn update(&mut self, idx: u16, f: impl FnOnce(&mut DpmRecord)) {
        let record = &mut self.records[idx as usize];
        f(record);
        let used = record.is_used();
        self.used.set(idx as usize, used);
        self.dirty.set(idx as usize, true);
    }

    /// Zero a record and stage the zeroes for write-back.
    pub fn clear_entry(&mut self, idx: u16) {
        self.records[idx as usize] = DpmRecord::default();
        self.used.set(idx as usize, false);
        self.dirty.set(idx as usize, true);
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.count_ones()
    }

    /// Write every staged record back to firmware, one attempt each.  A
    /// failed write leaves its slot dirty for the next flush.  Returns the
    /// number of slots still dirty.
    pub fn flush_dirty(&mut self) -> usize {
        let mut remaining = 0;
        for idx in 0..self.records.len() {
            if !self.dirty[idx] {
                continue;
            }
            match self.store.write_one(idx as u16, &self.records[idx]) {
                Ok(()) => self.dirty.set(idx, false),
                Err(error) => {
                    remaining += 1;
                    slog::warn!(
                        self.log,
                        "persistent record {} write failed, will retry: {}",
                        idx,
                        error
                    );
                }
            }
        }
        remaining
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    struct FlakyStore {
        records: Vec<DpmRecord>,
        failing: HashSet<u16>,
    }

    impl FlakyStore {
        fn new(capacity: usize) -> Self {
            Self {
                records: vec![DpmRecord::default(); capacity],
                failing: HashSet::new(),
            }
        }
    }

    impl PersistentStore for FlakyStore {
        fn load(&mut self) -> Result<Vec<DpmRecord>, DpmIoError> {
            Ok(self.records.clone())
        }

        fn write_one(
            &mut self,
            index: u16,
            record: &DpmRecord,
        ) -> Result<(), DpmIoError> {
            if self.failing.contains(&index) {
                return Err(DpmIoError::WriteFailed(index));
            }
            self.records[index as usize] = *record;
            Ok(())
        }
    }

    fn log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn record_codec_round_trips() {
        let mut record = DpmRecord::default();
        record
            .set_physical_id(0x5000_C500_1234_5678)
            .set_phy_bits(0x0000_00F0)
            .set_device_index(17)
            .set_slot_count(12)
            .set_missing_count(3);

        let bytes = record.as_bytes();
        assert_eq!(bytes.len(), DPM_RECORD_SIZE);
        // little-endian identity in the first eight bytes
        assert_eq!(bytes[0], 0x78);
        assert_eq!(bytes[7], 0x50);

        let decoded = DpmRecord::read_from_bytes(bytes).unwrap();
        assert_eq!(decoded.physical_id(), 0x5000_C500_1234_5678);
        assert_eq!(decoded.phy_bits(), 0x0000_00F0);
        assert_eq!(decoded.device_index(), 17);
        assert_eq!(decoded.slot_count(), 12);
        assert_eq!(decoded.missing_count(), 3);
    }

    #[test]
    fn zeroed_record_is_unused() {
        assert!(!DpmRecord::default().is_used());
        let mut record = DpmRecord::default();
        record.set_physical_id(1);
        assert!(record.is_used());
    }

    #[test]
    fn failed_writes_stay_dirty() {
        let mut store = FlakyStore::new(8);
        store.failing.insert(2);
        let mut table = DpmTable::new(Box::new(store), 8, log());

        table.update(1, |r| {
            r.set_physical_id(0xAA).set_device_index(1).set_slot_count(1);
        });
        table.update(2, |r| {
            r.set_physical_id(0xBB).set_device_index(2).set_slot_count(1);
        });
        assert_eq!(table.dirty_count(), 2);
        assert_eq!(table.flush_dirty(), 1);
        assert_eq!(table.dirty_count(), 1);

        // a second flush retries only the failed slot; clearing the fault
        // is not observable from here, so just verify it stays staged
        assert_eq!(table.flush_dirty(), 1);
        assert_eq!(table.dirty_count(), 1);
    }

    #[test]
    fn free_entry_search_is_first_fit() {
        let mut table =
            DpmTable::new(Box::new(FlakyStore::new(4)), 4, log());
        assert_eq!(table.find_free_entry(), Some(0));
        table.update(0, |r| {
            r.set_physical_id(0x1).set_device_index(1).set_slot_count(1);
        });
        table.update(2, |r| {
            r.set_physical_id(0x2).set_device_index(2).set_slot_count(1);
        });
        assert_eq!(table.find_free_entry(), Some(1));
        table.clear_entry(0);
        assert_eq!(table.find_free_entry(), Some(0));
    }

    #[test]
    fn load_tolerates_short_tables() {
        let mut store = FlakyStore::new(2);
        store.records[1]
            .set_physical_id(0xCC)
            .set_device_index(3)
            .set_slot_count(1);
        let mut table = DpmTable::new(Box::new(store), 8, log());
        table.load().unwrap();
        let occupied: Vec<u16> =
            table.entries().map(|(idx, _)| idx).collect();
        assert_eq!(occupied, vec![1]);
        assert_eq!(table.find_free_entry(), Some(0));
    }
}
