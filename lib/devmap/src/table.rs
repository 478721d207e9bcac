// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mapping table: a fixed-capacity array of identity entries indexed by
//! target id, plus the free-index and eviction-victim searches the
//! reconciler allocates through.
//!
//! The searches are deliberately plain linear scans.  Their tie-break order
//! (lowest index among equal missing counts, first free slot) is part of the
//! layer's observable behavior and must not change even if the scans are
//! ever replaced with an index structure.

use std::ops::Range;

use crate::bits::{DeviceInfo, MAX_MISSING_COUNT};
use crate::config::{MappingConfig, VolumeMappingRange};
use crate::DevHandle;

/// Stable target identifier handed out by this layer; equal to the entry's
/// index in the mapping table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct TargetId(pub u16);

impl From<u16> for TargetId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<TargetId> for u16 {
    fn from(value: TargetId) -> Self {
        value.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Which address space an identity lives in.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, strum::Display)]
pub enum Channel {
    #[default]
    None,
    Physical,
    Raid,
}

#[derive(Clone, Debug, Default)]
pub struct MappingEntry {
    /// World-wide identifier: SAS address, volume WWID, or (in
    /// enclosure-slot mode) the owning enclosure's logical id.  Zero means
    /// the slot carries no identity.
    pub physical_id: u64,
    pub device_info: DeviceInfo,
    /// Physical link positions this identity may appear on, for
    /// enclosure-wide matching after a reattach.
    pub phy_bits: u32,
    pub channel: Channel,
    /// Current firmware handle; zero while the device is absent.
    pub dev_handle: DevHandle,
    pub missing_count: u8,
    /// Back-reference into the persistent store, if this entry owns a
    /// record there.
    pub dpm_entry: Option<u16>,
    /// Latched once the aging/persistence bookkeeping for the entry's
    /// current state transition has been applied.
    pub init_complete: bool,
    /// Transport Layer Retries bits, pass-through for the command layer.
    pub tlr_bits: u8,
}

impl MappingEntry {
    pub fn is_live(&self) -> bool {
        self.device_info.contains(DeviceInfo::IN_USE)
    }

    pub fn is_reserved(&self) -> bool {
        self.device_info.contains(DeviceInfo::RESERVED)
    }

    /// Free for allocation: neither live nor held back by a reservation.
    pub fn is_free(&self) -> bool {
        !self.device_info
            .intersects(DeviceInfo::IN_USE | DeviceInfo::RESERVED)
    }

    /// Record one "not responding" observation, saturating.
    pub fn age(&mut self) {
        self.missing_count =
            self.missing_count.saturating_add(1).min(MAX_MISSING_COUNT);
    }

    /// Reset to the all-zero unused state.
    pub fn clear(&mut self) {
        *self = MappingEntry::default();
    }
}

pub struct MappingTable {
    entries: Vec<MappingEntry>,
    volume_range: Range<u16>,
    first_usable: u16,
}

impl MappingTable {
    pub fn new(config: &MappingConfig) -> Self {
        let first_usable = config.first_usable_index();
        let volume_range = match config.volume_mapping_range {
            VolumeMappingRange::Low => {
                first_usable..first_usable + config.max_volumes
            }
            VolumeMappingRange::High => {
                config.max_devices - config.max_volumes..config.max_devices
            }
        };
        let mut entries = Vec::new();
        entries.resize_with(config.max_devices as usize, MappingEntry::default);
        if config.reserve_target_id_zero {
            entries[0].device_info |= DeviceInfo::RESERVED;
        }
        Self { entries, volume_range, first_usable }
    }

    pub fn len(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, idx: u16) -> &MappingEntry {
        &self.entries[idx as usize]
    }

    pub fn entry_mut(&mut self, idx: u16) -> &mut MappingEntry {
        &mut self.entries[idx as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &MappingEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (i as u16, e))
    }

    /// The contiguous sub-range reserved for RAID-volume ids.
    pub fn raid_volume_range(&self) -> Range<u16> {
        self.volume_range.clone()
    }

    /// The contiguous sub-range available to physical devices (and
    /// enclosure slot ranges): everything outside the volume range and the
    /// reserved id-zero slot.
    pub fn device_range(&self) -> Range<u16> {
        if self.volume_range.start <= self.first_usable {
            self.volume_range.end.max(self.first_usable)..self.len()
        } else {
            self.first_usable..self.volume_range.start
        }
    }

    pub fn find_by_physical_id(
        &self,
        physical_id: u64,
        channel: Channel,
    ) -> Option<u16> {
        if physical_id == 0 {
            return None;
        }
        self.iter()
            .find(|(_, e)| {
                e.is_live()
                    && e.channel == channel
                    && e.physical_id == physical_id
            })
            .map(|(idx, _)| idx)
    }

    pub fn find_by_handle(&self, handle: DevHandle) -> Option<u16> {
        if handle == 0 {
            return None;
        }
        self.iter()
            .find(|(_, e)| e.is_live() && e.dev_handle == handle)
            .map(|(idx, _)| idx)
    }

    /// First free index at or after `search_start`, confined to the region
    /// (device or volume) `search_start` falls in.
    pub fn find_free_index(&self, search_start: u16) -> Option<u16> {
        let region = if self.volume_range.contains(&search_start) {
            self.volume_range.clone()
        } else {
            self.device_range()
        };
        region
            .filter(|&idx| idx >= search_start)
            .find(|&idx| self.entry(idx).is_free())
    }

    /// Index of the entry with the largest nonzero missing count in
    /// `range`; ties resolve to the lowest index.  Entries held by an
    /// enclosure reservation are never individual victims.
    pub fn find_highest_missing(&self, range: Range<u16>) -> Option<u16> {
        let mut best: Option<(u16, u8)> = None;
        for idx in range {
            if idx >= self.len() {
                break;
            }
            let entry = self.entry(idx);
            if !entry.is_live()
                || entry.is_reserved()
                || entry.missing_count == 0
            {
                continue;
            }
            match best {
                Some((_, count)) if entry.missing_count <= count => {}
                _ => best = Some((idx, entry.missing_count)),
            }
        }
        best.map(|(idx, _)| idx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MappingMode;

    fn small_config() -> MappingConfig {
        MappingConfig {
            max_devices: 8,
            max_enclosures: 4,
            max_volumes: 2,
            max_dpm_entries: 16,
            mapping_mode: MappingMode::DevicePersistence,
            reserve_target_id_zero: true,
            volume_mapping_range: VolumeMappingRange::High,
            persistence_enabled: false,
        }
    }

    fn occupy(table: &mut MappingTable, idx: u16, id: u64, handle: u16) {
        let entry = table.entry_mut(idx);
        entry.physical_id = id;
        entry.channel = Channel::Physical;
        entry.dev_handle = handle;
        entry.device_info |= DeviceInfo::IN_USE;
    }

    #[test]
    fn ranges_partition_the_table() {
        let table = MappingTable::new(&small_config());
        assert_eq!(table.device_range(), 1..6);
        assert_eq!(table.raid_volume_range(), 6..8);

        let low = MappingTable::new(&MappingConfig {
            volume_mapping_range: VolumeMappingRange::Low,
            ..small_config()
        });
        assert_eq!(low.raid_volume_range(), 1..3);
        assert_eq!(low.device_range(), 3..8);
    }

    #[test]
    fn free_search_skips_reserved_zero_and_volume_range() {
        let table = MappingTable::new(&small_config());
        assert_eq!(table.find_free_index(0), Some(1));
        // a start inside the volume range searches only that range
        assert_eq!(table.find_free_index(6), Some(6));
        // the device region ends before the volume range
        assert_eq!(table.find_free_index(5), Some(5));
    }

    #[test]
    fn free_search_exhausts() {
        let mut table = MappingTable::new(&small_config());
        for idx in 1..6 {
            occupy(&mut table, idx, 0x5000_0000 + idx as u64, idx);
        }
        assert_eq!(table.find_free_index(1), None);
        // the volume range is still free
        assert_eq!(table.find_free_index(6), Some(6));
    }

    #[test]
    fn highest_missing_prefers_lowest_index_on_ties() {
        let mut table = MappingTable::new(&small_config());
        for idx in 1..5 {
            occupy(&mut table, idx, 0x5000_0000 + idx as u64, idx);
        }
        table.entry_mut(2).missing_count = 3;
        table.entry_mut(3).missing_count = 3;
        table.entry_mut(4).missing_count = 1;
        assert_eq!(table.find_highest_missing(table.device_range()), Some(2));
        // entries with zero missing count are never victims
        table.entry_mut(2).missing_count = 0;
        table.entry_mut(3).missing_count = 0;
        table.entry_mut(4).missing_count = 0;
        assert_eq!(table.find_highest_missing(table.device_range()), None);
    }

    #[test]
    fn aging_saturates() {
        let mut entry = MappingEntry::default();
        for _ in 0..(MAX_MISSING_COUNT as usize + 5) {
            entry.age();
        }
        assert_eq!(entry.missing_count, MAX_MISSING_COUNT);
    }

    #[test]
    fn lookups_ignore_dead_entries() {
        let mut table = MappingTable::new(&small_config());
        occupy(&mut table, 1, 0x5000_0000_0000_0001, 0x9);
        table.entry_mut(1).device_info.remove(DeviceInfo::IN_USE);
        assert_eq!(
            table.find_by_physical_id(0x5000_0000_0000_0001, Channel::Physical),
            None
        );
        assert_eq!(table.find_by_handle(0x9), None);
    }
}
