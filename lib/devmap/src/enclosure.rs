// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The enclosure table and the slot-range defragmenter.
//!
//! An enclosure owns one contiguous run of mapping-table entries.  Finding a
//! run for a newly attached enclosure escalates through three passes: reuse
//! a run that already carries this enclosure's identity, take a free run, or
//! evict aged-out enclosures until a run opens up.  The victim order
//! (highest missing count, ties to lowest index, never a currently-present
//! enclosure) is observable behavior and load-bearing for reproducibility.

use std::ops::Range;

use slog::{debug, info};

use crate::bits::DeviceInfo;
use crate::table::MappingTable;
use crate::DevHandle;

#[derive(Clone, Debug, Default)]
pub struct EnclosureEntry {
    /// Enclosure logical (world-wide) id; zero means the entry is unused.
    pub enclosure_id: u64,
    /// Current firmware handle; zero while the enclosure is absent.
    pub enc_handle: DevHandle,
    pub phy_bits: u32,
    /// First mapping-table index of this enclosure's reserved run, once one
    /// has been found.
    pub start_index: Option<u16>,
    pub num_slots: u16,
    /// Bay number of the enclosure's first slot.
    pub start_slot: u16,
    pub dpm_entry: Option<u16>,
    pub missing_count: u8,
    pub init_complete: bool,
    /// Staged for removal once its devices are gone.
    pub removal_flag: bool,
    /// Already visited by the current defragmentation pass.
    pub skip_search: bool,
}

impl EnclosureEntry {
    pub fn slot_range(&self) -> Option<Range<u16>> {
        self.start_index.map(|start| start..start + self.num_slots)
    }

    /// Record one "not responding" observation, saturating.
    pub fn age(&mut self) {
        self.missing_count = self
            .missing_count
            .saturating_add(1)
            .min(crate::bits::MAX_MISSING_COUNT);
    }
}

/// Fixed-capacity, hole-free array of enclosures.  Removal shifts the tail
/// down so iteration order stays index order.
pub struct EnclosureTable {
    entries: Vec<EnclosureEntry>,
    capacity: u16,
}

impl EnclosureTable {
    pub fn new(capacity: u16) -> Self {
        Self { entries: Vec::with_capacity(capacity as usize), capacity }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity as usize
    }

    pub fn get(&self, idx: usize) -> &EnclosureEntry {
        &self.entries[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut EnclosureEntry {
        &mut self.entries[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnclosureEntry> {
        self.entries.iter()
    }

    /// Append a new enclosure; `None` if the table is at capacity.
    pub fn push(&mut self, entry: EnclosureEntry) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        self.entries.push(entry);
        Some(self.entries.len() - 1)
    }

    /// Remove and return the entry at `idx`, compacting the array.
    pub fn remove(&mut self, idx: usize) -> EnclosureEntry {
        self.entries.remove(idx)
    }

    pub fn find_by_id(&self, enclosure_id: u64) -> Option<usize> {
        if enclosure_id == 0 {
            return None;
        }
        self.entries.iter().position(|e| e.enclosure_id == enclosure_id)
    }

    pub fn find_by_handle(&self, handle: DevHandle) -> Option<usize> {
        if handle == 0 {
            return None;
        }
        self.entries.iter().position(|e| e.enc_handle == handle)
    }

    /// Eviction victim: largest nonzero missing count, ties to the lowest
    /// index, skipping enclosures already visited this pass.
    pub fn find_highest_missing(&self) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.skip_search
                || entry.missing_count == 0
                || entry.start_index.is_none()
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

    pub fn clear_search_marks(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.skip_search = false;
        }
    }
}

/// What a successful range reservation displaced.
#[derive(Debug, Default)]
pub struct ReservationOutcome {
    pub start_index: u16,
    /// Enclosures formally evicted to open the window.
    pub evicted: Vec<EnclosureEntry>,
    /// Device handles and store slots freed by those evictions.
    pub removed: Vec<(DevHandle, Option<u16>)>,
}

/// Find and stamp a contiguous mapping-table run for the enclosure at
/// `enc_idx`, escalating through identity reuse, free space, and eviction.
/// Returns `None` (leaving all state untouched) only when every eviction
/// candidate has been tried.
pub fn reserve_enclosure_range(
    table: &mut MappingTable,
    enclosures: &mut EnclosureTable,
    enc_idx: usize,
    log: &slog::Logger,
) -> Option<ReservationOutcome> {
    let needed = enclosures.get(enc_idx).num_slots;
    let enclosure_id = enclosures.get(enc_idx).enclosure_id;
    let phy_bits = enclosures.get(enc_idx).phy_bits;
    if needed == 0 || needed > table.device_range().len() as u16 {
        return None;
    }

    // Pass 1: a run that already carries this enclosure's identity, left
    // behind by rehydration or an earlier eviction.
    if let Some(start) = find_matching_run(table, enclosure_id, phy_bits, needed)
    {
        debug!(
            log,
            "enclosure {:#x} rematched its persisted range at {}",
            enclosure_id,
            start
        );
        stamp_range(table, enclosures, enc_idx, start);
        return Some(ReservationOutcome { start_index: start, ..Default::default() });
    }

    // Pass 2: a plain free run.
    if let Some(start) = find_free_run(table, needed, &[]) {
        stamp_range(table, enclosures, enc_idx, start);
        return Some(ReservationOutcome { start_index: start, ..Default::default() });
    }

    // Pass 3: evict aged enclosures, highest missing count first, treating
    // each provisional victim's range as free until a window fits.  Each
    // iteration marks one more enclosure, so the loop visits each at most
    // once.
    enclosures.clear_search_marks();
    let mut provisional: Vec<usize> = Vec::new();
    let outcome = loop {
        let victim = match enclosures.find_highest_missing() {
            Some(idx) if idx != enc_idx => idx,
            _ => break None,
        };
        enclosures.get_mut(victim).skip_search = true;
        provisional.push(victim);

        let windows: Vec<Range<u16>> = provisional
            .iter()
            .filter_map(|&idx| enclosures.get(idx).slot_range())
            .collect();
        if let Some(start) = find_free_run(table, needed, &windows) {
            let window = start..start + needed;
            break Some(evict_and_stamp(
                table,
                enclosures,
                enc_idx,
                window,
                &provisional,
                log,
            ));
        }
    };
    enclosures.clear_search_marks();
    outcome
}

fn evict_and_stamp(
    table: &mut MappingTable,
    enclosures: &mut EnclosureTable,
    enc_idx: usize,
    window: Range<u16>,
    provisional: &[usize],
    log: &slog::Logger,
) -> ReservationOutcome {
    let mut outcome =
        ReservationOutcome { start_index: window.start, ..Default::default() };

    // Only provisional victims can overlap the window; everyone else's
    // reservation blocked it during the search.  Remove in descending index
    // order so earlier removals don't shift later ones.
    let mut to_evict: Vec<usize> = provisional
        .iter()
        .copied()
        .filter(|&idx| match enclosures.get(idx).slot_range() {
            Some(range) => range.start < window.end && window.start < range.end,
            None => false,
        })
        .collect();
    to_evict.sort_unstable_by(|a, b| b.cmp(a));

    // The caller's enclosure index survives: it has no reserved range yet
    // and enclosure indices above the removed ones shift down uniformly.
    let mut target = enc_idx;
    for idx in to_evict {
        let entry = enclosures.remove(idx);
        if idx < target {
            target -= 1;
        }
        info!(
            log,
            "evicting enclosure {:#x} (missing count {}) from {:?}",
            entry.enclosure_id,
            entry.missing_count,
            entry.slot_range(),
        );
        if let Some(range) = entry.slot_range() {
            for slot in range {
                let mapped = table.entry_mut(slot);
                if mapped.dev_handle != 0 {
                    outcome.removed.push((mapped.dev_handle, mapped.dpm_entry));
                }
                mapped.clear();
            }
        }
        outcome.evicted.push(entry);
    }

    stamp_range(table, enclosures, target, window.start);
    outcome
}

/// Reserve `[start, start + num_slots)` for the enclosure at `enc_idx`.
fn stamp_range(
    table: &mut MappingTable,
    enclosures: &mut EnclosureTable,
    enc_idx: usize,
    start: u16,
) {
    let entry = enclosures.get_mut(enc_idx);
    entry.start_index = Some(start);
    let enclosure_id = entry.enclosure_id;
    let phy_bits = entry.phy_bits;
    let num_slots = entry.num_slots;
    for idx in start..start + num_slots {
        let mapped = table.entry_mut(idx);
        mapped.device_info |= DeviceInfo::RESERVED;
        mapped.physical_id = enclosure_id;
        mapped.phy_bits = phy_bits;
    }
}

fn find_matching_run(
    table: &MappingTable,
    enclosure_id: u64,
    phy_bits: u32,
    needed: u16,
) -> Option<u16> {
    if enclosure_id == 0 {
        return None;
    }
    let compatible = |idx: u16| {
        let entry = table.entry(idx);
        entry.physical_id == enclosure_id
            && (entry.phy_bits & phy_bits != 0 || entry.phy_bits == 0)
    };
    run_search(table.device_range(), needed, compatible)
}

/// First free run of `needed` entries in the device region, treating any
/// index inside `extra_free` as free.
fn find_free_run(
    table: &MappingTable,
    needed: u16,
    extra_free: &[Range<u16>],
) -> Option<u16> {
    let free = |idx: u16| {
        table.entry(idx).is_free()
            || extra_free.iter().any(|range| range.contains(&idx))
    };
    run_search(table.device_range(), needed, free)
}

fn run_search(
    region: Range<u16>,
    needed: u16,
    eligible: impl Fn(u16) -> bool,
) -> Option<u16> {
    if needed == 0 || region.len() < needed as usize {
        return None;
    }
    let mut run_start = region.start;
    let mut run_len = 0u16;
    for idx in region {
        if eligible(idx) {
            if run_len == 0 {
                run_start = idx;
            }
            run_len += 1;
            if run_len == needed {
                return Some(run_start);
            }
        } else {
            run_len = 0;
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{MappingConfig, MappingMode, VolumeMappingRange};
    use slog::{Discard, Logger};

    fn config(max_devices: u16) -> MappingConfig {
        MappingConfig {
            max_devices,
            max_enclosures: 4,
            max_volumes: 2,
            max_dpm_entries: 16,
            mapping_mode: MappingMode::EnclosureSlot,
            reserve_target_id_zero: true,
            volume_mapping_range: VolumeMappingRange::High,
            persistence_enabled: false,
        }
    }

    fn enclosure(id: u64, num_slots: u16) -> EnclosureEntry {
        EnclosureEntry {
            enclosure_id: id,
            enc_handle: id as u16,
            num_slots,
            ..Default::default()
        }
    }

    fn log() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    #[test]
    fn free_run_reservation() {
        let mut table = MappingTable::new(&config(16));
        let mut enclosures = EnclosureTable::new(4);
        let idx = enclosures.push(enclosure(0xA1, 4)).unwrap();

        let outcome =
            reserve_enclosure_range(&mut table, &mut enclosures, idx, &log())
                .unwrap();
        assert_eq!(outcome.start_index, 1);
        assert!(outcome.evicted.is_empty());
        assert_eq!(enclosures.get(idx).slot_range(), Some(1..5));
        for slot in 1..5 {
            assert!(table.entry(slot).is_reserved());
            assert_eq!(table.entry(slot).physical_id, 0xA1);
        }
        // the next enclosure lands after the first
        let idx2 = enclosures.push(enclosure(0xA2, 3)).unwrap();
        let outcome =
            reserve_enclosure_range(&mut table, &mut enclosures, idx2, &log())
                .unwrap();
        assert_eq!(outcome.start_index, 5);
    }

    #[test]
    fn identity_rematch_takes_priority_over_free_space() {
        let mut table = MappingTable::new(&config(16));
        let mut enclosures = EnclosureTable::new(4);
        // a previous life left entries 4..8 stamped with this enclosure's id
        for slot in 4..8 {
            let entry = table.entry_mut(slot);
            entry.physical_id = 0xB7;
            entry.phy_bits = 0xF0;
            entry.device_info |= DeviceInfo::RESERVED;
        }
        let mut reattached = enclosure(0xB7, 4);
        reattached.phy_bits = 0xF0;
        let idx = enclosures.push(reattached).unwrap();

        let outcome =
            reserve_enclosure_range(&mut table, &mut enclosures, idx, &log())
                .unwrap();
        assert_eq!(outcome.start_index, 4);
    }

    #[test]
    fn eviction_prefers_highest_missing_then_lowest_index() {
        let mut table = MappingTable::new(&config(12));
        let mut enclosures = EnclosureTable::new(4);
        // fill the device region 1..10 with three 3-slot enclosures
        for (id, missing) in [(0xC1u64, 2u8), (0xC2, 5), (0xC3, 5)] {
            let mut entry = enclosure(id, 3);
            entry.missing_count = missing;
            let idx = enclosures.push(entry).unwrap();
            reserve_enclosure_range(&mut table, &mut enclosures, idx, &log())
                .unwrap();
        }
        let idx = enclosures.push(enclosure(0xC4, 3)).unwrap();
        let outcome =
            reserve_enclosure_range(&mut table, &mut enclosures, idx, &log())
                .unwrap();
        // 0xC2 and 0xC3 tie at missing count 5; 0xC2 sits at the lower
        // index and is the victim, freeing its exact window
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].enclosure_id, 0xC2);
        assert_eq!(outcome.start_index, 4);
        assert!(enclosures.find_by_id(0xC2).is_none());
        assert!(enclosures.find_by_id(0xC1).is_some());
        assert!(enclosures.find_by_id(0xC3).is_some());
    }

    #[test]
    fn never_evicts_present_enclosures() {
        let mut table = MappingTable::new(&config(8));
        let mut enclosures = EnclosureTable::new(4);
        // 5 usable device entries (1..6); one present enclosure takes 4
        let idx = enclosures.push(enclosure(0xD1, 4)).unwrap();
        reserve_enclosure_range(&mut table, &mut enclosures, idx, &log())
            .unwrap();

        let idx = enclosures.push(enclosure(0xD2, 4)).unwrap();
        assert!(reserve_enclosure_range(
            &mut table,
            &mut enclosures,
            idx,
            &log()
        )
        .is_none());
        // the present enclosure and its range are untouched
        assert_eq!(enclosures.get(0).slot_range(), Some(1..5));
        assert!(table.entry(1).is_reserved());
        assert!(!enclosures.get(0).skip_search);
    }

    #[test]
    fn oversized_request_fails_without_looping() {
        let mut table = MappingTable::new(&config(8));
        let mut enclosures = EnclosureTable::new(4);
        let idx = enclosures.push(enclosure(0xD9, 7)).unwrap();
        // 7 slots can never fit in a 5-entry device region
        assert!(reserve_enclosure_range(
            &mut table,
            &mut enclosures,
            idx,
            &log()
        )
        .is_none());
    }
}
