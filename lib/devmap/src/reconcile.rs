// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event reconciler: consumes topology, enclosure-status, and IR
//! config-change batches, drives the allocator and defragmenter, and keeps
//! the persistent store's shadow in step.
//!
//! [`IdentityMap`] is instantiated once per controller and owns all four
//! tables.  Mutation entry points are `&mut self` and run to completion;
//! the caller serializes batches and keeps lookups off other threads while
//! one is in flight.  Memory state leads store state: records go dirty
//! during a batch and reach firmware only at [`IdentityMap::flush_dirty`],
//! so the table is eventually persistent, not transactional.

use slog::{debug, error, info, warn};
use thiserror::Error;

use crate::bits::{DeviceInfo, MAX_MISSING_COUNT};
use crate::config::{ConfigError, MappingConfig, MappingMode};
use crate::dpm::{DpmRecord, DpmTable, PersistentStore};
use crate::enclosure::{
    reserve_enclosure_range, EnclosureEntry, EnclosureTable,
};
use crate::events::{
    DeviceDirectory, DeviceDescriptor, DirectoryError, EnclosureReason,
    EnclosureStatusEvent, IrConfigChangeEvent, IrReason, TopoReason,
    TopologyChangeEvent,
};
use crate::table::{Channel, MappingTable, TargetId};
use crate::DevHandle;

#[derive(Debug, Error)]
pub enum MapError {
    /// Table full and no aged entry to evict.  The caller should flush
    /// dirty records and request a full re-enumeration.
    #[error("mapping table exhausted, no eviction candidate")]
    AllocationExhausted,

    #[error("enclosure table full")]
    EnclosureTableFull,

    /// A suspicious update would have collided with a live identity; the
    /// existing mapping wins and the update is dropped.
    #[error("identity {physical_id:#018x} conflicts on channel {channel}")]
    IdentityConflict { physical_id: u64, channel: Channel },

    #[error("parent enclosure {0:#06x} is not mapped yet")]
    EnclosureNotMapped(DevHandle),

    #[error("bay {slot} falls outside its enclosure's slot range")]
    SlotOutOfRange { slot: u16 },

    #[error("device reported a null identity")]
    NullIdentity,

    #[error("no volume index range is configured")]
    NoVolumeRange,

    #[error("persistent record spans {start}..{end}, outside the table")]
    RecordOutOfRange { start: u16, end: u32 },

    #[error("device directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

/// Result of replaying one event batch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// At least one event failed for want of table space; the driver should
    /// flush dirty records and ask firmware for a full re-enumeration,
    /// which regenerates the batch.
    pub needs_full_replay: bool,
    /// Events dropped or failed in this batch.
    pub failed: usize,
}

/// Handle and store slot of an identity cleared during a batch, parked
/// until the driver collects it for target cleanup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RemovalEntry {
    pub dev_handle: DevHandle,
    pub dpm_entry: Option<u16>,
}

/// Per-controller identity state: the mapping and enclosure tables, the
/// removal scratch list, and the persistent-store shadow.
pub struct IdentityMap {
    config: MappingConfig,
    table: MappingTable,
    enclosures: EnclosureTable,
    removal: Vec<RemovalEntry>,
    dpm: Option<DpmTable>,
    log: slog::Logger,
}

impl IdentityMap {
    pub fn new(
        config: MappingConfig,
        log: slog::Logger,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let table = MappingTable::new(&config);
        let enclosures = EnclosureTable::new(config.max_enclosures);
        Ok(Self {
            config,
            table,
            enclosures,
            removal: Vec::new(),
            dpm: None,
            log,
        })
    }

    /// Attach the firmware persistent-table backend.  A no-op when
    /// persistence is disabled by configuration.
    pub fn attach_store(&mut self, store: Box<dyn PersistentStore>) {
        if !self.config.persistence_enabled {
            info!(self.log, "persistence disabled by configuration");
            return;
        }
        self.dpm = Some(DpmTable::new(
            store,
            self.config.max_dpm_entries,
            self.log.clone(),
        ));
    }

    /// Read the persistent table and rebuild identity state from it.  A
    /// read failure disables persistence for the rest of the session;
    /// in-memory operation continues.
    pub fn load_persistent(&mut self) {
        let Some(dpm) = self.dpm.as_mut() else {
            return;
        };
        if let Err(e) = dpm.load() {
            error!(
                self.log,
                "persistent mapping unavailable, continuing in memory: {}", e
            );
            self.dpm = None;
            return;
        }
        let records: Vec<(u16, DpmRecord)> =
            dpm.entries().map(|(idx, record)| (idx, *record)).collect();
        for (slot, record) in records {
            if let Err(e) = self.rehydrate_record(slot, &record) {
                warn!(
                    self.log,
                    "discarding persistent record {}: {}", slot, e
                );
                if let Some(dpm) = self.dpm.as_mut() {
                    dpm.clear_entry(slot);
                }
            }
        }
    }

    fn rehydrate_record(
        &mut self,
        slot: u16,
        record: &DpmRecord,
    ) -> Result<(), MapError> {
        let start = record.device_index();
        let count = record.slot_count().max(1);
        let end = start as u32 + count as u32;
        if end > self.table.len() as u32 {
            return Err(MapError::RecordOutOfRange { start, end });
        }

        let volume_range = self.table.raid_volume_range();
        if volume_range.contains(&start) {
            // RAID volume record
            if self
                .table
                .find_by_physical_id(record.physical_id(), Channel::Raid)
                .is_some()
                || self.table.entry(start).is_live()
            {
                return Err(MapError::IdentityConflict {
                    physical_id: record.physical_id(),
                    channel: Channel::Raid,
                });
            }
            let entry = self.table.entry_mut(start);
            entry.physical_id = record.physical_id();
            entry.phy_bits = record.phy_bits();
            entry.channel = Channel::Raid;
            entry.device_info |= DeviceInfo::IN_USE;
            entry.missing_count = record.missing_count();
            entry.dpm_entry = Some(slot);
            entry.init_complete = false;
            return Ok(());
        }

        match self.config.mapping_mode {
            MappingMode::EnclosureSlot => {
                let window = start..end as u16;
                if volume_range.start < window.end
                    && window.start < volume_range.end
                {
                    return Err(MapError::RecordOutOfRange { start, end });
                }
                let overlapping = self.enclosures.iter().any(|e| {
                    e.enclosure_id == record.physical_id()
                        || e.slot_range().is_some_and(|r| {
                            r.start < window.end && window.start < r.end
                        })
                });
                if overlapping {
                    return Err(MapError::IdentityConflict {
                        physical_id: record.physical_id(),
                        channel: Channel::Physical,
                    });
                }
                let pushed = self.enclosures.push(EnclosureEntry {
                    enclosure_id: record.physical_id(),
                    phy_bits: record.phy_bits(),
                    start_index: Some(start),
                    num_slots: count,
                    dpm_entry: Some(slot),
                    missing_count: record.missing_count(),
                    ..Default::default()
                });
                if pushed.is_none() {
                    return Err(MapError::EnclosureTableFull);
                }
                for idx in window {
                    let entry = self.table.entry_mut(idx);
                    entry.device_info |= DeviceInfo::RESERVED;
                    entry.physical_id = record.physical_id();
                    entry.phy_bits = record.phy_bits();
                }
                Ok(())
            }
            MappingMode::DevicePersistence => {
                if self
                    .table
                    .find_by_physical_id(
                        record.physical_id(),
                        Channel::Physical,
                    )
                    .is_some()
                    || !self.table.entry(start).is_free()
                {
                    return Err(MapError::IdentityConflict {
                        physical_id: record.physical_id(),
                        channel: Channel::Physical,
                    });
                }
                let entry = self.table.entry_mut(start);
                entry.physical_id = record.physical_id();
                entry.phy_bits = record.phy_bits();
                entry.channel = Channel::Physical;
                entry.device_info |= DeviceInfo::IN_USE;
                entry.missing_count = record.missing_count();
                entry.dpm_entry = Some(slot);
                entry.init_complete = false;
                Ok(())
            }
        }
    }

    /// Age every rehydrated identity the driver's first full enumeration
    /// did not re-report, and latch its init bookkeeping.  Called once,
    /// after initial discovery settles.
    pub fn complete_initial_discovery(&mut self) {
        for idx in 0..self.table.len() {
            let entry = self.table.entry_mut(idx);
            if !entry.is_live() || entry.init_complete {
                continue;
            }
            if entry.dev_handle == 0 {
                entry.age();
                let (dpm_entry, missing) =
                    (entry.dpm_entry, entry.missing_count);
                Self::persist_missing(&mut self.dpm, dpm_entry, missing);
            }
            self.table.entry_mut(idx).init_complete = true;
        }
        for idx in 0..self.enclosures.len() {
            let entry = self.enclosures.get_mut(idx);
            if entry.enclosure_id == 0 || entry.init_complete {
                continue;
            }
            if entry.enc_handle == 0 {
                entry.age();
                let (dpm_entry, missing) =
                    (entry.dpm_entry, entry.missing_count);
                Self::persist_missing(&mut self.dpm, dpm_entry, missing);
            }
            self.enclosures.get_mut(idx).init_complete = true;
        }
    }

    /// Replay one topology-change batch.
    pub fn process_topology_change(
        &mut self,
        event: &TopologyChangeEvent,
        directory: &dyn DeviceDirectory,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        debug!(
            self.log,
            "topology change: enclosure {:#06x} expander {:#06x}, {} entries",
            event.enclosure_handle,
            event.expander_handle,
            event.entries.len()
        );

        // Aging pass: every departed handle first, so re-adds later in the
        // same batch see current missing counts.
        for phy in &event.entries {
            if phy.reason != TopoReason::NotResponding || phy.dev_handle == 0 {
                continue;
            }
            match self.table.find_by_handle(phy.dev_handle) {
                Some(idx) => self.age_entry(idx),
                None => debug!(
                    self.log,
                    "not-responding for unmapped handle {:#06x}",
                    phy.dev_handle
                ),
            }
        }

        // Discovery, reservation, and commit per added handle.
        for phy in &event.entries {
            if phy.reason != TopoReason::Added || phy.dev_handle == 0 {
                continue;
            }
            match self.map_added_device(event, phy.dev_handle, directory) {
                Ok(id) => debug!(
                    self.log,
                    "handle {:#06x} mapped to target {}", phy.dev_handle, id
                ),
                Err(MapError::AllocationExhausted) => {
                    outcome.failed += 1;
                    outcome.needs_full_replay = true;
                    warn!(
                        self.log,
                        "no index for handle {:#06x}, requesting replay",
                        phy.dev_handle
                    );
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!(
                        self.log,
                        "dropping add of handle {:#06x}: {}", phy.dev_handle, e
                    );
                }
            }
        }

        self.clear_removed_enclosures();
        outcome
    }

    /// Replay one enclosure status change.
    pub fn process_enclosure_status(
        &mut self,
        event: &EnclosureStatusEvent,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        match event.reason {
            EnclosureReason::Added => {
                if let Some(idx) =
                    self.enclosures.find_by_id(event.logical_id)
                {
                    let entry = self.enclosures.get_mut(idx);
                    entry.enc_handle = event.enclosure_handle;
                    entry.start_slot = event.start_slot;
                    entry.missing_count = 0;
                    entry.removal_flag = false;
                    entry.init_complete = true;
                    if entry.start_index.is_none() {
                        entry.num_slots = event.num_slots;
                        entry.phy_bits = event.phy_bits;
                    } else if entry.num_slots != event.num_slots {
                        // Geometry changed under a reserved range; keep the
                        // persisted shape so existing ids stay put.
                        warn!(
                            self.log,
                            "enclosure {:#x} reports {} slots, keeping \
                             mapped {}",
                            event.logical_id,
                            event.num_slots,
                            entry.num_slots
                        );
                    }
                    let (dpm_entry, missing) =
                        (entry.dpm_entry, entry.missing_count);
                    Self::persist_missing(&mut self.dpm, dpm_entry, missing);
                } else if self.enclosures.is_full() {
                    outcome.failed += 1;
                    warn!(
                        self.log,
                        "enclosure table full, dropping enclosure {:#x}",
                        event.logical_id
                    );
                } else {
                    self.enclosures.push(EnclosureEntry {
                        enclosure_id: event.logical_id,
                        enc_handle: event.enclosure_handle,
                        phy_bits: event.phy_bits,
                        num_slots: event.num_slots,
                        start_slot: event.start_slot,
                        init_complete: true,
                        ..Default::default()
                    });
                }
            }
            EnclosureReason::NotResponding => {
                match self.enclosures.find_by_handle(event.enclosure_handle) {
                    Some(idx) => {
                        let entry = self.enclosures.get_mut(idx);
                        entry.age();
                        entry.enc_handle = 0;
                        entry.removal_flag = true;
                        entry.init_complete = true;
                        let (dpm_entry, missing) =
                            (entry.dpm_entry, entry.missing_count);
                        Self::persist_missing(
                            &mut self.dpm,
                            dpm_entry,
                            missing,
                        );
                    }
                    None => debug!(
                        self.log,
                        "not-responding for unmapped enclosure {:#06x}",
                        event.enclosure_handle
                    ),
                }
            }
        }
        outcome
    }

    /// Replay one Integrated-RAID configuration change batch.
    pub fn process_ir_config_change(
        &mut self,
        event: &IrConfigChangeEvent,
        directory: &dyn DeviceDirectory,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut consumed = vec![false; event.elements.len()];

        for i in 0..event.elements.len() {
            if consumed[i] {
                continue;
            }
            let element = event.elements[i];
            match element.reason {
                IrReason::Added | IrReason::VolumeCreated => {
                    let wwid = match directory
                        .get_volume_wwid(element.volume_handle)
                    {
                        Ok(0) => {
                            outcome.failed += 1;
                            warn!(
                                self.log,
                                "volume {:#06x} reported a null wwid",
                                element.volume_handle
                            );
                            continue;
                        }
                        Ok(wwid) => wwid,
                        Err(e) => {
                            outcome.failed += 1;
                            warn!(
                                self.log,
                                "dropping volume {:#06x}: {}",
                                element.volume_handle,
                                e
                            );
                            continue;
                        }
                    };
                    // A volume reported twice in one batch gets one index:
                    // consume later duplicates, first occurrence wins.
                    for j in (i + 1)..event.elements.len() {
                        let other = event.elements[j];
                        if consumed[j]
                            || !matches!(
                                other.reason,
                                IrReason::Added | IrReason::VolumeCreated
                            )
                        {
                            continue;
                        }
                        if matches!(
                            directory.get_volume_wwid(other.volume_handle),
                            Ok(w) if w == wwid
                        ) {
                            consumed[j] = true;
                        }
                    }
                    match self.map_volume(wwid, element.volume_handle) {
                        Ok(id) => debug!(
                            self.log,
                            "volume {:#018x} mapped to target {}", wwid, id
                        ),
                        Err(MapError::AllocationExhausted) => {
                            outcome.failed += 1;
                            outcome.needs_full_replay = true;
                            warn!(
                                self.log,
                                "no volume index for {:#018x}, requesting \
                                 replay",
                                wwid
                            );
                        }
                        Err(e) => {
                            outcome.failed += 1;
                            warn!(
                                self.log,
                                "dropping volume {:#018x}: {}", wwid, e
                            );
                        }
                    }
                }
                IrReason::Removed => {
                    match self.find_volume_by_handle(element.volume_handle) {
                        Some(idx) => self.age_entry(idx),
                        None => debug!(
                            self.log,
                            "removal of unmapped volume {:#06x}",
                            element.volume_handle
                        ),
                    }
                }
                IrReason::VolumeDeleted => {
                    // Deletion is authoritative: no missing-count grace.
                    match self.find_volume_by_handle(element.volume_handle) {
                        Some(idx) => self.evict_entry(idx),
                        None => debug!(
                            self.log,
                            "deletion of unmapped volume {:#06x}",
                            element.volume_handle
                        ),
                    }
                }
                IrReason::NoChange => {}
            }
        }
        outcome
    }

    /// Write every dirty persistent record back to firmware; returns the
    /// number of records still dirty afterwards.
    pub fn flush_dirty(&mut self) -> usize {
        match self.dpm.as_mut() {
            Some(dpm) => dpm.flush_dirty(),
            None => 0,
        }
    }

    /// Drain the handles cleared since the last call, for target cleanup.
    pub fn take_removal_entries(&mut self) -> Vec<RemovalEntry> {
        std::mem::take(&mut self.removal)
    }

    pub fn persistence_active(&self) -> bool {
        self.dpm.is_some()
    }

    //
    // Read-only lookups.  Callers must not race these with a mutation.
    //

    pub fn id_for_sas_device(
        &self,
        sas_address: u64,
        handle: DevHandle,
    ) -> Option<TargetId> {
        let idx = match self.config.mapping_mode {
            // Slot entries carry the enclosure's identity, so the handle is
            // the device's only name here.
            MappingMode::EnclosureSlot => self
                .table
                .find_by_handle(handle)
                .filter(|&i| self.table.entry(i).channel == Channel::Physical),
            MappingMode::DevicePersistence => {
                self.table.find_by_physical_id(sas_address, Channel::Physical)
            }
        }?;
        Some(TargetId(idx))
    }

    pub fn id_for_handle(&self, handle: DevHandle) -> Option<TargetId> {
        self.table.find_by_handle(handle).map(TargetId)
    }

    pub fn id_for_raid_volume(
        &self,
        wwid: u64,
        handle: DevHandle,
    ) -> Option<TargetId> {
        self.table
            .find_by_physical_id(wwid, Channel::Raid)
            .or_else(|| self.find_volume_by_handle(handle))
            .map(TargetId)
    }

    pub fn id_for_volume_handle(
        &self,
        handle: DevHandle,
    ) -> Option<TargetId> {
        self.find_volume_by_handle(handle).map(TargetId)
    }

    /// TLR capability bits for a mapped target, for the command layer.
    pub fn tlr_bits(&self, id: TargetId) -> u8 {
        self.table.entry(id.0).tlr_bits
    }

    pub fn set_tlr_bits(&mut self, id: TargetId, bits: u8) {
        self.table.entry_mut(id.0).tlr_bits = bits;
    }

    pub fn mapping_table(&self) -> &MappingTable {
        &self.table
    }

    pub fn enclosure_table(&self) -> &EnclosureTable {
        &self.enclosures
    }

    /// Log the live contents of both tables.
    pub fn dump_state(&self) {
        for (idx, entry) in self.table.iter() {
            if !entry.is_live() {
                continue;
            }
            info!(
                self.log,
                "target {}: id {:#018x} handle {:#06x} {} missing {}",
                idx,
                entry.physical_id,
                entry.dev_handle,
                entry.channel,
                entry.missing_count
            );
        }
        for entry in self.enclosures.iter() {
            info!(
                self.log,
                "enclosure {:#018x}: handle {:#06x} range {:?} missing {}",
                entry.enclosure_id,
                entry.enc_handle,
                entry.slot_range(),
                entry.missing_count
            );
        }
    }

    //
    // Internals.
    //

    fn find_volume_by_handle(&self, handle: DevHandle) -> Option<u16> {
        self.table
            .find_by_handle(handle)
            .filter(|&idx| self.table.entry(idx).channel == Channel::Raid)
    }

    fn persist_missing(
        dpm: &mut Option<DpmTable>,
        slot: Option<u16>,
        missing: u8,
    ) {
        if let (Some(dpm), Some(slot)) = (dpm.as_mut(), slot) {
            dpm.update(slot, |record| {
                record.set_missing_count(missing);
            });
        }
    }

    /// Age one live entry: bump its missing count, forget its handle, park
    /// the handle for cleanup, and stage the new count for write-back when
    /// the entry owns a persistent record.
    fn age_entry(&mut self, idx: u16) {
        let entry = self.table.entry_mut(idx);
        if !entry.is_live() {
            return;
        }
        let handle = entry.dev_handle;
        entry.age();
        entry.dev_handle = 0;
        entry.init_complete = true;
        let (dpm_entry, missing) = (entry.dpm_entry, entry.missing_count);
        debug!(
            self.log,
            "target {} missing (count {}), handle {:#06x} parked",
            idx,
            missing,
            handle
        );
        if handle != 0 {
            self.removal.push(RemovalEntry { dev_handle: handle, dpm_entry });
        }
        Self::persist_missing(&mut self.dpm, dpm_entry, missing);
    }

    /// Clear one live entry outright, freeing its persistent record.
    fn evict_entry(&mut self, idx: u16) {
        let entry = self.table.entry_mut(idx);
        let handle = entry.dev_handle;
        let dpm_entry = entry.dpm_entry;
        info!(
            self.log,
            "clearing target {} (id {:#018x}, missing {})",
            idx,
            entry.physical_id,
            entry.missing_count
        );
        entry.clear();
        if handle != 0 {
            self.removal.push(RemovalEntry { dev_handle: handle, dpm_entry });
        }
        if let (Some(dpm), Some(slot)) = (self.dpm.as_mut(), dpm_entry) {
            dpm.clear_entry(slot);
        }
    }

    fn map_added_device(
        &mut self,
        event: &TopologyChangeEvent,
        handle: DevHandle,
        directory: &dyn DeviceDirectory,
    ) -> Result<TargetId, MapError> {
        let descriptor = directory.get_device_info(handle)?;
        let physical_id = if descriptor
            .device_info
            .contains(DeviceInfo::SATA_DEVICE | DeviceInfo::END_DEVICE)
        {
            directory
                .resolve_sata_sas_address(handle, descriptor.device_info)?
        } else {
            descriptor.sas_address
        };
        if physical_id == 0 {
            return Err(MapError::NullIdentity);
        }

        match self.config.mapping_mode {
            MappingMode::EnclosureSlot => self.map_enclosure_slot_device(
                event.enclosure_handle,
                handle,
                &descriptor,
            ),
            MappingMode::DevicePersistence => {
                self.map_persistent_device(handle, physical_id, &descriptor)
            }
        }
    }

    fn map_enclosure_slot_device(
        &mut self,
        enclosure_handle: DevHandle,
        handle: DevHandle,
        descriptor: &DeviceDescriptor,
    ) -> Result<TargetId, MapError> {
        let enc_idx = self
            .enclosures
            .find_by_handle(enclosure_handle)
            .ok_or(MapError::EnclosureNotMapped(enclosure_handle))?;

        if self.enclosures.get(enc_idx).start_index.is_none() {
            let outcome = reserve_enclosure_range(
                &mut self.table,
                &mut self.enclosures,
                enc_idx,
                &self.log,
            )
            .ok_or(MapError::AllocationExhausted)?;
            for (dev_handle, dpm_entry) in outcome.removed {
                self.removal.push(RemovalEntry { dev_handle, dpm_entry });
            }
            for evicted in &outcome.evicted {
                if let (Some(dpm), Some(slot)) =
                    (self.dpm.as_mut(), evicted.dpm_entry)
                {
                    dpm.clear_entry(slot);
                }
            }
        }
        // Eviction may have compacted the table; re-resolve the enclosure.
        let enc_idx = self
            .enclosures
            .find_by_handle(enclosure_handle)
            .ok_or(MapError::EnclosureNotMapped(enclosure_handle))?;
        let enclosure = self.enclosures.get(enc_idx);
        let start_index = enclosure
            .start_index
            .ok_or(MapError::EnclosureNotMapped(enclosure_handle))?;

        let offset = descriptor
            .slot
            .checked_sub(enclosure.start_slot)
            .filter(|&off| off < enclosure.num_slots)
            .ok_or(MapError::SlotOutOfRange { slot: descriptor.slot })?;
        let idx = start_index + offset;
        let enclosure_id = enclosure.enclosure_id;
        let phy_bits = enclosure.phy_bits;

        let current = self.table.entry(idx);
        if current.is_live()
            && current.dev_handle == handle
            && current.missing_count == 0
            && current.init_complete
        {
            return Ok(TargetId(idx));
        }
        if current.is_live()
            && current.dev_handle != 0
            && current.dev_handle != handle
        {
            return Err(MapError::IdentityConflict {
                physical_id: enclosure_id,
                channel: Channel::Physical,
            });
        }
        if let Some(other) = self.table.find_by_handle(handle) {
            if other != idx {
                return Err(MapError::IdentityConflict {
                    physical_id: enclosure_id,
                    channel: Channel::Physical,
                });
            }
        }

        let entry = self.table.entry_mut(idx);
        entry.physical_id = enclosure_id;
        entry.phy_bits = phy_bits;
        entry.channel = Channel::Physical;
        entry.dev_handle = handle;
        entry.device_info = descriptor.device_info
            | DeviceInfo::IN_USE
            | DeviceInfo::RESERVED;
        entry.missing_count = 0;
        entry.init_complete = true;
        entry.dpm_entry = None;

        self.persist_enclosure(enc_idx);
        Ok(TargetId(idx))
    }

    /// Ensure the enclosure owns a persistent record and stage its current
    /// shape there.
    fn persist_enclosure(&mut self, enc_idx: usize) {
        let Some(dpm) = self.dpm.as_mut() else {
            return;
        };
        let enclosure = self.enclosures.get_mut(enc_idx);
        let Some(start_index) = enclosure.start_index else {
            return;
        };
        let slot = match enclosure.dpm_entry.or_else(|| dpm.find_free_entry())
        {
            Some(slot) => slot,
            None => {
                warn!(
                    self.log,
                    "persistent table full, enclosure {:#x} not persisted",
                    enclosure.enclosure_id
                );
                return;
            }
        };
        enclosure.dpm_entry = Some(slot);
        let (id, bits, slots, missing) = (
            enclosure.enclosure_id,
            enclosure.phy_bits,
            enclosure.num_slots,
            enclosure.missing_count,
        );
        dpm.update(slot, |record| {
            record
                .set_physical_id(id)
                .set_phy_bits(bits)
                .set_device_index(start_index)
                .set_slot_count(slots)
                .set_missing_count(missing);
        });
    }

    fn map_persistent_device(
        &mut self,
        handle: DevHandle,
        physical_id: u64,
        descriptor: &DeviceDescriptor,
    ) -> Result<TargetId, MapError> {
        if let Some(idx) =
            self.table.find_by_physical_id(physical_id, Channel::Physical)
        {
            // Known identity: idempotent when nothing changed, otherwise a
            // re-add that resets aging.
            let entry = self.table.entry_mut(idx);
            if entry.dev_handle == handle
                && entry.missing_count == 0
                && entry.init_complete
            {
                return Ok(TargetId(idx));
            }
            entry.dev_handle = handle;
            entry.device_info =
                descriptor.device_info | DeviceInfo::IN_USE;
            entry.missing_count = 0;
            entry.init_complete = true;
            let dpm_entry = entry.dpm_entry;
            Self::persist_missing(&mut self.dpm, dpm_entry, 0);
            return Ok(TargetId(idx));
        }

        if self.table.find_by_handle(handle).is_some() {
            return Err(MapError::IdentityConflict {
                physical_id,
                channel: Channel::Physical,
            });
        }

        let search_start = self.table.device_range().start;
        let idx = match self.table.find_free_index(search_start) {
            Some(idx) => idx,
            None => {
                let victim = self
                    .table
                    .find_highest_missing(self.table.device_range())
                    .ok_or(MapError::AllocationExhausted)?;
                self.evict_entry(victim);
                victim
            }
        };

        let entry = self.table.entry_mut(idx);
        entry.physical_id = physical_id;
        entry.phy_bits = 0;
        entry.channel = Channel::Physical;
        entry.dev_handle = handle;
        entry.device_info = descriptor.device_info | DeviceInfo::IN_USE;
        entry.missing_count = 0;
        entry.init_complete = true;

        if let Some(dpm) = self.dpm.as_mut() {
            match dpm.find_free_entry() {
                Some(slot) => {
                    self.table.entry_mut(idx).dpm_entry = Some(slot);
                    dpm.update(slot, |record| {
                        record
                            .set_physical_id(physical_id)
                            .set_phy_bits(0)
                            .set_device_index(idx)
                            .set_slot_count(1)
                            .set_missing_count(0);
                    });
                }
                None => warn!(
                    self.log,
                    "persistent table full, device {:#018x} not persisted",
                    physical_id
                ),
            }
        }
        Ok(TargetId(idx))
    }

    fn map_volume(
        &mut self,
        wwid: u64,
        handle: DevHandle,
    ) -> Result<TargetId, MapError> {
        let range = self.table.raid_volume_range();
        if range.is_empty() {
            return Err(MapError::NoVolumeRange);
        }

        if let Some(idx) = self.table.find_by_physical_id(wwid, Channel::Raid)
        {
            let entry = self.table.entry_mut(idx);
            if entry.dev_handle == handle
                && entry.missing_count == 0
                && entry.init_complete
            {
                return Ok(TargetId(idx));
            }
            entry.dev_handle = handle;
            entry.device_info |= DeviceInfo::IN_USE;
            entry.missing_count = 0;
            entry.init_complete = true;
            let dpm_entry = entry.dpm_entry;
            Self::persist_missing(&mut self.dpm, dpm_entry, 0);
            return Ok(TargetId(idx));
        }

        if self.find_volume_by_handle(handle).is_some() {
            return Err(MapError::IdentityConflict {
                physical_id: wwid,
                channel: Channel::Raid,
            });
        }

        let idx = match self.table.find_free_index(range.start) {
            Some(idx) => idx,
            None => {
                let victim = self
                    .table
                    .find_highest_missing(range)
                    .ok_or(MapError::AllocationExhausted)?;
                self.evict_entry(victim);
                victim
            }
        };

        let entry = self.table.entry_mut(idx);
        entry.physical_id = wwid;
        entry.phy_bits = 0;
        entry.channel = Channel::Raid;
        entry.dev_handle = handle;
        entry.device_info |= DeviceInfo::IN_USE;
        entry.missing_count = 0;
        entry.init_complete = true;

        if let Some(dpm) = self.dpm.as_mut() {
            match dpm.find_free_entry() {
                Some(slot) => {
                    self.table.entry_mut(idx).dpm_entry = Some(slot);
                    dpm.update(slot, |record| {
                        record
                            .set_physical_id(wwid)
                            .set_phy_bits(0)
                            .set_device_index(idx)
                            .set_slot_count(1)
                            .set_missing_count(0);
                    });
                }
                None => warn!(
                    self.log,
                    "persistent table full, volume {:#018x} not persisted",
                    wwid
                ),
            }
        }
        Ok(TargetId(idx))
    }

    /// Drop enclosures that aged out completely: flagged for removal, init
    /// bookkeeping settled, no remaining live handles, and missing count
    /// saturated.  Their ranges and persistent records are zeroed and the
    /// array compacts so iteration order stays index order.
    fn clear_removed_enclosures(&mut self) {
        let mut idx = 0;
        while idx < self.enclosures.len() {
            let entry = self.enclosures.get(idx);
            let devices_gone = match entry.slot_range() {
                Some(range) => {
                    range.clone().all(|i| self.table.entry(i).dev_handle == 0)
                }
                None => true,
            };
            let gone = entry.removal_flag
                && entry.init_complete
                && entry.missing_count >= MAX_MISSING_COUNT
                && devices_gone;
            if !gone {
                idx += 1;
                continue;
            }
            let entry = self.enclosures.remove(idx);
            info!(
                self.log,
                "removing enclosure {:#018x} (missing {})",
                entry.enclosure_id,
                entry.missing_count
            );
            if let Some(range) = entry.slot_range() {
                for slot in range {
                    self.table.entry_mut(slot).clear();
                }
            }
            if let (Some(dpm), Some(slot)) =
                (self.dpm.as_mut(), entry.dpm_entry)
            {
                dpm.clear_entry(slot);
            }
        }
    }
}
