// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware event inputs and the collaborator seams this layer calls out
//! through.  Everything crossing the boundary is a value type; the event
//! structs are decoded from the wire by the driver's reply-queue code before
//! they get here.

use thiserror::Error;

use crate::bits::DeviceInfo;
use crate::DevHandle;

/// Why a phy shows up in a topology change list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum TopoReason {
    Added,
    NotResponding,
}

#[derive(Copy, Clone, Debug)]
pub struct PhyEntry {
    pub dev_handle: DevHandle,
    pub reason: TopoReason,
}

/// One expander/enclosure topology change, covering a batch of phys.
#[derive(Clone, Debug)]
pub struct TopologyChangeEvent {
    pub enclosure_handle: DevHandle,
    pub expander_handle: DevHandle,
    pub entries: Vec<PhyEntry>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum EnclosureReason {
    Added,
    NotResponding,
}

#[derive(Clone, Debug)]
pub struct EnclosureStatusEvent {
    pub enclosure_handle: DevHandle,
    /// Enclosure logical (world-wide) id.
    pub logical_id: u64,
    pub num_slots: u16,
    /// Bay number of the enclosure's first slot.
    pub start_slot: u16,
    pub phy_bits: u32,
    pub reason: EnclosureReason,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum IrReason {
    Added,
    Removed,
    VolumeCreated,
    VolumeDeleted,
    NoChange,
}

#[derive(Copy, Clone, Debug)]
pub struct IrElement {
    pub reason: IrReason,
    pub volume_handle: DevHandle,
}

/// One Integrated-RAID configuration change batch.
#[derive(Clone, Debug, Default)]
pub struct IrConfigChangeEvent {
    pub elements: Vec<IrElement>,
}

/// Identity attributes the firmware reports for a device handle.
#[derive(Copy, Clone, Debug)]
pub struct DeviceDescriptor {
    pub sas_address: u64,
    /// Bay number within the owning enclosure.
    pub slot: u16,
    pub device_info: DeviceInfo,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no device for handle {0:#06x}")]
    NotFound(DevHandle),
}

/// Device-identity queries answered by the driver's config-page machinery.
///
/// Calls are synchronous firmware round trips; the reconciler issues them
/// one at a time from inside a batch and treats `NotFound` as "this element
/// vanished between the event and the query".
pub trait DeviceDirectory {
    fn get_device_info(
        &self,
        handle: DevHandle,
    ) -> Result<DeviceDescriptor, DirectoryError>;

    /// Stable SAS address for a SATA end device.  A SATA drive behind a
    /// bridge has no SAS address of its own; the directory synthesizes one
    /// from the drive's identify data.
    fn resolve_sata_sas_address(
        &self,
        handle: DevHandle,
        device_info: DeviceInfo,
    ) -> Result<u64, DirectoryError>;

    fn get_volume_wwid(
        &self,
        volume_handle: DevHandle,
    ) -> Result<u64, DirectoryError>;
}
