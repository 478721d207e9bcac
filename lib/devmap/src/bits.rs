// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitflags::bitflags;

bitflags! {
    /// Capability and reservation bits carried per mapping-table entry.
    ///
    /// The low reservation bits are owned by this layer; the capability bits
    /// are copied through from the firmware's device page and consumed by
    /// the SCSI/ATA layers above.
    #[repr(transparent)]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceInfo: u32 {
        /// Entry holds a live, addressable identity.
        const IN_USE = 1 << 0;
        /// Entry may not be handed out by the free-index search: target id
        /// zero, or a slot owned by an enclosure's reserved range.
        const RESERVED = 1 << 1;

        const END_DEVICE = 1 << 2;
        const SATA_DEVICE = 1 << 3;
        const SSP_TARGET = 1 << 4;
        const STP_TARGET = 1 << 5;
        const SMP_TARGET = 1 << 6;
        const DIRECT_ATTACHED = 1 << 7;
    }
}

/// Saturation point for consecutive "not responding" observations.  An entry
/// that reaches this count is permanently stale (and the preferred eviction
/// victim) until the same identity is explicitly re-added.
pub const MAX_MISSING_COUNT: u8 = 0x0f;

/// Transport Layer Retries capability, carried through the mapping table
/// untouched for the command layer.
pub const TLR_SUPPORTED: u8 = 0x01;
pub const TLR_ENABLED: u8 = 0x02;
