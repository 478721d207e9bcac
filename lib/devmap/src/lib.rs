// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stable target-id assignment for a SAS/SATA/RAID host bus adapter.
//!
//! Firmware reports devices, enclosures, and RAID volumes by transient
//! handles; the rest of the driver addresses them by small, stable target
//! ids.  This crate owns the translation: a capacity-bounded mapping table
//! with age-based eviction, an enclosure table with contiguous slot-range
//! reservation and defragmentation, and a best-effort mirror of both in a
//! firmware-resident persistent page so ids survive power cycles.
//!
//! All mutation entry points live on [`IdentityMap`] and are `&mut self`:
//! the caller serializes event batches (one firmware reply queue), and this
//! layer runs each batch to completion with no internal locking.

pub mod bits;
pub mod config;
pub mod dpm;
pub mod enclosure;
pub mod events;
pub mod reconcile;
pub mod table;


pub use config::{MappingConfig, MappingMode, VolumeMappingRange};
pub use reconcile::{BatchOutcome, IdentityMap, MapError, RemovalEntry};
pub use table::{Channel, TargetId};

/// Firmware device handle.  Zero is never a valid handle; it marks a device
/// that is currently absent.
pub type DevHandle = u16;
