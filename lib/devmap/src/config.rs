// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-controller mapping configuration.
//!
//! The driver reads these values out of its own config surface (firmware IOC
//! facts and tunables) and hands them to [`crate::IdentityMap`] at attach
//! time; they are fixed for the life of the controller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_devices must be nonzero")]
    NoDevices,

    #[error(
        "{reserved} reserved entries leave no device slots \
         in a {max_devices}-entry table"
    )]
    NoDeviceRange { reserved: u16, max_devices: u16 },
}

/// How physical devices are bound to target ids.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MappingMode {
    /// A device's id is derived from its enclosure's reserved slot range
    /// plus its bay number; the enclosure is the persisted unit.
    EnclosureSlot,
    /// Each device is persisted individually, keyed by its SAS address.
    DevicePersistence,
}

/// Which end of the mapping table holds the reserved RAID-volume range.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum VolumeMappingRange {
    Low,
    High,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MappingConfig {
    /// Mapping-table capacity; target ids are `0..max_devices`.
    pub max_devices: u16,
    pub max_enclosures: u16,
    /// Size of the reserved RAID-volume id range.
    pub max_volumes: u16,
    /// Capacity of the firmware-resident persistent table.
    pub max_dpm_entries: u16,
    pub mapping_mode: MappingMode,
    /// Keep target id zero out of circulation (some initiators claim it).
    pub reserve_target_id_zero: bool,
    pub volume_mapping_range: VolumeMappingRange,
    pub persistence_enabled: bool,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            max_devices: 256,
            max_enclosures: 16,
            max_volumes: 2,
            max_dpm_entries: 128,
            mapping_mode: MappingMode::EnclosureSlot,
            reserve_target_id_zero: true,
            volume_mapping_range: VolumeMappingRange::High,
            persistence_enabled: true,
        }
    }
}

impl MappingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_devices == 0 {
            return Err(ConfigError::NoDevices);
        }
        let reserved =
            self.max_volumes as u32 + u32::from(self.reserve_target_id_zero);
        if reserved >= self.max_devices as u32 {
            return Err(ConfigError::NoDeviceRange {
                reserved: reserved as u16,
                max_devices: self.max_devices,
            });
        }
        Ok(())
    }

    /// First index the allocator may hand to a device or volume.
    pub(crate) fn first_usable_index(&self) -> u16 {
        u16::from(self.reserve_target_id_zero)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MappingConfig::default().validate().is_ok());
    }

    #[test]
    fn reserved_entries_must_leave_device_slots() {
        let config = MappingConfig {
            max_devices: 4,
            max_volumes: 4,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoDeviceRange { reserved: 5, max_devices: 4 })
        ));
    }

    #[test]
    fn parses_driver_config_section() {
        let config: MappingConfig = toml::from_str(
            r#"
            max_devices = 64
            max_volumes = 2
            mapping_mode = "device-persistence"
            volume_mapping_range = "low"
            persistence_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.max_devices, 64);
        assert_eq!(config.mapping_mode, MappingMode::DevicePersistence);
        assert_eq!(config.volume_mapping_range, VolumeMappingRange::Low);
        assert!(!config.persistence_enabled);
        // unspecified fields keep their defaults
        assert_eq!(config.max_enclosures, 16);
    }
}
